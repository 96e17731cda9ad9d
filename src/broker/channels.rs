//! Channel names, message envelopes, and wire payload shapes.
//!
//! Field names on wire payloads are camelCase: that is the published
//! contract consumed by the gateway and browser subscribers.

use serde::{Deserialize, Serialize};

use crate::models::{MarketEvent, NewsArticle, Trade};

pub const CHANNEL_TICK_UPDATES: &str = "channel:tick_updates";
pub const CHANNEL_PRICES: &str = "channel:prices";
pub const CHANNEL_TRADES: &str = "channel:trades";
pub const CHANNEL_NEWS: &str = "channel:news";
pub const CHANNEL_LEADERBOARD: &str = "channel:leaderboard";
pub const CHANNEL_HEARTBEAT: &str = "channel:engine_heartbeat";
pub const CHANNEL_CALLBACK_CONFIRMED: &str = "channel:agent_callback_confirmed";

pub fn market_channel(symbol: &str) -> String {
    format!("channel:market:{symbol}")
}

pub fn agent_channel(agent_id: &str) -> String {
    format!("channel:agent:{agent_id}")
}

// Broker key layout.
pub const KEY_CURRENT_TICK: &str = "tick:current";
pub const KEY_GLOBAL_SEQUENCE: &str = "sequence:global";
pub const KEY_HEARTBEAT: &str = "engine:heartbeat";
pub const KEY_TICK_RECORDS: &str = "tick:records";

pub fn price_key(symbol: &str) -> String {
    format!("price:{symbol}")
}

pub fn rate_limit_key(agent_id: &str, action: &str) -> String {
    format!("ratelimit:{agent_id}:{action}")
}

pub fn lock_key(resource: &str) -> String {
    format!("lock:{resource}")
}

/// Message type tag carried in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    TickUpdate,
    PriceUpdate,
    MarketUpdate,
    Trade,
    News,
    LeaderboardUpdate,
    OrderUpdate,
    OrderFilled,
    Investigation,
    MarketStatus,
    Heartbeat,
    CallbackConfirmed,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TickUpdate => "TICK_UPDATE",
            MessageType::PriceUpdate => "PRICE_UPDATE",
            MessageType::MarketUpdate => "MARKET_UPDATE",
            MessageType::Trade => "TRADE",
            MessageType::News => "NEWS",
            MessageType::LeaderboardUpdate => "LEADERBOARD_UPDATE",
            MessageType::OrderUpdate => "ORDER_UPDATE",
            MessageType::OrderFilled => "ORDER_FILLED",
            MessageType::Investigation => "INVESTIGATION",
            MessageType::MarketStatus => "MARKET_STATUS",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::CallbackConfirmed => "CALLBACK_CONFIRMED",
        }
    }
}

/// Envelope published on every channel. Sequenced channels carry a strictly
/// increasing `sequence`; the heartbeat channel publishes raw (no sequence).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    /// ISO-8601 UTC.
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
}

/// One symbol's price change for this tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    pub volume: i64,
}

/// Full tick payload for `channel:tick_updates`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickUpdatePayload {
    pub tick: i64,
    pub timestamp: String,
    pub market_open: bool,
    pub regime: String,
    pub price_updates: Vec<PriceUpdate>,
    pub trades: Vec<Trade>,
    pub events: Vec<MarketEvent>,
    pub news: Vec<NewsArticle>,
}

/// Compact payload for `channel:prices`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricesPayload {
    pub tick: i64,
    pub prices: Vec<PriceUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradesPayload {
    pub tick: i64,
    pub trades: Vec<Trade>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub agent_id: String,
    pub name: String,
    pub role: String,
    pub status: String,
    pub net_worth: f64,
    pub change_24h: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardPayload {
    pub timestamp: String,
    pub entries: Vec<LeaderboardEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketStatusPayload {
    pub tick: i64,
    pub market_open: bool,
}

/// Per-agent order status notification (resting, rejection).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdatePayload {
    pub order_id: String,
    pub symbol: String,
    pub status: String,
    pub filled_quantity: i64,
}

/// Inbound on `channel:agent_callback_confirmed` (published by the gateway).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackConfirmedPayload {
    pub agent_id: String,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_wire_shape() {
        let env = Envelope {
            message_type: MessageType::PriceUpdate,
            payload: serde_json::json!({"tick": 7}),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            sequence: Some(42),
        };
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "PRICE_UPDATE");
        assert_eq!(v["sequence"], 42);

        let raw = Envelope {
            sequence: None,
            ..env
        };
        let v = serde_json::to_value(&raw).unwrap();
        assert!(v.get("sequence").is_none());
    }

    #[test]
    fn channel_names_match_contract() {
        assert_eq!(market_channel("AAPL"), "channel:market:AAPL");
        assert_eq!(agent_channel("a1"), "channel:agent:a1");
        assert_eq!(rate_limit_key("a1", "BUY"), "ratelimit:a1:BUY");
    }
}
