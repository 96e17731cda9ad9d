//! End-to-end scenarios driving `TickEngine::run_tick()` directly against a
//! real store, the in-process broker, and a scripted webhook transport.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use wss_engine::broker::channels::{CHANNEL_PRICES, CHANNEL_TICK_UPDATES, KEY_HEARTBEAT};
use wss_engine::broker::Broker;
use wss_engine::engine::heartbeat::{publish_heartbeat, EngineShared, HeartbeatPayload};
use wss_engine::engine::TickEngine;
use wss_engine::models::{
    Agent, Company, Holding, Order, OrderSide, OrderStatus, OrderType, Sector,
};
use wss_engine::webhook::{WebhookResponse, WebhookTransport};
use wss_engine::{EngineConfig, EngineStore};

/// Scripted transport: per-URL response bodies, every request recorded.
struct ScriptedTransport {
    responses: Mutex<HashMap<String, String>>,
    requests: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn respond(&self, url: &str, body: &str) {
        self.responses.lock().insert(url.to_string(), body.to_string());
    }

    fn requests_for(&self, url: &str) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl WebhookTransport for ScriptedTransport {
    async fn deliver(&self, url: &str, body: &str, _signature: &str) -> Result<WebhookResponse> {
        self.requests.lock().push((url.to_string(), body.to_string()));
        let body = self
            .responses
            .lock()
            .get(url)
            .cloned()
            .unwrap_or_else(|| "{}".to_string());
        Ok(WebhookResponse {
            status: 200,
            body,
            elapsed_ms: 1.0,
        })
    }
}

/// Deterministic config: no random walk, no events, market always open,
/// no boot liquidity.
fn quiet_config() -> EngineConfig {
    EngineConfig {
        events_enabled: false,
        weight_agent_pressure: 0.0,
        weight_random_walk: 0.0,
        weight_sector: 0.0,
        market_open_tick: 0,
        market_close_tick: 1_000_000,
        after_hours_ticks: 0,
        maker_levels: 0,
        rng_seed: Some(42),
        ..EngineConfig::default()
    }
}

struct Harness {
    engine: TickEngine,
    store: Arc<EngineStore>,
    broker: Arc<Broker>,
    transport: Arc<ScriptedTransport>,
}

fn harness(config: EngineConfig) -> Harness {
    let store = Arc::new(EngineStore::open_in_memory().unwrap());
    let broker = Arc::new(Broker::new());
    let transport = ScriptedTransport::new();

    store
        .upsert_company(&Company::new(
            "AAPL",
            "Apple Inc.",
            Sector::Technology,
            150.0,
            1_000_000,
            0.3,
            1.0,
        ))
        .unwrap();

    for id in ["buyer", "seller"] {
        store.upsert_agent(&Agent::new(id, id, 100_000.0)).unwrap();
    }

    let engine = TickEngine::new(config, store.clone(), broker.clone(), transport.clone()).unwrap();
    Harness {
        engine,
        store,
        broker,
        transport,
    }
}

fn limit_order(id: &str, agent: &str, side: OrderSide, qty: i64, price: f64) -> Order {
    Order {
        id: id.to_string(),
        agent_id: agent.to_string(),
        symbol: "AAPL".to_string(),
        side,
        order_type: OrderType::Limit,
        quantity: qty,
        limit_price: Some(price),
        stop_price: None,
        filled_quantity: 0,
        avg_fill_price: 0.0,
        status: OrderStatus::Pending,
        tick_submitted: 0,
        tick_filled: None,
        created_at: Utc::now(),
    }
}

fn market_order(id: &str, agent: &str, side: OrderSide, qty: i64) -> Order {
    Order {
        order_type: OrderType::Market,
        limit_price: None,
        ..limit_order(id, agent, side, qty, 0.0)
    }
}

#[tokio::test]
async fn cross_the_spread_limit_fills_and_clears_the_book() {
    let mut h = harness(quiet_config());

    // Tick 1: the resting SELL lands on the asks.
    h.store
        .insert_order(&limit_order("sell-1", "seller", OrderSide::Sell, 100, 150.0))
        .unwrap();
    h.engine.run_tick().await.unwrap();
    assert_eq!(
        h.store.get_order("sell-1").unwrap().unwrap().status,
        OrderStatus::Open
    );

    // Tick 2: the crossing LIMIT BUY fills it exactly.
    h.store
        .insert_order(&limit_order("buy-1", "buyer", OrderSide::Buy, 100, 150.0))
        .unwrap();
    h.engine.run_tick().await.unwrap();

    let trades = h.store.trades_since(0).unwrap();
    assert_eq!(trades.len(), 1);
    let trade = &trades[0];
    assert_eq!(trade.buyer_agent_id, "buyer");
    assert_eq!(trade.seller_agent_id, "seller");
    assert_eq!(trade.quantity, 100);
    assert_eq!(trade.price, 150.0);

    assert_eq!(
        h.store.get_order("buy-1").unwrap().unwrap().status,
        OrderStatus::Filled
    );
    assert_eq!(
        h.store.get_order("sell-1").unwrap().unwrap().status,
        OrderStatus::Filled
    );

    let book = h.engine.matching().book("AAPL").unwrap();
    assert!(book.bids.is_empty());
    assert!(book.asks.is_empty());

    // Conservation: cash moved by exactly price * quantity on both legs,
    // and holdings moved by +/- quantity.
    let buyer = h.store.get_agent("buyer").unwrap().unwrap();
    let seller = h.store.get_agent("seller").unwrap().unwrap();
    assert!((buyer.cash - 85_000.0).abs() < 1e-6);
    assert!((seller.cash - 115_000.0).abs() < 1e-6);
    assert_eq!(
        h.store.get_holding("buyer", "AAPL").unwrap().unwrap().quantity,
        100
    );
    assert_eq!(
        h.store.get_holding("seller", "AAPL").unwrap().unwrap().quantity,
        -100
    );
}

#[tokio::test]
async fn partial_fill_rests_residual_and_cancel_removes_it() {
    let mut h = harness(quiet_config());

    // Give the buyer a callback so the cancel can arrive via webhook.
    let mut buyer = h.store.get_agent("buyer").unwrap().unwrap();
    buyer.callback_url = Some("http://buyer/hook".to_string());
    buyer.webhook_secret = Some("shh".to_string());
    h.store.upsert_agent(&buyer).unwrap();

    h.store
        .insert_order(&limit_order("sell-1", "seller", OrderSide::Sell, 50, 150.0))
        .unwrap();
    h.engine.run_tick().await.unwrap();

    h.store
        .insert_order(&limit_order("buy-1", "buyer", OrderSide::Buy, 100, 150.0))
        .unwrap();
    h.engine.run_tick().await.unwrap();

    let trades = h.store.trades_since(0).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].quantity, 50);
    assert_eq!(trades[0].price, 150.0);

    let buy = h.store.get_order("buy-1").unwrap().unwrap();
    assert_eq!(buy.status, OrderStatus::Partial);
    assert_eq!(buy.filled_quantity, 50);

    let book = h.engine.matching().book("AAPL").unwrap();
    assert_eq!(book.bids.len(), 1);
    assert_eq!(book.bids[0].price, 150.0);
    assert_eq!(book.bids[0].quantity, 50);

    // The buyer cancels the residual through its webhook response.
    h.transport.respond(
        "http://buyer/hook",
        r#"{"actions":[{"type":"CANCEL_ORDER","order_id":"buy-1"}]}"#,
    );
    h.engine.run_tick().await.unwrap();

    assert_eq!(
        h.store.get_order("buy-1").unwrap().unwrap().status,
        OrderStatus::Cancelled
    );
    assert!(h.engine.matching().book("AAPL").unwrap().bids.is_empty());

    // The result of the cancel rides the next tick's payload.
    h.transport.respond("http://buyer/hook", "{}");
    h.engine.run_tick().await.unwrap();
    let bodies = h.transport.requests_for("http://buyer/hook");
    let last = bodies.last().unwrap();
    assert!(last.contains("actionResults"));
    assert!(last.contains("CANCEL_ORDER"));
}

#[tokio::test]
async fn buy_fills_use_weighted_average_cost() {
    let mut h = harness(quiet_config());

    // Existing position: 100 @ 100.
    h.store
        .set_holding(&Holding {
            agent_id: "buyer".to_string(),
            symbol: "AAPL".to_string(),
            quantity: 100,
            avg_cost: 100.0,
        })
        .unwrap();

    h.store
        .insert_order(&limit_order("sell-1", "seller", OrderSide::Sell, 100, 200.0))
        .unwrap();
    h.engine.run_tick().await.unwrap();

    h.store
        .insert_order(&market_order("buy-1", "buyer", OrderSide::Buy, 100))
        .unwrap();
    h.engine.run_tick().await.unwrap();

    let holding = h.store.get_holding("buyer", "AAPL").unwrap().unwrap();
    assert_eq!(holding.quantity, 200);
    assert!((holding.avg_cost - 150.0).abs() < 1e-9);
}

#[tokio::test]
async fn bare_sell_opens_a_short_at_fill_price() {
    let mut h = harness(quiet_config());

    h.store
        .insert_order(&limit_order("buy-1", "buyer", OrderSide::Buy, 100, 150.0))
        .unwrap();
    h.engine.run_tick().await.unwrap();

    h.store
        .insert_order(&market_order("sell-1", "seller", OrderSide::Sell, 100))
        .unwrap();
    h.engine.run_tick().await.unwrap();

    let holding = h.store.get_holding("seller", "AAPL").unwrap().unwrap();
    assert_eq!(holding.quantity, -100);
    assert!((holding.avg_cost - 150.0).abs() < 1e-9);
}

#[tokio::test]
async fn sequences_are_monotone_and_partitioned_by_tick() {
    let mut h = harness(quiet_config());
    let mut tick_rx = h.broker.subscribe(CHANNEL_TICK_UPDATES);
    let mut price_rx = h.broker.subscribe(CHANNEL_PRICES);

    // Some flow so ticks publish more than the minimum.
    h.store
        .insert_order(&limit_order("sell-1", "seller", OrderSide::Sell, 60, 150.0))
        .unwrap();
    h.engine.run_tick().await.unwrap();
    h.store
        .insert_order(&limit_order("buy-1", "buyer", OrderSide::Buy, 100, 150.0))
        .unwrap();
    h.engine.run_tick().await.unwrap();
    h.engine.run_tick().await.unwrap();

    // Per-subscriber strict monotonicity.
    let mut last = 0i64;
    let mut tick_update_count = 0;
    while let Ok(envelope) = tick_rx.try_recv() {
        if let Some(seq) = envelope.sequence {
            assert!(seq > last, "sequence went backwards: {seq} after {last}");
            last = seq;
        }
        tick_update_count += 1;
    }
    assert!(tick_update_count >= 3);

    let mut last = 0i64;
    while let Ok(envelope) = price_rx.try_recv() {
        let seq = envelope.sequence.unwrap();
        assert!(seq > last);
        last = seq;
    }

    // Every message of tick T precedes every message of tick T+1: the
    // recorded sequence windows must be disjoint and increasing.
    let mut previous_end = 0i64;
    for tick in 1..=3 {
        let (_, seq_start, seq_end) = h.store.tick_record(tick).unwrap().unwrap();
        assert!(seq_start > previous_end);
        assert!(seq_end >= seq_start);
        previous_end = seq_end;
    }
}

#[tokio::test]
async fn heartbeat_parses_and_stop_deletes_the_key() {
    let broker = Broker::new();
    let shared = EngineShared::new();
    shared.record_tick(7, true, 2.5);

    publish_heartbeat(&broker, &shared);
    let raw = broker.get_key(KEY_HEARTBEAT).unwrap();
    let payload: HeartbeatPayload = serde_json::from_str(&raw).unwrap();
    assert_eq!(payload.tick, 7);
    // ISO-8601 UTC.
    let parsed = chrono::DateTime::parse_from_rfc3339(&payload.timestamp).unwrap();
    assert!(parsed.timestamp() > 0);

    TickEngine::stop(&shared, &broker);
    assert!(broker.get_key(KEY_HEARTBEAT).is_none());
}

#[tokio::test]
async fn market_orders_without_liquidity_retry_next_tick() {
    let mut h = harness(quiet_config());

    h.store
        .insert_order(&market_order("buy-1", "buyer", OrderSide::Buy, 10))
        .unwrap();
    h.engine.run_tick().await.unwrap();

    // No liquidity yet: still pending.
    assert_eq!(
        h.store.get_order("buy-1").unwrap().unwrap().status,
        OrderStatus::Pending
    );

    // Liquidity arrives. The pending queue is FIFO, so the retried market
    // order runs before the new ask rests; it fills one tick later.
    h.store
        .insert_order(&limit_order("sell-1", "seller", OrderSide::Sell, 10, 151.0))
        .unwrap();
    h.engine.run_tick().await.unwrap();
    assert_eq!(
        h.store.get_order("buy-1").unwrap().unwrap().status,
        OrderStatus::Pending
    );
    h.engine.run_tick().await.unwrap();

    let order = h.store.get_order("buy-1").unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert!((order.avg_fill_price - 151.0).abs() < 1e-9);
}
