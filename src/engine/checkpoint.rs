//! Checkpointing: periodic portfolio and world snapshots plus the rolling
//! per-tick event log that backs replay for briefly-disconnected
//! subscribers.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::broker::channels::{KEY_TICK_RECORDS, PriceUpdate};
use crate::broker::Broker;
use crate::market::matching::MatchingEngine;
use crate::market::pricing::PriceEngine;
use crate::models::{Holding, MarketEvent, NewsArticle, Trade};
use crate::store::EngineStore;

/// Shallow book level kept in world snapshots: no order identities, just
/// the ladder shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelSnapshot {
    pub price: f64,
    pub quantity: i64,
    pub order_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSnapshot {
    pub symbol: String,
    pub bids: Vec<LevelSnapshot>,
    pub asks: Vec<LevelSnapshot>,
}

/// The rolling per-tick record. The sequence window is (seq_start..=seq_end]
/// exclusive of the tick's opening read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickRecord {
    pub tick: i64,
    pub trades: Vec<Trade>,
    pub price_updates: Vec<PriceUpdate>,
    pub events: Vec<MarketEvent>,
    pub news: Vec<NewsArticle>,
    pub seq_start: i64,
    pub seq_end: i64,
}

/// Net worth: cash plus marked-to-market holdings (shorts subtract).
pub fn net_worth(cash: f64, holdings: &[Holding], prices: &HashMap<String, f64>) -> f64 {
    let positions: f64 = holdings
        .iter()
        .map(|h| prices.get(&h.symbol).copied().unwrap_or(h.avg_cost) * h.quantity as f64)
        .sum();
    cash + positions
}

/// Snapshot every agent's portfolio (50-tick cadence).
pub fn snapshot_portfolios(
    store: &EngineStore,
    prices: &HashMap<String, f64>,
    tick: i64,
) -> Result<usize> {
    let agents = store.list_agents()?;
    let mut rows = Vec::with_capacity(agents.len());
    for agent in &agents {
        let holdings = store.holdings_for_agent(&agent.id)?;
        let worth = net_worth(agent.cash, &holdings, prices);
        rows.push((
            agent.id.clone(),
            agent.cash,
            worth,
            serde_json::to_string(&holdings)?,
        ));
    }
    store.insert_portfolio_snapshots(tick, &rows)?;
    Ok(rows.len())
}

/// Snapshot the whole world: company state plus shallow books (100-tick
/// cadence).
pub fn snapshot_world(
    store: &EngineStore,
    pricing: &PriceEngine,
    matching: &MatchingEngine,
    tick: i64,
) -> Result<()> {
    let companies: Vec<_> = pricing.companies().cloned().collect();

    let mut books = Vec::new();
    for (symbol, book) in matching.books().iter() {
        let shallow = |levels: &[crate::market::book::PriceLevel]| {
            levels
                .iter()
                .map(|l| LevelSnapshot {
                    price: l.price,
                    quantity: l.quantity,
                    order_count: l.order_count(),
                })
                .collect::<Vec<_>>()
        };
        books.push(BookSnapshot {
            symbol: symbol.clone(),
            bids: shallow(&book.bids),
            asks: shallow(&book.asks),
        });
    }
    books.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    store.insert_world_snapshot(
        tick,
        &serde_json::to_string(&companies)?,
        &serde_json::to_string(&books)?,
    )?;
    Ok(())
}

/// Persist the finalized tick record and mirror it into the broker's capped
/// replay list.
pub fn record_tick(
    store: &EngineStore,
    broker: &Broker,
    record: &TickRecord,
    retention_ticks: i64,
) -> Result<()> {
    let json = serde_json::to_string(record)?;
    store.insert_tick_record(
        record.tick,
        &json,
        record.seq_start,
        record.seq_end,
        retention_ticks,
    )?;
    broker.push_capped(KEY_TICK_RECORDS, json, retention_ticks.max(0) as usize);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Agent;

    #[test]
    fn net_worth_marks_shorts_against_the_agent() {
        let prices = HashMap::from([("AAPL".to_string(), 200.0)]);
        let long = vec![Holding {
            agent_id: "a".to_string(),
            symbol: "AAPL".to_string(),
            quantity: 10,
            avg_cost: 150.0,
        }];
        let short = vec![Holding {
            agent_id: "a".to_string(),
            symbol: "AAPL".to_string(),
            quantity: -10,
            avg_cost: 150.0,
        }];

        assert_eq!(net_worth(1000.0, &long, &prices), 3000.0);
        assert_eq!(net_worth(1000.0, &short, &prices), -1000.0);
        // Unknown price falls back to cost basis.
        assert_eq!(net_worth(0.0, &long, &HashMap::new()), 1500.0);
    }

    #[test]
    fn portfolio_snapshots_round_trip() {
        let store = EngineStore::open_in_memory().unwrap();
        store.upsert_agent(&Agent::new("a1", "Alice", 5000.0)).unwrap();
        store
            .set_holding(&Holding {
                agent_id: "a1".to_string(),
                symbol: "AAPL".to_string(),
                quantity: 10,
                avg_cost: 100.0,
            })
            .unwrap();

        let prices = HashMap::from([("AAPL".to_string(), 120.0)]);
        let written = snapshot_portfolios(&store, &prices, 50).unwrap();
        assert_eq!(written, 1);

        let worth = store.snapshot_net_worth_at("a1", 60).unwrap().unwrap();
        assert!((worth - 6200.0).abs() < 1e-6);
        assert!(store.snapshot_net_worth_at("a1", 49).unwrap().is_none());
    }

    #[test]
    fn tick_record_mirrors_into_broker_list() {
        let store = EngineStore::open_in_memory().unwrap();
        let broker = Broker::new();
        for tick in 0..5 {
            let record = TickRecord {
                tick,
                trades: Vec::new(),
                price_updates: Vec::new(),
                events: Vec::new(),
                news: Vec::new(),
                seq_start: tick * 10,
                seq_end: tick * 10 + 3,
            };
            record_tick(&store, &broker, &record, 3).unwrap();
        }

        // Store pruned to retention.
        assert!(store.tick_record(0).unwrap().is_none());
        assert!(store.tick_record(4).unwrap().is_some());

        // Broker mirror keeps the most recent entries, newest first.
        let mirrored = broker.list_range(KEY_TICK_RECORDS, 10);
        assert_eq!(mirrored.len(), 3);
        let newest: TickRecord = serde_json::from_str(&mirrored[0]).unwrap();
        assert_eq!(newest.tick, 4);
    }
}
