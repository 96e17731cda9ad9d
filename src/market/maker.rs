//! Boot-time liquidity seeding: a symmetric ladder of limit orders around
//! the mid price, spread scaled by volatility, size growing with depth.

use chrono::Utc;
use uuid::Uuid;

use crate::models::{Order, OrderSide, OrderStatus, OrderType};

/// Reserved agent id owning all seeded liquidity.
pub const MARKET_MAKER_AGENT_ID: &str = "agent-market-maker";

#[derive(Debug, Clone)]
pub struct MarketMaker {
    pub levels: usize,
    pub base_qty: i64,
}

impl MarketMaker {
    pub fn new(levels: usize, base_qty: i64) -> Self {
        Self { levels, base_qty }
    }

    /// Per-level half-spread as a fraction of mid. Higher volatility quotes
    /// wider; clamped so thin symbols still get a usable book.
    fn level_spread(volatility: f64) -> f64 {
        (volatility * 0.02).clamp(0.002, 0.05)
    }

    /// Build the ladder for one symbol. Both sides get `levels` limit
    /// orders; deeper levels carry more quantity.
    pub fn ladder(&self, symbol: &str, mid: f64, volatility: f64, tick: i64) -> Vec<Order> {
        if mid <= 0.0 {
            return Vec::new();
        }

        let step = Self::level_spread(volatility);
        let mut orders = Vec::with_capacity(self.levels * 2);

        for i in 1..=self.levels {
            let offset = step * i as f64;
            let qty = self.base_qty * i as i64;

            let bid_price = (mid * (1.0 - offset) * 100.0).round() / 100.0;
            let ask_price = (mid * (1.0 + offset) * 100.0).round() / 100.0;
            if bid_price <= 0.0 || ask_price <= bid_price {
                continue;
            }

            for (side, price) in [(OrderSide::Buy, bid_price), (OrderSide::Sell, ask_price)] {
                orders.push(Order {
                    id: Uuid::new_v4().to_string(),
                    agent_id: MARKET_MAKER_AGENT_ID.to_string(),
                    symbol: symbol.to_string(),
                    side,
                    order_type: OrderType::Limit,
                    quantity: qty,
                    limit_price: Some(price),
                    stop_price: None,
                    filled_quantity: 0,
                    avg_fill_price: 0.0,
                    status: OrderStatus::Open,
                    tick_submitted: tick,
                    tick_filled: None,
                    created_at: Utc::now(),
                });
            }
        }

        orders
    }
}
