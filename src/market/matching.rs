//! The matching engine: walks the opposite side of the book producing fills
//! at resting prices, rests residual limit quantity, and reports which
//! resting orders were touched so their persisted status can be updated.

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::market::book::{BookOrder, BookSet, OrderBook};
use crate::models::{Order, OrderSide, OrderStatus, OrderType, Trade};

/// Per-resting-order aggregation over one `submit` call: total quantity
/// filled here and the volume-weighted average price of those touches.
#[derive(Debug, Clone)]
pub struct RestingUpdate {
    pub order_id: String,
    pub agent_id: String,
    pub filled_quantity: i64,
    pub avg_price: f64,
    /// True when the resting order has nothing left on the book.
    pub exhausted: bool,
}

/// Outcome of submitting one order.
#[derive(Debug, Clone)]
pub struct SubmitResult {
    pub fills: Vec<Trade>,
    pub remaining: i64,
    pub resting_updates: Vec<RestingUpdate>,
    /// Status for the incoming order per the monotone status machine.
    pub status: OrderStatus,
}

impl SubmitResult {
    fn untouched(order: &Order) -> Self {
        Self {
            fills: Vec::new(),
            remaining: order.remaining(),
            resting_updates: Vec::new(),
            status: order.status,
        }
    }
}

/// Single-owner matching engine; the tick scheduler drives it serially.
#[derive(Debug, Default)]
pub struct MatchingEngine {
    books: BookSet,
    current_tick: i64,
}

impl MatchingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tick(&mut self, tick: i64) {
        self.current_tick = tick;
    }

    pub fn register_symbol(&mut self, symbol: &str) {
        self.books.create(symbol);
    }

    pub fn book(&self, symbol: &str) -> Option<&OrderBook> {
        self.books.get(symbol)
    }

    pub fn books(&self) -> &BookSet {
        &self.books
    }

    pub fn best_bid_ask(&self, symbol: &str) -> (Option<f64>, Option<f64>) {
        match self.books.get(symbol) {
            Some(book) => (book.best_bid(), book.best_ask()),
            None => (None, None),
        }
    }

    pub fn mid_price(&self, symbol: &str, fallback: f64) -> f64 {
        self.books
            .get(symbol)
            .map(|b| b.mid_price(fallback))
            .unwrap_or(fallback)
    }

    /// Σ price·quantity per side.
    pub fn depth(&self, symbol: &str) -> (f64, f64) {
        self.books.get(symbol).map(|b| b.depth()).unwrap_or((0.0, 0.0))
    }

    pub fn clear_all(&mut self) {
        self.books.clear_all();
    }

    /// Insert LIMIT orders directly without matching. Startup seeding only.
    pub fn seed_liquidity(&mut self, orders: &[Order]) {
        for order in orders {
            let Some(price) = order.limit_price else {
                continue;
            };
            let Some(book) = self.books.get_mut(&order.symbol) else {
                continue;
            };
            book.insert(
                order.side,
                price,
                BookOrder {
                    order_id: order.id.clone(),
                    agent_id: order.agent_id.clone(),
                    unfilled: order.remaining(),
                },
            );
        }
    }

    /// Does the incoming order cross the given resting price?
    fn prices_cross(side: OrderSide, limit: f64, resting: f64) -> bool {
        match side {
            OrderSide::Buy => resting <= limit,
            OrderSide::Sell => resting >= limit,
        }
    }

    /// Submit an order per the frozen semantics. Unknown symbols are a
    /// silent no-op: no fills, original quantity back, status unchanged.
    pub fn submit(&mut self, order: &Order) -> SubmitResult {
        if self.books.get(&order.symbol).is_none() {
            debug!(symbol = %order.symbol, order_id = %order.id, "unknown symbol, order untouched");
            return SubmitResult::untouched(order);
        }

        let mut remaining = order.remaining();
        let mut fills: Vec<Trade> = Vec::new();
        // (filled_qty, price*qty volume) per touched resting order, in touch order.
        let mut touched: Vec<(String, String, i64, f64, bool)> = Vec::new();

        let tick = self.current_tick;
        let book = self.books.get_mut(&order.symbol).expect("checked above");
        let opposite = order.side.opposite();

        while remaining > 0 {
            let levels = match opposite {
                OrderSide::Buy => &mut book.bids,
                OrderSide::Sell => &mut book.asks,
            };
            let Some(level) = levels.first_mut() else {
                break;
            };

            if order.order_type == OrderType::Limit {
                let limit = order.limit_price.unwrap_or(0.0);
                if !Self::prices_cross(order.side, limit, level.price) {
                    break;
                }
            }

            let level_price = level.price;
            let Some(head) = level.orders.front_mut() else {
                // Defensively drop a level with an empty queue.
                levels.remove(0);
                continue;
            };

            let fill_qty = remaining.min(head.unfilled);
            head.unfilled -= fill_qty;
            remaining -= fill_qty;
            level.quantity -= fill_qty;

            let resting_id = head.order_id.clone();
            let resting_agent = head.agent_id.clone();
            let exhausted = head.unfilled == 0;

            let (buyer_agent, seller_agent, buyer_order, seller_order) = match order.side {
                OrderSide::Buy => (
                    order.agent_id.clone(),
                    resting_agent.clone(),
                    order.id.clone(),
                    resting_id.clone(),
                ),
                OrderSide::Sell => (
                    resting_agent.clone(),
                    order.agent_id.clone(),
                    resting_id.clone(),
                    order.id.clone(),
                ),
            };

            fills.push(Trade {
                id: Uuid::new_v4().to_string(),
                symbol: order.symbol.clone(),
                buyer_agent_id: buyer_agent,
                seller_agent_id: seller_agent,
                buyer_order_id: buyer_order,
                seller_order_id: seller_order,
                price: level_price,
                quantity: fill_qty,
                tick,
                executed_at: Utc::now(),
            });

            touched.push((
                resting_id,
                resting_agent,
                fill_qty,
                level_price * fill_qty as f64,
                exhausted,
            ));

            if exhausted {
                level.orders.pop_front();
            }
            if level.orders.is_empty() {
                levels.remove(0);
            }
        }

        // Rest residual limit quantity on the same side, FIFO at its price.
        if remaining > 0 && order.order_type == OrderType::Limit {
            if let Some(price) = order.limit_price {
                book.insert(
                    order.side,
                    price,
                    BookOrder {
                        order_id: order.id.clone(),
                        agent_id: order.agent_id.clone(),
                        unfilled: remaining,
                    },
                );
            }
        }

        // Aggregate touches per resting order (an order can be hit at most
        // once per call given FIFO pops, but keep the aggregation honest).
        let mut resting_updates: Vec<RestingUpdate> = Vec::new();
        for (order_id, agent_id, qty, volume, exhausted) in touched {
            match resting_updates.iter_mut().find(|u| u.order_id == order_id) {
                Some(u) => {
                    let total_volume = u.avg_price * u.filled_quantity as f64 + volume;
                    u.filled_quantity += qty;
                    u.avg_price = total_volume / u.filled_quantity as f64;
                    u.exhausted = u.exhausted || exhausted;
                }
                None => resting_updates.push(RestingUpdate {
                    order_id,
                    agent_id,
                    filled_quantity: qty,
                    avg_price: volume / qty as f64,
                    exhausted,
                }),
            }
        }

        let any_filled = !fills.is_empty();
        let status = if remaining == 0 {
            OrderStatus::Filled
        } else if any_filled {
            OrderStatus::Partial
        } else if order.order_type == OrderType::Limit {
            OrderStatus::Open
        } else {
            // MARKET with no liquidity stays pending for retry next tick.
            OrderStatus::Pending
        };

        SubmitResult {
            fills,
            remaining,
            resting_updates,
            status,
        }
    }

    /// Cancel a resting order: linear scan across both sides, aggregate
    /// quantity adjusted, empty level removed.
    pub fn cancel(&mut self, symbol: &str, order_id: &str) -> bool {
        match self.books.get_mut(symbol) {
            Some(book) => book.remove_order(order_id).is_some(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(
        id: &str,
        agent: &str,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        qty: i64,
        limit: Option<f64>,
    ) -> Order {
        Order {
            id: id.to_string(),
            agent_id: agent.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity: qty,
            limit_price: limit,
            stop_price: None,
            filled_quantity: 0,
            avg_fill_price: 0.0,
            status: OrderStatus::Pending,
            tick_submitted: 0,
            tick_filled: None,
            created_at: Utc::now(),
        }
    }

    fn engine_with(symbol: &str, seeds: &[(&str, OrderSide, i64, f64)]) -> MatchingEngine {
        let mut engine = MatchingEngine::new();
        engine.register_symbol(symbol);
        let orders: Vec<Order> = seeds
            .iter()
            .enumerate()
            .map(|(i, (agent, side, qty, price))| {
                order(
                    &format!("seed-{i}"),
                    agent,
                    symbol,
                    *side,
                    OrderType::Limit,
                    *qty,
                    Some(*price),
                )
            })
            .collect();
        engine.seed_liquidity(&orders);
        engine
    }

    #[test]
    fn limit_buy_crosses_and_fills_at_resting_price() {
        let mut engine = engine_with("AAPL", &[("maker", OrderSide::Sell, 100, 150.0)]);

        let incoming = order("o1", "taker", "AAPL", OrderSide::Buy, OrderType::Limit, 100, Some(151.0));
        let result = engine.submit(&incoming);

        assert_eq!(result.fills.len(), 1);
        let trade = &result.fills[0];
        // Fill price is the resting order's price, not the limit.
        assert_eq!(trade.price, 150.0);
        assert_eq!(trade.quantity, 100);
        assert_eq!(trade.buyer_agent_id, "taker");
        assert_eq!(trade.seller_agent_id, "maker");
        assert_eq!(result.remaining, 0);
        assert_eq!(result.status, OrderStatus::Filled);

        let book = engine.book("AAPL").unwrap();
        assert!(book.is_empty());
    }

    #[test]
    fn partial_fill_rests_residual_on_same_side() {
        let mut engine = engine_with("AAPL", &[("maker", OrderSide::Sell, 50, 150.0)]);

        let incoming = order("o1", "taker", "AAPL", OrderSide::Buy, OrderType::Limit, 100, Some(150.0));
        let result = engine.submit(&incoming);

        assert_eq!(result.fills.len(), 1);
        assert_eq!(result.fills[0].quantity, 50);
        assert_eq!(result.remaining, 50);
        assert_eq!(result.status, OrderStatus::Partial);

        let book = engine.book("AAPL").unwrap();
        assert!(book.asks.is_empty());
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.bids[0].price, 150.0);
        assert_eq!(book.bids[0].quantity, 50);

        // Cancel removes the residual.
        assert!(engine.cancel("AAPL", "o1"));
        assert!(engine.book("AAPL").unwrap().is_empty());
    }

    #[test]
    fn limit_respects_price_and_rests_when_uncrossed() {
        let mut engine = engine_with("AAPL", &[("maker", OrderSide::Sell, 100, 155.0)]);

        let incoming = order("o1", "taker", "AAPL", OrderSide::Buy, OrderType::Limit, 100, Some(150.0));
        let result = engine.submit(&incoming);

        assert!(result.fills.is_empty());
        assert_eq!(result.remaining, 100);
        assert_eq!(result.status, OrderStatus::Open);

        let book = engine.book("AAPL").unwrap();
        assert_eq!(book.best_bid(), Some(150.0));
        assert_eq!(book.best_ask(), Some(155.0));
        book.check_invariants().unwrap();
    }

    #[test]
    fn market_order_walks_levels_in_price_order() {
        let mut engine = engine_with(
            "AAPL",
            &[
                ("m1", OrderSide::Sell, 30, 151.0),
                ("m2", OrderSide::Sell, 30, 150.0),
                ("m3", OrderSide::Sell, 100, 152.0),
            ],
        );

        let incoming = order("o1", "taker", "AAPL", OrderSide::Buy, OrderType::Market, 80, None);
        let result = engine.submit(&incoming);

        let prices: Vec<f64> = result.fills.iter().map(|t| t.price).collect();
        assert_eq!(prices, vec![150.0, 151.0, 152.0]);
        let quantities: Vec<i64> = result.fills.iter().map(|t| t.quantity).collect();
        assert_eq!(quantities, vec![30, 30, 20]);
        assert_eq!(result.status, OrderStatus::Filled);

        let book = engine.book("AAPL").unwrap();
        assert_eq!(book.asks.len(), 1);
        assert_eq!(book.asks[0].quantity, 80);
        book.check_invariants().unwrap();
    }

    #[test]
    fn fifo_within_level() {
        let mut engine = engine_with(
            "AAPL",
            &[
                ("early", OrderSide::Sell, 40, 150.0),
                ("late", OrderSide::Sell, 40, 150.0),
            ],
        );

        let incoming = order("o1", "taker", "AAPL", OrderSide::Buy, OrderType::Market, 50, None);
        let result = engine.submit(&incoming);

        assert_eq!(result.fills.len(), 2);
        assert_eq!(result.fills[0].seller_agent_id, "early");
        assert_eq!(result.fills[0].quantity, 40);
        assert_eq!(result.fills[1].seller_agent_id, "late");
        assert_eq!(result.fills[1].quantity, 10);

        // The partially-touched late order remains with 30 unfilled.
        let book = engine.book("AAPL").unwrap();
        assert_eq!(book.asks[0].quantity, 30);
        assert_eq!(book.asks[0].orders[0].order_id, "seed-1");
    }

    #[test]
    fn market_with_no_liquidity_stays_pending() {
        let mut engine = engine_with("AAPL", &[]);

        let incoming = order("o1", "taker", "AAPL", OrderSide::Buy, OrderType::Market, 10, None);
        let result = engine.submit(&incoming);

        assert!(result.fills.is_empty());
        assert_eq!(result.remaining, 10);
        assert_eq!(result.status, OrderStatus::Pending);
    }

    #[test]
    fn unknown_symbol_is_silent_noop() {
        let mut engine = MatchingEngine::new();
        let incoming = order("o1", "taker", "NOPE", OrderSide::Buy, OrderType::Market, 10, None);
        let result = engine.submit(&incoming);

        assert!(result.fills.is_empty());
        assert_eq!(result.remaining, 10);
        assert_eq!(result.status, OrderStatus::Pending);
        assert!(!engine.cancel("NOPE", "o1"));
    }

    #[test]
    fn resting_updates_report_vwap_and_exhaustion() {
        let mut engine = engine_with(
            "AAPL",
            &[
                ("m1", OrderSide::Sell, 30, 150.0),
                ("m2", OrderSide::Sell, 70, 151.0),
            ],
        );

        let incoming = order("o1", "taker", "AAPL", OrderSide::Buy, OrderType::Market, 60, None);
        let result = engine.submit(&incoming);

        assert_eq!(result.resting_updates.len(), 2);
        let first = &result.resting_updates[0];
        assert_eq!(first.filled_quantity, 30);
        assert_eq!(first.avg_price, 150.0);
        assert!(first.exhausted);

        let second = &result.resting_updates[1];
        assert_eq!(second.filled_quantity, 30);
        assert_eq!(second.avg_price, 151.0);
        assert!(!second.exhausted);
    }

    #[test]
    fn book_never_crossed_after_matching() {
        let mut engine = engine_with(
            "AAPL",
            &[
                ("m1", OrderSide::Buy, 50, 149.0),
                ("m2", OrderSide::Sell, 50, 151.0),
            ],
        );

        // A limit buy above best ask sweeps it, residual rests as new bid.
        let incoming = order("o1", "taker", "AAPL", OrderSide::Buy, OrderType::Limit, 80, Some(152.0));
        let result = engine.submit(&incoming);
        assert_eq!(result.status, OrderStatus::Partial);

        let book = engine.book("AAPL").unwrap();
        book.check_invariants().unwrap();
        let (bid, ask) = (book.best_bid(), book.best_ask());
        assert_eq!(bid, Some(152.0));
        assert_eq!(ask, None);
    }
}
