//! Interprets the action arrays agents return from their webhooks.
//!
//! Trading actions become pending orders picked up by the next tick's
//! matching phase; social/corruption actions mutate state directly. Every
//! action is audited, and every failure is reported back to the agent on
//! the next tick's webhook under `actionResults`.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;
use uuid::Uuid;

use crate::events::EventGenerator;
use crate::market::matching::MatchingEngine;
use crate::market::pricing::PriceEngine;
use crate::models::{
    ActionResult, AgentAction, AgentStatus, CrimeType, MarketEvent, Order, OrderSide, OrderStatus,
    OrderType,
};
use crate::sec::Detection;
use crate::store::EngineStore;
use crate::webhook::DispatchOutcome;

/// Chance a bribe draws regulatory attention.
const BRIBE_DETECTION_CHANCE: f64 = 0.25;

/// Everything one tick's worth of agent actions produced.
#[derive(Debug, Default)]
pub struct ActionOutcome {
    /// Per-agent results, delivered on the next tick's webhook.
    pub results: HashMap<String, Vec<ActionResult>>,
    /// Rumor-generated market events to inject into the price engine.
    pub events: Vec<MarketEvent>,
    /// Detections to fold into the investigation pipeline
    /// (whistleblower reports, bribes that drew attention).
    pub detections: Vec<Detection>,
}

#[derive(Debug, Default)]
pub struct ActionProcessor;

impl ActionProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Process every agent's response actions for this tick.
    pub fn process(
        &self,
        store: &EngineStore,
        matching: &mut MatchingEngine,
        pricing: &PriceEngine,
        tick: i64,
        rng: &mut ChaCha8Rng,
        responses: DispatchOutcome,
    ) -> Result<ActionOutcome> {
        let mut outcome = ActionOutcome::default();

        for (agent_id, raw_actions) in responses {
            let agent = store.get_agent(&agent_id)?;
            let results = outcome.results.entry(agent_id.clone()).or_default();

            for raw in raw_actions {
                let payload_json = raw.to_string();
                let action: AgentAction = match serde_json::from_value(raw.clone()) {
                    Ok(a) => a,
                    Err(e) => {
                        let kind = raw
                            .get("type")
                            .and_then(|v| v.as_str())
                            .unwrap_or("UNKNOWN")
                            .to_string();
                        let result = ActionResult::err(&kind, format!("invalid action: {e}"));
                        store.record_action(
                            &Uuid::new_v4().to_string(),
                            &agent_id,
                            tick,
                            &kind,
                            &payload_json,
                            &result.message,
                        )?;
                        results.push(result);
                        continue;
                    }
                };

                let result = match &agent {
                    Some(agent) if agent.status == AgentStatus::Active => self.apply(
                        store,
                        matching,
                        pricing,
                        tick,
                        rng,
                        &agent_id,
                        &action,
                        &mut outcome.events,
                        &mut outcome.detections,
                    )?,
                    Some(agent) => ActionResult::err(
                        action.kind(),
                        format!("agent is {}", agent.status.as_str()),
                    ),
                    None => ActionResult::err(action.kind(), "unknown agent"),
                };

                store.record_action(
                    &Uuid::new_v4().to_string(),
                    &agent_id,
                    tick,
                    action.kind(),
                    &payload_json,
                    &result.message,
                )?;
                results.push(result);
            }
        }

        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply(
        &self,
        store: &EngineStore,
        matching: &mut MatchingEngine,
        pricing: &PriceEngine,
        tick: i64,
        rng: &mut ChaCha8Rng,
        agent_id: &str,
        action: &AgentAction,
        events: &mut Vec<MarketEvent>,
        detections: &mut Vec<Detection>,
    ) -> Result<ActionResult> {
        let kind = action.kind();
        match action {
            AgentAction::Buy {
                symbol,
                quantity,
                limit_price,
            }
            | AgentAction::Cover {
                symbol,
                quantity,
                limit_price,
            } => self.submit_order(store, pricing, tick, agent_id, kind, symbol, OrderSide::Buy, *quantity, *limit_price),

            AgentAction::Sell {
                symbol,
                quantity,
                limit_price,
            } => self.submit_order(store, pricing, tick, agent_id, kind, symbol, OrderSide::Sell, *quantity, *limit_price),

            AgentAction::Short {
                symbol,
                quantity,
                limit_price,
            } => {
                // Shorts consume margin up front at the current price.
                if *quantity <= 0 {
                    return Ok(ActionResult::err(kind, "quantity must be positive"));
                }
                let Some(company) = pricing.company(symbol) else {
                    return Ok(ActionResult::err(kind, format!("unknown symbol {symbol}")));
                };
                let Some(agent) = store.get_agent(agent_id)? else {
                    return Ok(ActionResult::err(kind, "unknown agent"));
                };
                // Live short exposure, marked at current prices.
                let short_exposure: f64 = store
                    .holdings_for_agent(agent_id)?
                    .iter()
                    .filter(|h| h.quantity < 0)
                    .map(|h| {
                        let price = pricing.company(&h.symbol).map(|c| c.price).unwrap_or(h.avg_cost);
                        price * h.quantity.unsigned_abs() as f64
                    })
                    .sum();
                let exposure = company.price * *quantity as f64;
                if short_exposure + exposure > agent.margin_limit {
                    return Ok(ActionResult::err(
                        kind,
                        format!(
                            "margin limit exceeded: {:.2} + {:.2} > {:.2}",
                            short_exposure, exposure, agent.margin_limit
                        ),
                    ));
                }
                store.set_margin_used(agent_id, short_exposure + exposure)?;
                self.submit_order(store, pricing, tick, agent_id, kind, symbol, OrderSide::Sell, *quantity, *limit_price)
            }

            AgentAction::CancelOrder { order_id } => {
                let Some(order) = store.get_order(order_id)? else {
                    return Ok(ActionResult::err(kind, format!("unknown order {order_id}")));
                };
                if order.agent_id != agent_id {
                    return Ok(ActionResult::err(kind, "order belongs to another agent"));
                }
                if order.status.is_terminal() {
                    return Ok(ActionResult::err(
                        kind,
                        format!("order already {}", order.status.as_str()),
                    ));
                }
                matching.cancel(&order.symbol, order_id);
                // Pending orders never reached the book; the status machine
                // withdraws them through `rejected` instead of `cancelled`.
                let next = if order.status == OrderStatus::Pending {
                    OrderStatus::Rejected
                } else {
                    OrderStatus::Cancelled
                };
                if store.set_order_status(order_id, next)? {
                    Ok(ActionResult::ok(kind, format!("order {order_id} cancelled")))
                } else {
                    Ok(ActionResult::err(kind, "order could not be cancelled"))
                }
            }

            AgentAction::Rumor { symbol, content } => {
                let Some(company) = pricing.company(symbol) else {
                    return Ok(ActionResult::err(kind, format!("unknown symbol {symbol}")));
                };
                let positive = rng.gen_bool(0.5);
                let mut event = EventGenerator::rumor(tick, company, positive, rng);
                if let Some(text) = content {
                    if !text.trim().is_empty() {
                        event.headline = text.trim().to_string();
                    }
                }
                debug!(agent_id, symbol = %symbol, impact = event.impact, "rumor planted");
                events.push(event);
                Ok(ActionResult::ok(kind, format!("rumor circulating about {symbol}")))
            }

            AgentAction::Message { to, content } => {
                if store.get_agent(to)?.is_none() {
                    return Ok(ActionResult::err(kind, format!("unknown recipient {to}")));
                }
                if content.trim().is_empty() {
                    return Ok(ActionResult::err(kind, "empty message"));
                }
                Ok(ActionResult::ok(kind, format!("message delivered to {to}")))
            }

            AgentAction::Ally { with } => {
                if store.get_agent(with)?.is_none() {
                    return Ok(ActionResult::err(kind, format!("unknown agent {with}")));
                }
                if with == agent_id {
                    return Ok(ActionResult::err(kind, "cannot ally with yourself"));
                }
                Ok(ActionResult::ok(kind, format!("alliance proposed to {with}")))
            }

            AgentAction::Bribe { target, amount } => {
                if *amount <= 0.0 || !amount.is_finite() {
                    return Ok(ActionResult::err(kind, "bribe amount must be positive"));
                }
                // Atomic conditional deduction; insufficient cash never goes
                // negative.
                if !store.try_deduct_cash(agent_id, *amount)? {
                    return Ok(ActionResult::err(kind, "insufficient cash"));
                }
                if store.get_agent(target)?.is_some() {
                    store.add_cash(target, *amount)?;
                }
                if rng.gen::<f64>() < BRIBE_DETECTION_CHANCE {
                    detections.push(Detection {
                        agent_id: agent_id.to_string(),
                        crime_type: CrimeType::Bribery,
                        description: format!("suspicious payment of {amount:.2} to {target}"),
                    });
                }
                Ok(ActionResult::ok(kind, format!("paid {amount:.2} to {target}")))
            }

            AgentAction::Whistleblow { target } => {
                if store.get_agent(target)?.is_none() {
                    return Ok(ActionResult::err(kind, format!("unknown agent {target}")));
                }
                if target == agent_id {
                    return Ok(ActionResult::err(kind, "cannot whistleblow on yourself"));
                }
                detections.push(Detection {
                    agent_id: target.clone(),
                    crime_type: CrimeType::AccountingFraud,
                    description: format!("whistleblower report filed by {agent_id}"),
                });
                Ok(ActionResult::ok(kind, format!("report filed against {target}")))
            }

            AgentAction::Flee {} => {
                store.set_agent_status(agent_id, AgentStatus::Fled)?;
                Ok(ActionResult::ok(kind, "fled the jurisdiction"))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn submit_order(
        &self,
        store: &EngineStore,
        pricing: &PriceEngine,
        tick: i64,
        agent_id: &str,
        kind: &str,
        symbol: &str,
        side: OrderSide,
        quantity: i64,
        limit_price: Option<f64>,
    ) -> Result<ActionResult> {
        if quantity <= 0 {
            return Ok(ActionResult::err(kind, "quantity must be positive"));
        }
        if pricing.company(symbol).is_none() {
            return Ok(ActionResult::err(kind, format!("unknown symbol {symbol}")));
        }
        if let Some(price) = limit_price {
            if price <= 0.0 || !price.is_finite() {
                return Ok(ActionResult::err(kind, "limit price must be positive"));
            }
        }

        let order = Order {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: if limit_price.is_some() {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            quantity,
            limit_price,
            stop_price: None,
            filled_quantity: 0,
            avg_fill_price: 0.0,
            status: OrderStatus::Pending,
            tick_submitted: tick,
            tick_filled: None,
            created_at: Utc::now(),
        };
        store.insert_order(&order)?;
        Ok(ActionResult::ok(
            kind,
            format!("order {} accepted for {} {} {}", order.id, side.as_str(), quantity, symbol),
        ))
    }
}
