//! Trade surveillance over each tick's fills.
//!
//! Patterns: wash trading (self-crossing or repeated pair trading),
//! market manipulation (dominant share of a symbol's flow while its
//! manipulation score is elevated), and insider trading (positioned in the
//! profitable direction shortly before a high-impact event).

use std::collections::HashMap;

use crate::market::maker::MARKET_MAKER_AGENT_ID;
use crate::models::{Company, CrimeType, MarketEvent, OrderSide, Trade};

#[derive(Debug, Clone)]
pub struct Detection {
    pub agent_id: String,
    pub crime_type: CrimeType,
    pub description: String,
}

pub struct SecDetector {
    /// Fraction of a symbol's traded value one agent must exceed.
    pub manipulation_share_threshold: f64,
    /// Symbol manipulation score gate.
    pub manipulation_score_threshold: f64,
    /// Trades between the same agent pair in one tick before flagging.
    pub pair_trade_threshold: usize,
    /// Look-back for pre-event positioning, in ticks.
    pub insider_window: i64,
    /// Event |impact| gate for insider checks.
    pub insider_impact_threshold: f64,
}

impl Default for SecDetector {
    fn default() -> Self {
        Self {
            manipulation_share_threshold: 0.6,
            manipulation_score_threshold: 0.5,
            pair_trade_threshold: 3,
            insider_window: 5,
            insider_impact_threshold: 0.1,
        }
    }
}

impl SecDetector {
    pub fn new(insider_window: i64) -> Self {
        Self {
            insider_window,
            ..Self::default()
        }
    }

    /// Scan one tick. `trades` is this tick's fills; `recent_trades` covers
    /// the insider look-back window; `new_events` are events born this tick;
    /// `companies` supplies manipulation scores. Seeded market-maker flow is
    /// never implicated.
    pub fn detect(
        &self,
        tick: i64,
        trades: &[Trade],
        recent_trades: &[Trade],
        new_events: &[MarketEvent],
        companies: &HashMap<String, Company>,
    ) -> Vec<Detection> {
        let mut detections = Vec::new();
        detections.extend(self.detect_wash_trading(trades));
        detections.extend(self.detect_manipulation(trades, companies));
        detections.extend(self.detect_insider_trading(tick, recent_trades, new_events));
        detections
    }

    fn detect_wash_trading(&self, trades: &[Trade]) -> Vec<Detection> {
        let mut detections = Vec::new();
        let mut pair_counts: HashMap<(String, String), usize> = HashMap::new();

        for trade in trades {
            if trade.buyer_agent_id == MARKET_MAKER_AGENT_ID
                || trade.seller_agent_id == MARKET_MAKER_AGENT_ID
            {
                continue;
            }

            // Same agent on both sides of a fill.
            if trade.buyer_agent_id == trade.seller_agent_id {
                detections.push(Detection {
                    agent_id: trade.buyer_agent_id.clone(),
                    crime_type: CrimeType::WashTrading,
                    description: format!(
                        "self-crossed {} shares of {} at {:.2}",
                        trade.quantity, trade.symbol, trade.price
                    ),
                });
                continue;
            }

            let mut pair = [trade.buyer_agent_id.clone(), trade.seller_agent_id.clone()];
            pair.sort();
            *pair_counts
                .entry((pair[0].clone(), pair[1].clone()))
                .or_default() += 1;
        }

        for ((a, b), count) in pair_counts {
            if count >= self.pair_trade_threshold {
                let description =
                    format!("{count} trades between the same counterparties in one tick");
                for agent in [a, b] {
                    detections.push(Detection {
                        agent_id: agent,
                        crime_type: CrimeType::WashTrading,
                        description: description.clone(),
                    });
                }
            }
        }

        detections
    }

    fn detect_manipulation(
        &self,
        trades: &[Trade],
        companies: &HashMap<String, Company>,
    ) -> Vec<Detection> {
        // Per symbol: total traded value and per-agent participation.
        let mut totals: HashMap<&str, f64> = HashMap::new();
        let mut by_agent: HashMap<(&str, &str), f64> = HashMap::new();

        for trade in trades {
            let value = trade.value();
            *totals.entry(trade.symbol.as_str()).or_default() += value;
            for agent in [trade.buyer_agent_id.as_str(), trade.seller_agent_id.as_str()] {
                if agent == MARKET_MAKER_AGENT_ID {
                    continue;
                }
                *by_agent.entry((trade.symbol.as_str(), agent)).or_default() += value;
            }
        }

        let mut detections = Vec::new();
        for ((symbol, agent), value) in by_agent {
            let total = totals.get(symbol).copied().unwrap_or(0.0);
            if total <= 0.0 {
                continue;
            }
            let score = companies
                .get(symbol)
                .map(|c| c.manipulation_score)
                .unwrap_or(0.0);
            if value / total > self.manipulation_share_threshold
                && score > self.manipulation_score_threshold
            {
                detections.push(Detection {
                    agent_id: agent.to_string(),
                    crime_type: CrimeType::MarketManipulation,
                    description: format!(
                        "{:.0}% of {} flow with manipulation score {:.2}",
                        value / total * 100.0,
                        symbol,
                        score
                    ),
                });
            }
        }
        detections
    }

    fn detect_insider_trading(
        &self,
        tick: i64,
        recent_trades: &[Trade],
        new_events: &[MarketEvent],
    ) -> Vec<Detection> {
        let mut detections = Vec::new();

        for event in new_events {
            if event.impact.abs() < self.insider_impact_threshold {
                continue;
            }
            let Some(symbol) = event.symbol.as_deref() else {
                continue;
            };

            for trade in recent_trades {
                if trade.symbol != symbol {
                    continue;
                }
                // Strictly before the event, within the window.
                if trade.tick >= event.origin_tick || trade.tick < tick - self.insider_window {
                    continue;
                }

                let profitable_side = if event.impact > 0.0 {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                };
                let suspect = match profitable_side {
                    OrderSide::Buy => trade.buyer_agent_id.as_str(),
                    OrderSide::Sell => trade.seller_agent_id.as_str(),
                };
                if suspect == MARKET_MAKER_AGENT_ID {
                    continue;
                }

                detections.push(Detection {
                    agent_id: suspect.to_string(),
                    crime_type: CrimeType::InsiderTrading,
                    description: format!(
                        "positioned {} in {} {} ticks before {}",
                        profitable_side.as_str(),
                        symbol,
                        event.origin_tick - trade.tick,
                        event.event_type.as_str()
                    ),
                });
            }
        }

        detections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, Sector};
    use chrono::Utc;

    fn trade(symbol: &str, buyer: &str, seller: &str, price: f64, qty: i64, tick: i64) -> Trade {
        Trade {
            id: format!("t-{buyer}-{seller}-{tick}-{qty}"),
            symbol: symbol.to_string(),
            buyer_agent_id: buyer.to_string(),
            seller_agent_id: seller.to_string(),
            buyer_order_id: "bo".to_string(),
            seller_order_id: "so".to_string(),
            price,
            quantity: qty,
            tick,
            executed_at: Utc::now(),
        }
    }

    fn companies_with_score(symbol: &str, score: f64) -> HashMap<String, Company> {
        let mut company =
            Company::new(symbol, format!("{symbol} Corp"), Sector::Technology, 100.0, 1_000_000, 0.3, 1.0);
        company.manipulation_score = score;
        HashMap::from([(symbol.to_string(), company)])
    }

    #[test]
    fn self_cross_is_wash_trading() {
        let detector = SecDetector::default();
        let trades = vec![trade("AAPL", "a1", "a1", 100.0, 50, 1)];
        let detections = detector.detect(1, &trades, &[], &[], &HashMap::new());
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].crime_type, CrimeType::WashTrading);
        assert_eq!(detections[0].agent_id, "a1");
    }

    #[test]
    fn repeated_pair_trading_flags_both_agents() {
        let detector = SecDetector::default();
        let trades = vec![
            trade("AAPL", "a1", "a2", 100.0, 10, 1),
            trade("AAPL", "a2", "a1", 100.0, 10, 1),
            trade("AAPL", "a1", "a2", 100.0, 10, 1),
        ];
        let detections = detector.detect(1, &trades, &[], &[], &HashMap::new());
        let wash: Vec<&Detection> = detections
            .iter()
            .filter(|d| d.crime_type == CrimeType::WashTrading)
            .collect();
        assert_eq!(wash.len(), 2);
        let mut agents: Vec<&str> = wash.iter().map(|d| d.agent_id.as_str()).collect();
        agents.sort();
        assert_eq!(agents, vec!["a1", "a2"]);
    }

    #[test]
    fn market_maker_flow_is_never_implicated() {
        let detector = SecDetector::default();
        let trades = vec![
            trade("AAPL", "a1", MARKET_MAKER_AGENT_ID, 100.0, 10, 1),
            trade("AAPL", "a1", MARKET_MAKER_AGENT_ID, 100.0, 10, 1),
            trade("AAPL", "a1", MARKET_MAKER_AGENT_ID, 100.0, 10, 1),
            trade("AAPL", "a1", MARKET_MAKER_AGENT_ID, 100.0, 10, 1),
        ];
        let detections = detector.detect(1, &trades, &[], &[], &companies_with_score("AAPL", 0.0));
        assert!(detections.iter().all(|d| d.crime_type != CrimeType::WashTrading));
    }

    #[test]
    fn manipulation_needs_dominance_and_elevated_score() {
        let detector = SecDetector::default();
        let trades = vec![
            trade("PUMP", "whale", "a2", 100.0, 900, 1),
            trade("PUMP", "a3", "a4", 100.0, 100, 1),
        ];

        // Dominant share but calm score: nothing.
        let calm = detector.detect(1, &trades, &[], &[], &companies_with_score("PUMP", 0.1));
        assert!(calm.iter().all(|d| d.crime_type != CrimeType::MarketManipulation));

        // Dominant share plus elevated score: flagged.
        let hot = detector.detect(1, &trades, &[], &[], &companies_with_score("PUMP", 0.9));
        let manip: Vec<&Detection> = hot
            .iter()
            .filter(|d| d.crime_type == CrimeType::MarketManipulation)
            .collect();
        assert!(manip.iter().any(|d| d.agent_id == "whale"));
    }

    #[test]
    fn insider_detection_catches_pre_event_positioning() {
        let detector = SecDetector::default();
        let event = MarketEvent {
            id: "e1".to_string(),
            event_type: EventType::FdaApproval,
            symbol: Some("BIO".to_string()),
            sector: Some(Sector::Healthcare),
            impact: 0.2,
            duration_ticks: 10,
            origin_tick: 10,
            headline: "h".to_string(),
        };
        // Bought 3 ticks before a positive event: suspicious.
        let recent = vec![trade("BIO", "lucky", "other", 100.0, 100, 7)];
        let detections = detector.detect(10, &[], &recent, &[event.clone()], &HashMap::new());
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].crime_type, CrimeType::InsiderTrading);
        assert_eq!(detections[0].agent_id, "lucky");

        // Selling before a positive event is not the profitable direction.
        let recent = vec![trade("BIO", "other", "unlucky", 100.0, 100, 7)];
        let detections = detector.detect(10, &[], &recent, &[event], &HashMap::new());
        assert_eq!(detections[0].agent_id, "other");
    }

    #[test]
    fn insider_window_excludes_stale_trades() {
        let detector = SecDetector::default();
        let event = MarketEvent {
            id: "e1".to_string(),
            event_type: EventType::Scandal,
            symbol: Some("BAD".to_string()),
            sector: Some(Sector::Finance),
            impact: -0.2,
            duration_ticks: 10,
            origin_tick: 20,
            headline: "h".to_string(),
        };
        // Sold 12 ticks before the event: outside the default window of 5.
        let recent = vec![trade("BAD", "x", "early", 100.0, 100, 8)];
        let detections = detector.detect(20, &[], &recent, &[event], &HashMap::new());
        assert!(detections.is_empty());
    }
}
