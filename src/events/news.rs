//! Derived news articles: events, notable trades, notable price moves,
//! occasional market analysis, and investigation lifecycle coverage.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use uuid::Uuid;

use crate::market::pricing::PriceChange;
use crate::models::{
    EventType, InvestigationAlert, InvestigationStage, MarketEvent, MarketRegime, NewsArticle,
    NewsCategory, Trade,
};

/// Predetermined sentiment for investigation lifecycle articles.
fn investigation_sentiment(stage: InvestigationStage) -> f64 {
    match stage {
        InvestigationStage::Open => -0.3,
        InvestigationStage::Active => -0.4,
        InvestigationStage::Charged => -0.6,
        InvestigationStage::Trial => -0.5,
        InvestigationStage::Convicted => -0.8,
        InvestigationStage::Acquitted => 0.3,
        InvestigationStage::Settled => -0.2,
    }
}

fn event_category(event_type: EventType) -> NewsCategory {
    match event_type {
        EventType::EarningsBeat | EventType::EarningsMiss => NewsCategory::Earnings,
        EventType::FdaApproval | EventType::FdaRejection => NewsCategory::Regulatory,
        EventType::ProductLaunch | EventType::Scandal | EventType::MergerRumor => {
            NewsCategory::Corporate
        }
        EventType::SectorBoom
        | EventType::SectorBust
        | EventType::MemePump
        | EventType::ShortSqueeze => NewsCategory::MarketMoves,
        EventType::BlackSwan | EventType::MarketCrash | EventType::MarketRally => {
            NewsCategory::Macro
        }
    }
}

pub struct NewsGenerator {
    pub trade_value_threshold: f64,
    pub price_move_pct: f64,
    pub analysis_chance: f64,
}

impl NewsGenerator {
    pub fn new(trade_value_threshold: f64, price_move_pct: f64, analysis_chance: f64) -> Self {
        Self {
            trade_value_threshold,
            price_move_pct,
            analysis_chance,
        }
    }

    /// Every generated event gets an article carrying the event's headline.
    pub fn from_events(&self, tick: i64, events: &[MarketEvent]) -> Vec<NewsArticle> {
        events
            .iter()
            .map(|event| NewsArticle {
                id: Uuid::new_v4().to_string(),
                tick,
                headline: event.headline.clone(),
                content: format!(
                    "{} The move is expected to play out over the next {} ticks.",
                    event.headline, event.duration_ticks
                ),
                category: event_category(event.event_type),
                sentiment: (event.impact * 4.0).clamp(-1.0, 1.0),
                symbols: event.symbol.iter().cloned().collect(),
                agents: Vec::new(),
            })
            .collect()
    }

    /// Trades whose notional clears the significance threshold.
    pub fn from_trades(&self, tick: i64, trades: &[Trade]) -> Vec<NewsArticle> {
        trades
            .iter()
            .filter(|t| t.value() >= self.trade_value_threshold)
            .map(|t| NewsArticle {
                id: Uuid::new_v4().to_string(),
                tick,
                headline: format!(
                    "Block trade: {} shares of {} change hands at {:.2}",
                    t.quantity, t.symbol, t.price
                ),
                content: format!(
                    "A {:.0} notional print in {} crossed the tape this tick.",
                    t.value(),
                    t.symbol
                ),
                category: NewsCategory::MarketMoves,
                sentiment: 0.0,
                symbols: vec![t.symbol.clone()],
                agents: vec![t.buyer_agent_id.clone(), t.seller_agent_id.clone()],
            })
            .collect()
    }

    /// Price moves beyond the percent threshold.
    pub fn from_price_moves(&self, tick: i64, changes: &[PriceChange]) -> Vec<NewsArticle> {
        changes
            .iter()
            .filter(|c| c.change_percent.abs() >= self.price_move_pct)
            .map(|c| {
                let up = c.change_percent > 0.0;
                NewsArticle {
                    id: Uuid::new_v4().to_string(),
                    tick,
                    headline: if up {
                        format!("{} surges {:.1}% to {:.2}", c.symbol, c.change_percent, c.new_price)
                    } else {
                        format!(
                            "{} plunges {:.1}% to {:.2}",
                            c.symbol,
                            c.change_percent.abs(),
                            c.new_price
                        )
                    },
                    content: format!(
                        "{} moved from {:.2} to {:.2} on volume of {} shares.",
                        c.symbol, c.old_price, c.new_price, c.volume
                    ),
                    category: NewsCategory::MarketMoves,
                    sentiment: (c.change_percent / 20.0).clamp(-1.0, 1.0),
                    symbols: vec![c.symbol.clone()],
                    agents: Vec::new(),
                }
            })
            .collect()
    }

    /// Occasional desk-analysis piece summarizing the tape.
    pub fn market_analysis(
        &self,
        tick: i64,
        regime: MarketRegime,
        changes: &[PriceChange],
        rng: &mut ChaCha8Rng,
    ) -> Option<NewsArticle> {
        if changes.is_empty() || rng.gen::<f64>() >= self.analysis_chance {
            return None;
        }

        let advancers = changes.iter().filter(|c| c.change > 0.0).count();
        let decliners = changes.len() - advancers;
        let breadth = advancers as f64 / changes.len() as f64;

        Some(NewsArticle {
            id: Uuid::new_v4().to_string(),
            tick,
            headline: format!(
                "Market wrap: {advancers} advancers, {decliners} decliners in {} tape",
                regime.as_str()
            ),
            content: format!(
                "Breadth came in at {:.0}% with the market regime holding {}.",
                breadth * 100.0,
                regime.as_str()
            ),
            category: NewsCategory::Analysis,
            sentiment: (breadth - 0.5) * 2.0 * 0.5,
            symbols: Vec::new(),
            agents: Vec::new(),
        })
    }

    /// Public coverage of an investigation lifecycle transition with the
    /// predetermined sentiment for that stage.
    pub fn from_investigation(&self, alert: &InvestigationAlert) -> NewsArticle {
        let stage_phrase = match alert.stage {
            InvestigationStage::Open => "opens inquiry into",
            InvestigationStage::Active => "escalates investigation of",
            InvestigationStage::Charged => "files charges against",
            InvestigationStage::Trial => "takes to trial",
            InvestigationStage::Convicted => "wins conviction of",
            InvestigationStage::Acquitted => "sees acquittal of",
            InvestigationStage::Settled => "settles with",
        };
        NewsArticle {
            id: Uuid::new_v4().to_string(),
            tick: alert.tick,
            headline: format!(
                "SEC {} trader {} over {}",
                stage_phrase,
                alert.agent_id,
                alert.crime_type.as_str().replace('_', " ")
            ),
            content: alert.message.clone(),
            category: NewsCategory::Crime,
            sentiment: investigation_sentiment(alert.stage),
            symbols: Vec::new(),
            agents: vec![alert.agent_id.clone()],
        }
    }
}
