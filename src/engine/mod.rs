//! The tick engine: a single serial actor driving the whole world.
//!
//! Each tick runs a frozen sequence of phases: lifecycle maintenance,
//! event generation, matching and settlement, pricing, persistence,
//! publication, webhook fan-out, action processing, SEC surveillance,
//! checkpointing, leaderboard. The loop never overlaps ticks; an
//! overrunning tick causes the next scheduled one to be skipped.

pub mod bootstrap;
pub mod checkpoint;
pub mod heartbeat;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::actions::ActionProcessor;
use crate::broker::channels::{
    self, LeaderboardEntry, LeaderboardPayload, MarketStatusPayload, OrderUpdatePayload,
    PriceUpdate, PricesPayload, TickUpdatePayload, TradesPayload, CHANNEL_CALLBACK_CONFIRMED,
    CHANNEL_LEADERBOARD, CHANNEL_NEWS, CHANNEL_PRICES, CHANNEL_TICK_UPDATES, CHANNEL_TRADES,
    KEY_CURRENT_TICK,
};
use crate::broker::{Broker, MessageType};
use crate::config::EngineConfig;
use crate::events::{EventGenerator, NewsGenerator};
use crate::market::maker::{MarketMaker, MARKET_MAKER_AGENT_ID};
use crate::market::matching::MatchingEngine;
use crate::market::pricing::PriceEngine;
use crate::models::{
    ActionResult, Agent, AgentInvestigationStatus, AgentStatus, Company, EventType, Holding,
    Investigation, InvestigationAlert, InvestigationStage, MarketEvent, MarketRegime, NewsArticle,
    Order, OrderStatus, Trade, TradingStatus, Violation, WorldState,
};
use crate::sec::{Detection, SecDetector, SecLifecycle};
use crate::store::EngineStore;
use crate::webhook::{AgentTickPayload, WebhookDispatcher, WebhookTransport};

pub use heartbeat::{EngineShared, EngineStatus};

const REPUTATION_BASELINE: f64 = 50.0;

/// Splitmix-style spread so per-tick streams are decorrelated.
fn tick_seed(seed: u64, tick: i64) -> u64 {
    (seed ^ (tick as u64)).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn apply_position_delta(old_qty: i64, old_cost: f64, delta: i64, price: f64) -> (i64, f64) {
    let new_qty = old_qty + delta;
    if old_qty == 0 {
        return (new_qty, price);
    }
    if new_qty == 0 {
        return (0, 0.0);
    }
    let same_direction = (old_qty > 0) == (delta > 0);
    if same_direction {
        // Growing the position: volume-weighted cost.
        let cost = (old_cost * old_qty.abs() as f64 + price * delta.abs() as f64)
            / new_qty.abs() as f64;
        (new_qty, cost)
    } else if (old_qty > 0) == (new_qty > 0) {
        // Partial reduction keeps the cost basis.
        (new_qty, old_cost)
    } else {
        // Flipped through zero: the remainder was opened at this price.
        (new_qty, price)
    }
}

pub struct TickEngine {
    config: EngineConfig,
    store: Arc<EngineStore>,
    broker: Arc<Broker>,
    shared: Arc<EngineShared>,

    matching: MatchingEngine,
    pricing: PriceEngine,
    event_gen: EventGenerator,
    news_gen: NewsGenerator,
    detector: SecDetector,
    lifecycle: SecLifecycle,
    dispatcher: WebhookDispatcher,
    actions: ActionProcessor,

    world: WorldState,
    current_tick: i64,
    active_events: Vec<MarketEvent>,
    /// Rumor events planted last tick, still owed a news article.
    carryover_events: Vec<MarketEvent>,
    /// Fractional reputation accumulator; the store only sees integers.
    reputation: HashMap<String, f64>,
    pending_action_results: HashMap<String, Vec<ActionResult>>,
    pending_alerts: HashMap<String, Vec<InvestigationAlert>>,
    /// Detections seeded by actions (whistleblow, bribe), consumed by the
    /// same tick's SEC pass.
    action_detections: Vec<Detection>,
    regime_changed_tick: i64,

    tick_signal: broadcast::Sender<i64>,
}

impl TickEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<EngineStore>,
        broker: Arc<Broker>,
        transport: Arc<dyn WebhookTransport>,
    ) -> Result<Self> {
        let world = match store.load_world_state()? {
            Some(world) => world,
            None => {
                warn!("no world state in store; starting at tick 0 with market open");
                let mut world = WorldState::default();
                world.seed = config.rng_seed.unwrap_or_else(rand::random);
                world
            }
        };
        let seed = config.rng_seed.unwrap_or(world.seed);
        info!(seed, tick = world.tick, "engine world loaded");

        let dispatcher = WebhookDispatcher::new(
            transport,
            config.webhook_timeout_ms,
            config.webhook_failure_threshold,
            config.webhook_concurrency,
            broker.subscribe(CHANNEL_CALLBACK_CONFIRMED),
        );

        let (tick_signal, _) = broadcast::channel(64);

        let mut engine = Self {
            event_gen: EventGenerator::new(config.black_swan_chance, config.base_event_chance),
            news_gen: NewsGenerator::new(
                config.news_trade_value_threshold,
                config.news_price_move_pct,
                config.news_analysis_chance,
            ),
            detector: SecDetector::new(config.sec_insider_window),
            lifecycle: SecLifecycle::from_config(&config),
            pricing: PriceEngine::new(&config),
            matching: MatchingEngine::new(),
            dispatcher,
            actions: ActionProcessor::new(),
            current_tick: world.tick,
            world: WorldState { seed, ..world },
            active_events: Vec::new(),
            carryover_events: Vec::new(),
            reputation: HashMap::new(),
            pending_action_results: HashMap::new(),
            pending_alerts: HashMap::new(),
            action_detections: Vec::new(),
            regime_changed_tick: 0,
            tick_signal,
            shared: Arc::new(EngineShared::new()),
            config,
            store,
            broker,
        };
        engine.init()?;
        Ok(engine)
    }

    /// Load the universe, register books, and seed boot liquidity.
    fn init(&mut self) -> Result<()> {
        let companies = self.store.list_companies().context("loading companies")?;
        if companies.is_empty() {
            warn!("no companies in store; matching and pricing will idle");
        }

        for company in &companies {
            self.matching.register_symbol(&company.symbol);
        }
        self.pricing.load_companies(companies.clone());

        let maker = MarketMaker::new(self.config.maker_levels, self.config.maker_base_qty);
        let mut seeded = 0usize;
        for company in &companies {
            let ladder =
                maker.ladder(&company.symbol, company.price, company.volatility, self.current_tick);
            seeded += ladder.len();
            self.matching.seed_liquidity(&ladder);
        }
        info!(
            symbols = companies.len(),
            orders = seeded,
            "order books seeded with boot liquidity"
        );

        self.world.seed = if self.world.seed == 0 {
            rand::random()
        } else {
            self.world.seed
        };
        self.store.save_world_state(&self.world)?;
        self.shared
            .current_tick
            .store(self.current_tick, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    pub fn shared(&self) -> Arc<EngineShared> {
        self.shared.clone()
    }

    pub fn subscribe_ticks(&self) -> broadcast::Receiver<i64> {
        self.tick_signal.subscribe()
    }

    pub fn current_tick(&self) -> i64 {
        self.current_tick
    }

    pub fn world(&self) -> &WorldState {
        &self.world
    }

    pub fn matching(&self) -> &MatchingEngine {
        &self.matching
    }

    pub fn pricing(&self) -> &PriceEngine {
        &self.pricing
    }

    pub fn active_events(&self) -> &[MarketEvent] {
        &self.active_events
    }

    /// Run a single tick through all phases. Tests drive this directly.
    pub async fn run_tick(&mut self) -> Result<()> {
        let started = Instant::now();

        // Phase 1: advance the clock.
        self.current_tick += 1;
        let tick = self.current_tick;
        self.matching.set_tick(tick);
        let mut rng = ChaCha8Rng::seed_from_u64(tick_seed(self.world.seed, tick));

        // Phase 2: opening sequence read (no increment).
        let seq_start = self.broker.current_sequence();

        // Phase 3: session clock.
        let market_open = self.update_market_session(tick)?;

        // Phases 4-7: agent lifecycle maintenance.
        self.release_prisoners(tick)?;
        self.decay_reputation(tick)?;
        self.trade_recovery_bonus(tick)?;
        self.clean_period_bonus(tick)?;

        // Phase 8: random events.
        let mut new_events: Vec<MarketEvent> = Vec::new();
        if self.config.events_enabled && market_open {
            let companies: Vec<&Company> = self.pricing.companies().collect();
            new_events = self.event_gen.generate(tick, &companies, &mut rng);
            for event in &new_events {
                info!(
                    tick,
                    event = event.event_type.as_str(),
                    impact = event.impact,
                    "market event: {}",
                    event.headline
                );
            }
            self.active_events.extend(new_events.iter().cloned());
        }

        // Phase 9: order matching and settlement.
        let (tick_trades, order_notices) = if market_open {
            self.match_pending_orders(tick)?
        } else {
            (Vec::new(), Vec::new())
        };

        // Phase 10: news sentiment feed.
        let window_start = tick - self.config.news_sentiment_window;
        for (symbol, sentiment) in self.store.news_sentiment_since(window_start)? {
            self.pricing.apply_sentiment(&symbol, sentiment);
        }

        // Phase 11: price update + persistence.
        let price_changes =
            self.pricing
                .update_prices(tick, &tick_trades, &self.active_events, &mut rng);
        let updated: Vec<&Company> = price_changes
            .iter()
            .filter_map(|c| self.pricing.company(&c.symbol))
            .collect();
        self.store.update_company_market_batch(&updated)?;
        for change in &price_changes {
            self.broker.set_key(
                &channels::price_key(&change.symbol),
                format!("{:.2}", change.new_price),
                None,
            );
        }
        self.active_events.retain(|e| !e.expired(tick));
        self.update_regime(tick, &new_events);

        // Phase 12: persist the clock.
        self.world.tick = tick;
        self.world.market_open = market_open;
        self.world.last_tick_at = Some(Utc::now());
        self.store.save_world_state(&self.world)?;
        self.broker.set_key(KEY_CURRENT_TICK, tick.to_string(), None);

        // Phase 13: snapshot checkpoints.
        let prices: HashMap<String, f64> = self
            .pricing
            .companies()
            .map(|c| (c.symbol.clone(), c.price))
            .collect();
        if tick % self.config.portfolio_snapshot_ticks == 0 {
            let agents = checkpoint::snapshot_portfolios(&self.store, &prices, tick)?;
            info!(tick, agents, "portfolio snapshot written");
        }
        if tick % self.config.world_snapshot_ticks == 0 {
            checkpoint::snapshot_world(&self.store, &self.pricing, &self.matching, tick)?;
            info!(tick, "world snapshot written");
        }

        // Phase 14: news generation and publication.
        let mut newsworthy_events = std::mem::take(&mut self.carryover_events);
        newsworthy_events.extend(new_events.iter().cloned());
        let news = self.generate_news(tick, &newsworthy_events, &tick_trades, &price_changes, &mut rng)?;

        // Phase 15: channel publication.
        let price_updates: Vec<PriceUpdate> = price_changes
            .iter()
            .map(|c| PriceUpdate {
                symbol: c.symbol.clone(),
                price: c.new_price,
                change: c.change,
                change_percent: c.change_percent,
                volume: c.volume,
            })
            .collect();
        self.publish_tick_messages(
            tick,
            market_open,
            &price_updates,
            &tick_trades,
            &new_events,
            &news,
            &order_notices,
        )?;

        // Phase 16: webhook fan-out and action processing.
        self.dispatch_and_process(tick, &price_updates, &tick_trades, &mut rng)
            .await?;

        // Phase 17: SEC surveillance and lifecycle.
        self.run_sec(tick, &tick_trades, &new_events, &mut rng)?;

        // Phase 18: closing sequence read; finalize the rolling record.
        let seq_end = self.broker.current_sequence();
        let record = checkpoint::TickRecord {
            tick,
            trades: tick_trades.clone(),
            price_updates: price_updates.clone(),
            events: new_events,
            news,
            seq_start: seq_start + 1,
            seq_end,
        };
        checkpoint::record_tick(
            &self.store,
            &self.broker,
            &record,
            self.config.event_log_retention_ticks,
        )?;

        // Phase 19: leaderboard.
        self.publish_leaderboard(&prices)?;

        // Phase 20: in-process tick signal and self-metrics.
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.shared.record_tick(tick, market_open, duration_ms);
        let _ = self.tick_signal.send(tick);

        Ok(())
    }

    /// Phase 3: derive the market-open flag from the position in the
    /// simulated day; persist and announce edges.
    fn update_market_session(&mut self, tick: i64) -> Result<bool> {
        let day_length = self.config.day_length_ticks().max(1);
        let tick_in_day = tick.rem_euclid(day_length);
        let market_open = self.config.market_open_tick <= tick_in_day
            && tick_in_day < self.config.market_close_tick;

        if market_open != self.world.market_open {
            info!(tick, market_open, "market session flipped");
            self.world.market_open = market_open;
            self.store.save_world_state(&self.world)?;
            self.broker.publish(
                CHANNEL_TICK_UPDATES,
                MessageType::MarketStatus,
                &MarketStatusPayload { tick, market_open },
            )?;
        }
        Ok(market_open)
    }

    /// Phase 4: release agents whose sentence has elapsed.
    fn release_prisoners(&mut self, tick: i64) -> Result<()> {
        for agent_id in self.store.release_imprisoned(tick)? {
            info!(tick, agent_id = %agent_id, "sentence served, agent released");
        }
        Ok(())
    }

    /// Phase 5: pull reputation toward the baseline. Fractional movement
    /// accumulates in memory; the store only sees whole-point changes.
    fn decay_reputation(&mut self, _tick: i64) -> Result<()> {
        let agents = self.store.list_agents()?;
        for agent in agents {
            if matches!(agent.status, AgentStatus::Fled | AgentStatus::Bankrupt) {
                continue;
            }
            let current = *self
                .reputation
                .entry(agent.id.clone())
                .or_insert(agent.reputation);
            let distance = current - REPUTATION_BASELINE;

            let next = if distance > 0.0 {
                let multiplier = match agent.investigation_status {
                    AgentInvestigationStatus::UnderInvestigation
                    | AgentInvestigationStatus::Charged => 2.0,
                    AgentInvestigationStatus::Convicted => 3.0,
                    _ => 1.0,
                };
                current - 0.001 * distance * multiplier
            } else if distance < 0.0 {
                current + 0.0005 * distance.abs()
            } else {
                current
            };
            let next = next.clamp(0.0, 100.0);
            self.reputation.insert(agent.id.clone(), next);

            if (next.round() as i64 - agent.reputation.round() as i64).abs() >= 1 {
                self.store.update_reputation(&agent.id, next.round() as i64)?;
            }
        }
        Ok(())
    }

    /// Phase 6: a bounded reputation bonus for agents trading honestly
    /// while at or below the baseline.
    fn trade_recovery_bonus(&mut self, tick: i64) -> Result<()> {
        let window_start = tick - self.config.trade_recovery_window;
        let recent = self.store.trades_since(window_start)?;
        if recent.is_empty() {
            return Ok(());
        }

        let mut trade_counts: HashMap<&str, i64> = HashMap::new();
        for trade in &recent {
            for agent in [trade.buyer_agent_id.as_str(), trade.seller_agent_id.as_str()] {
                if agent != MARKET_MAKER_AGENT_ID {
                    *trade_counts.entry(agent).or_default() += 1;
                }
            }
        }

        for (agent_id, count) in trade_counts {
            let Some(agent) = self.store.get_agent(agent_id)? else {
                continue;
            };
            if agent.status != AgentStatus::Active {
                continue;
            }
            let current = *self
                .reputation
                .entry(agent.id.clone())
                .or_insert(agent.reputation);
            if current > REPUTATION_BASELINE + 5.0 {
                continue;
            }
            let bonus = (count as f64 * 0.05).min(self.config.trade_recovery_cap);
            let next = (current + bonus).clamp(0.0, 100.0);
            self.reputation.insert(agent.id.clone(), next);
            if (next.round() as i64 - agent.reputation.round() as i64).abs() >= 1 {
                self.store.update_reputation(&agent.id, next.round() as i64)?;
            }
        }
        Ok(())
    }

    /// Phase 7: every clean period, reward agents with no violations.
    fn clean_period_bonus(&mut self, tick: i64) -> Result<()> {
        if tick == 0 || tick % self.config.clean_period_ticks != 0 {
            return Ok(());
        }
        let since = tick - self.config.clean_period_ticks;
        for agent in self.store.list_agents()? {
            if agent.status != AgentStatus::Active || agent.id == MARKET_MAKER_AGENT_ID {
                continue;
            }
            if self.store.violations_since(&agent.id, since)? > 0 {
                continue;
            }
            let current = *self
                .reputation
                .entry(agent.id.clone())
                .or_insert(agent.reputation);
            let next = (current + self.config.clean_period_bonus).clamp(0.0, 100.0);
            self.reputation.insert(agent.id.clone(), next);
            if (next.round() as i64 - agent.reputation.round() as i64).abs() >= 1 {
                self.store.update_reputation(&agent.id, next.round() as i64)?;
            }
        }
        Ok(())
    }

    /// Phase 9: drain every symbol's pending queue through the matching
    /// engine, settling fills into holdings and cash as they land. Returns
    /// the tick's fills plus per-agent order notices published in phase 15.
    fn match_pending_orders(
        &mut self,
        tick: i64,
    ) -> Result<(Vec<Trade>, Vec<(String, OrderUpdatePayload)>)> {
        let mut tick_trades = Vec::new();
        let mut order_notices = Vec::new();

        for symbol in self.store.symbols_with_pending_orders()? {
            let tradable = self
                .pricing
                .company(&symbol)
                .map(|c| c.trading_status == TradingStatus::Active)
                .unwrap_or(false);
            if !tradable {
                let rejected = self.store.reject_pending_orders(&symbol)?;
                if rejected > 0 {
                    warn!(symbol = %symbol, rejected, "rejected pending orders on halted symbol");
                }
                continue;
            }

            for order in self.store.pending_orders(&symbol)? {
                let result = self.matching.submit(&order);

                if !result.fills.is_empty() {
                    self.store.insert_trades(&result.fills)?;
                    for trade in &result.fills {
                        self.settle_trade(trade)?;
                    }
                }

                for update in &result.resting_updates {
                    let resting_status = if update.exhausted {
                        OrderStatus::Filled
                    } else {
                        OrderStatus::Partial
                    };
                    self.store.apply_order_execution(
                        &update.order_id,
                        update.filled_quantity,
                        update.avg_price,
                        resting_status,
                        tick,
                    )?;
                }

                // A market order that found no liquidity stays pending for
                // the next tick.
                if result.status != OrderStatus::Pending {
                    let filled = order.remaining() - result.remaining;
                    let vwap = if filled > 0 {
                        result.fills.iter().map(|t| t.price * t.quantity as f64).sum::<f64>()
                            / filled as f64
                    } else {
                        0.0
                    };
                    self.store
                        .apply_order_execution(&order.id, filled, vwap, result.status, tick)?;
                    if result.status == OrderStatus::Open {
                        order_notices.push((
                            order.agent_id.clone(),
                            OrderUpdatePayload {
                                order_id: order.id.clone(),
                                symbol: order.symbol.clone(),
                                status: result.status.as_str().to_string(),
                                filled_quantity: filled,
                            },
                        ));
                    }
                }

                tick_trades.extend(result.fills);
            }
        }

        Ok((tick_trades, order_notices))
    }

    /// Settle one fill: buyer pays and receives shares, seller the inverse.
    /// Cash moves by exactly price × quantity on both legs.
    fn settle_trade(&mut self, trade: &Trade) -> Result<()> {
        let value = trade.value();

        for (agent_id, delta, cash_delta) in [
            (trade.buyer_agent_id.as_str(), trade.quantity, -value),
            (trade.seller_agent_id.as_str(), -trade.quantity, value),
        ] {
            let Some(agent) = self.store.get_agent(agent_id)? else {
                warn!(agent_id, trade_id = %trade.id, "fill references unknown agent");
                continue;
            };

            let holding = self.store.get_holding(agent_id, &trade.symbol)?;
            let (old_qty, old_cost) = holding
                .map(|h| (h.quantity, h.avg_cost))
                .unwrap_or((0, 0.0));
            let (new_qty, new_cost) = apply_position_delta(old_qty, old_cost, delta, trade.price);
            self.store.set_holding(&Holding {
                agent_id: agent_id.to_string(),
                symbol: trade.symbol.clone(),
                quantity: new_qty,
                avg_cost: new_cost,
            })?;

            let new_cash = agent.cash + cash_delta;
            if new_cash < 0.0 && agent_id != MARKET_MAKER_AGENT_ID {
                warn!(agent_id, cash = new_cash, "agent cash negative after settlement");
            }
            self.store.set_agent_cash(agent_id, new_cash)?;
        }
        Ok(())
    }

    /// Regime supplement: crashes dominate, then sustained momentum, then
    /// decay back to normal.
    fn update_regime(&mut self, tick: i64, new_events: &[MarketEvent]) {
        let crash = new_events.iter().any(|e| {
            matches!(e.event_type, EventType::BlackSwan | EventType::MarketCrash)
        });
        let momentum = self.pricing.mean_momentum();
        let manipulation = self.pricing.mean_manipulation();

        let next = if crash {
            MarketRegime::Crash
        } else if momentum > 0.02 && manipulation > 1.0 {
            MarketRegime::Bubble
        } else if momentum > 0.02 {
            MarketRegime::Bull
        } else if momentum < -0.02 {
            MarketRegime::Bear
        } else if tick - self.regime_changed_tick >= self.config.regime_decay_ticks {
            MarketRegime::Normal
        } else {
            self.world.regime
        };

        if next != self.world.regime {
            info!(tick, from = self.world.regime.as_str(), to = next.as_str(), "market regime shifted");
            self.world.regime = next;
            self.regime_changed_tick = tick;
        }
    }

    /// Phase 14: derive, persist, and publish this tick's articles.
    fn generate_news(
        &mut self,
        tick: i64,
        events: &[MarketEvent],
        trades: &[Trade],
        changes: &[crate::market::pricing::PriceChange],
        rng: &mut ChaCha8Rng,
    ) -> Result<Vec<NewsArticle>> {
        let mut news = self.news_gen.from_events(tick, events);
        news.extend(self.news_gen.from_trades(tick, trades));
        news.extend(self.news_gen.from_price_moves(tick, changes));
        if let Some(article) = self
            .news_gen
            .market_analysis(tick, self.world.regime, changes, rng)
        {
            news.push(article);
        }

        self.store.insert_news(&news)?;
        for article in &news {
            self.broker.publish(CHANNEL_NEWS, MessageType::News, article)?;
        }
        Ok(news)
    }

    /// Phase 15: the fixed publication order — tick update, compact prices,
    /// per-symbol market updates, trades, per-symbol and per-agent fills,
    /// then per-agent order notices.
    #[allow(clippy::too_many_arguments)]
    fn publish_tick_messages(
        &self,
        tick: i64,
        market_open: bool,
        price_updates: &[PriceUpdate],
        trades: &[Trade],
        events: &[MarketEvent],
        news: &[NewsArticle],
        order_notices: &[(String, OrderUpdatePayload)],
    ) -> Result<()> {
        self.broker.publish(
            CHANNEL_TICK_UPDATES,
            MessageType::TickUpdate,
            &TickUpdatePayload {
                tick,
                timestamp: Utc::now().to_rfc3339(),
                market_open,
                regime: self.world.regime.as_str().to_string(),
                price_updates: price_updates.to_vec(),
                trades: trades.to_vec(),
                events: events.to_vec(),
                news: news.to_vec(),
            },
        )?;

        self.broker.publish(
            CHANNEL_PRICES,
            MessageType::PriceUpdate,
            &PricesPayload {
                tick,
                prices: price_updates.to_vec(),
            },
        )?;

        for update in price_updates {
            self.broker.publish(
                &channels::market_channel(&update.symbol),
                MessageType::MarketUpdate,
                update,
            )?;
        }

        if !trades.is_empty() {
            self.broker.publish(
                CHANNEL_TRADES,
                MessageType::Trade,
                &TradesPayload {
                    tick,
                    trades: trades.to_vec(),
                },
            )?;
        }
        for trade in trades {
            self.broker.publish(
                &channels::market_channel(&trade.symbol),
                MessageType::Trade,
                trade,
            )?;
            for agent_id in [&trade.buyer_agent_id, &trade.seller_agent_id] {
                if agent_id != MARKET_MAKER_AGENT_ID {
                    self.broker.publish(
                        &channels::agent_channel(agent_id),
                        MessageType::OrderFilled,
                        trade,
                    )?;
                }
            }
        }

        for (agent_id, notice) in order_notices {
            self.broker.publish(
                &channels::agent_channel(agent_id),
                MessageType::OrderUpdate,
                notice,
            )?;
        }

        Ok(())
    }

    /// Phase 16: build per-agent payloads, fan out webhooks, then run the
    /// returned actions.
    async fn dispatch_and_process(
        &mut self,
        tick: i64,
        price_updates: &[PriceUpdate],
        tick_trades: &[Trade],
        rng: &mut ChaCha8Rng,
    ) -> Result<()> {
        // Previous-tick results and alerts ride this payload, then clear.
        let mut action_results = std::mem::take(&mut self.pending_action_results);
        let mut alerts = std::mem::take(&mut self.pending_alerts);

        let agents = self.store.agents_with_callbacks()?;
        let mut deliveries: Vec<(Agent, AgentTickPayload)> = Vec::with_capacity(agents.len());
        let timestamp = Utc::now().to_rfc3339();

        for agent in agents {
            let fills: Vec<Trade> = tick_trades
                .iter()
                .filter(|t| t.buyer_agent_id == agent.id || t.seller_agent_id == agent.id)
                .cloned()
                .collect();
            let orders: Vec<Order> = self.store.open_orders_for_agent(&agent.id)?;
            let holdings = self.store.holdings_for_agent(&agent.id)?;

            let payload = AgentTickPayload {
                tick,
                timestamp: timestamp.clone(),
                market_open: self.world.market_open,
                regime: self.world.regime.as_str().to_string(),
                price_updates: price_updates.to_vec(),
                fills,
                orders,
                holdings,
                cash: agent.cash,
                investigation_alerts: alerts.remove(&agent.id).unwrap_or_default(),
                action_results: action_results.remove(&agent.id).unwrap_or_default(),
            };
            deliveries.push((agent, payload));
        }

        let responses = self.dispatcher.dispatch(&self.store, deliveries).await;
        let outcome = self.actions.process(
            &self.store,
            &mut self.matching,
            &self.pricing,
            tick,
            rng,
            responses,
        )?;

        self.pending_action_results = outcome.results;
        // Rumors start moving prices next tick and get their news then.
        self.active_events.extend(outcome.events.iter().cloned());
        self.carryover_events.extend(outcome.events);
        // Whistleblow/bribe detections join this tick's SEC pass.
        self.pending_detections(outcome.detections);

        Ok(())
    }

    fn pending_detections(&mut self, detections: Vec<Detection>) {
        self.action_detections.extend(detections);
    }

    /// Phase 17: detector pass, investigation folding, lifecycle advance,
    /// alerts and public news.
    fn run_sec(
        &mut self,
        tick: i64,
        tick_trades: &[Trade],
        new_events: &[MarketEvent],
        rng: &mut ChaCha8Rng,
    ) -> Result<()> {
        let recent = self
            .store
            .trades_since(tick - self.detector.insider_window)?;
        let companies: HashMap<String, Company> = self
            .pricing
            .companies()
            .map(|c| (c.symbol.clone(), c.clone()))
            .collect();

        let mut detections =
            self.detector
                .detect(tick, tick_trades, &recent, new_events, &companies);
        detections.extend(std::mem::take(&mut self.action_detections));

        for detection in detections {
            self.fold_detection(tick, detection)?;
        }

        // Advance every unresolved investigation.
        for investigation in self.store.unresolved_investigations()? {
            let Some(transition) = self.lifecycle.advance(&investigation, tick, rng) else {
                continue;
            };
            self.apply_transition(tick, transition)?;
        }

        Ok(())
    }

    /// Open a new investigation or reinforce the agent's existing one.
    fn fold_detection(&mut self, tick: i64, detection: Detection) -> Result<()> {
        self.store.insert_violation(&Violation {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: detection.agent_id.clone(),
            crime_type: detection.crime_type,
            tick,
            description: detection.description.clone(),
        })?;
        self.store.set_last_violation(&detection.agent_id, tick)?;

        if let Some(mut existing) = self.store.open_investigation_for(&detection.agent_id)? {
            existing.evidence_count += 1;
            self.store.update_investigation(&existing)?;
            return Ok(());
        }

        let investigation = Investigation {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: detection.agent_id.clone(),
            crime_type: detection.crime_type,
            stage: InvestigationStage::Open,
            tick_opened: tick,
            tick_activated: None,
            tick_charged: None,
            tick_trial: None,
            tick_resolved: None,
            fine: 0.0,
            sentence_years: 0.0,
            evidence_count: 1,
        };
        self.store.insert_investigation(&investigation)?;
        self.store.set_investigation_status(
            &detection.agent_id,
            AgentInvestigationStatus::UnderInvestigation,
        )?;

        let alert = SecLifecycle::opening_alert(&investigation, tick);
        self.emit_alert(alert)?;
        Ok(())
    }

    /// Persist a lifecycle transition and its consequences.
    fn apply_transition(
        &mut self,
        tick: i64,
        transition: crate::sec::StageTransition,
    ) -> Result<()> {
        let investigation = &transition.investigation;
        self.store.update_investigation(investigation)?;

        if let Some(status) = transition.agent_status {
            self.store
                .set_investigation_status(&investigation.agent_id, status)?;
        }

        if let Some((fine, sentence_years)) = transition.conviction {
            let agent_id = &investigation.agent_id;
            info!(
                tick,
                agent_id = %agent_id,
                fine,
                sentence_years,
                "conviction entered"
            );

            // Fine first, then liquidate whatever is left at market.
            if let Some(agent) = self.store.get_agent(agent_id)? {
                self.store.set_agent_cash(agent_id, (agent.cash - fine).max(0.0))?;
            }
            let holdings = self.store.holdings_for_agent(agent_id)?;
            let mut liquidation_value = 0.0;
            for holding in &holdings {
                let price = self
                    .pricing
                    .company(&holding.symbol)
                    .map(|c| c.price)
                    .unwrap_or(holding.avg_cost);
                liquidation_value += price * holding.quantity as f64;
            }
            if !holdings.is_empty() {
                self.store.delete_holdings_for_agent(agent_id)?;
                self.store.add_cash(agent_id, liquidation_value)?;
            }

            let until = tick + (sentence_years * self.config.ticks_per_year as f64) as i64;
            self.store.set_imprisoned(agent_id, until)?;
        }

        if let Some(fine) = transition.settlement_fine {
            if let Some(agent) = self.store.get_agent(&investigation.agent_id)? {
                self.store
                    .set_agent_cash(&investigation.agent_id, (agent.cash - fine).max(0.0))?;
            }
        }

        if transition.restores_agent {
            self.store
                .set_agent_status(&investigation.agent_id, AgentStatus::Active)?;
        }

        self.emit_alert(transition.alert)?;
        Ok(())
    }

    /// Queue an alert for the agent's next webhook, publish it on the agent
    /// channel, and run public news coverage.
    fn emit_alert(&mut self, alert: InvestigationAlert) -> Result<()> {
        self.broker.publish(
            &channels::agent_channel(&alert.agent_id),
            MessageType::Investigation,
            &alert,
        )?;

        let article = self.news_gen.from_investigation(&alert);
        self.store.insert_news(std::slice::from_ref(&article))?;
        self.broker
            .publish(CHANNEL_NEWS, MessageType::News, &article)?;

        self.pending_alerts
            .entry(alert.agent_id.clone())
            .or_default()
            .push(alert);
        Ok(())
    }

    /// Phase 19: net-worth leaderboard, market maker excluded.
    fn publish_leaderboard(&self, prices: &HashMap<String, f64>) -> Result<()> {
        let agents = self.store.list_agents()?;
        let holdings = self.store.all_holdings()?;
        let mut by_agent: HashMap<&str, Vec<&Holding>> = HashMap::new();
        for holding in &holdings {
            by_agent.entry(holding.agent_id.as_str()).or_default().push(holding);
        }

        let mut entries: Vec<LeaderboardEntry> = Vec::with_capacity(agents.len());
        for agent in &agents {
            if agent.id == MARKET_MAKER_AGENT_ID {
                continue;
            }
            let agent_holdings: Vec<Holding> = by_agent
                .get(agent.id.as_str())
                .map(|hs| hs.iter().map(|h| (*h).clone()).collect())
                .unwrap_or_default();
            let worth = checkpoint::net_worth(agent.cash, &agent_holdings, prices);
            let reference_tick = self.current_tick - self.config.ticks_per_day;
            let change_24h = match self.store.snapshot_net_worth_at(&agent.id, reference_tick)? {
                Some(previous) if previous.abs() > f64::EPSILON => {
                    (worth - previous) / previous.abs() * 100.0
                }
                _ => 0.0,
            };
            entries.push(LeaderboardEntry {
                rank: 0,
                agent_id: agent.id.clone(),
                name: agent.name.clone(),
                role: agent.role.clone(),
                status: agent.status.as_str().to_string(),
                net_worth: worth,
                change_24h,
            });
        }

        entries.sort_by(|a, b| {
            b.net_worth
                .partial_cmp(&a.net_worth)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.rank = i + 1;
        }

        self.broker.publish(
            CHANNEL_LEADERBOARD,
            MessageType::LeaderboardUpdate,
            &LeaderboardPayload {
                timestamp: Utc::now().to_rfc3339(),
                entries,
            },
        )?;
        Ok(())
    }

    /// The periodic loop. Ticks never overlap: a missed period is skipped.
    pub async fn run(mut self) -> Result<()> {
        self.shared.set_status(EngineStatus::Running);
        let mut ticker = interval(Duration::from_millis(self.config.tick_interval_ms.max(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if self.shared.status() == EngineStatus::Stopped {
                info!("engine stopped");
                break;
            }

            match self.run_tick().await {
                Ok(()) => {
                    if self.shared.status() == EngineStatus::Error {
                        self.shared.set_status(EngineStatus::Running);
                    }
                }
                Err(e) => {
                    // Abort this tick; the heartbeat keeps running and the
                    // next scheduled tick retries.
                    error!(tick = self.current_tick, error = %e, "tick failed");
                    self.shared.set_status(EngineStatus::Error);
                }
            }
        }
        Ok(())
    }

    /// Signal the loop to stop and drop the liveness key.
    pub fn stop(shared: &EngineShared, broker: &Broker) {
        shared.set_status(EngineStatus::Stopped);
        broker.delete_key(channels::KEY_HEARTBEAT);
    }
}
