//! Engine configuration, loaded from the environment with sane defaults.

use std::env;

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

/// All engine knobs. Every field has an env override and a default; the
/// binary may layer CLI flags on top of this.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: String,

    // Tick clock and session structure.
    pub tick_interval_ms: u64,
    pub market_open_tick: i64,
    pub market_close_tick: i64,
    pub after_hours_ticks: i64,
    pub ticks_per_year: i64,
    pub ticks_per_day: i64,

    // Price model.
    pub max_price_move: f64,
    pub price_floor: f64,
    pub weight_agent_pressure: f64,
    pub weight_random_walk: f64,
    pub weight_sector: f64,

    // Event generation.
    pub events_enabled: bool,
    pub black_swan_chance: f64,
    pub base_event_chance: f64,

    // News generation.
    pub news_trade_value_threshold: f64,
    pub news_price_move_pct: f64,
    pub news_analysis_chance: f64,
    pub news_sentiment_window: i64,

    // Webhooks.
    pub webhook_timeout_ms: u64,
    pub webhook_failure_threshold: i64,
    pub webhook_concurrency: usize,

    // Heartbeat and checkpoints.
    pub heartbeat_interval_ms: u64,
    pub portfolio_snapshot_ticks: i64,
    pub world_snapshot_ticks: i64,
    pub event_log_retention_ticks: i64,

    // Reputation maintenance.
    pub trade_recovery_window: i64,
    pub trade_recovery_cap: f64,
    pub clean_period_ticks: i64,
    pub clean_period_bonus: f64,

    // SEC lifecycle thresholds (elapsed ticks from the previous stage).
    pub sec_activate_ticks: i64,
    pub sec_charge_ticks: i64,
    pub sec_trial_ticks: i64,
    pub sec_resolve_ticks: i64,
    pub sec_conviction_prob: f64,
    pub sec_settle_prob: f64,
    pub sec_insider_window: i64,

    // Regime maintenance.
    pub regime_decay_ticks: i64,

    // Market maker seeding.
    pub maker_levels: usize,
    pub maker_base_qty: i64,

    // Determinism and failure policy.
    pub rng_seed: Option<u64>,
    pub halt_on_invariant: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "./wss_engine.db".to_string(),
            tick_interval_ms: 1000,
            market_open_tick: 0,
            market_close_tick: 390,
            after_hours_ticks: 30,
            ticks_per_year: 10_000,
            ticks_per_day: 420,
            max_price_move: 0.10,
            price_floor: 0.01,
            weight_agent_pressure: 1.0,
            weight_random_walk: 1.0,
            weight_sector: 1.0,
            events_enabled: true,
            black_swan_chance: 0.001,
            base_event_chance: 0.01,
            news_trade_value_threshold: 100_000.0,
            news_price_move_pct: 5.0,
            news_analysis_chance: 0.05,
            news_sentiment_window: 20,
            webhook_timeout_ms: 5000,
            webhook_failure_threshold: 3,
            webhook_concurrency: 16,
            heartbeat_interval_ms: 5000,
            portfolio_snapshot_ticks: 50,
            world_snapshot_ticks: 100,
            event_log_retention_ticks: 1000,
            trade_recovery_window: 10,
            trade_recovery_cap: 0.5,
            clean_period_ticks: 100,
            clean_period_bonus: 1.0,
            sec_activate_ticks: 20,
            sec_charge_ticks: 50,
            sec_trial_ticks: 80,
            sec_resolve_ticks: 120,
            sec_conviction_prob: 0.6,
            sec_settle_prob: 0.2,
            sec_insider_window: 5,
            regime_decay_ticks: 100,
            maker_levels: 5,
            maker_base_qty: 100,
            rng_seed: None,
            halt_on_invariant: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let d = Self::default();

        Self {
            db_path: env::var("DB_PATH").unwrap_or(d.db_path),
            tick_interval_ms: env_u64("TICK_INTERVAL_MS", d.tick_interval_ms),
            market_open_tick: env_i64("MARKET_OPEN_TICK", d.market_open_tick),
            market_close_tick: env_i64("MARKET_CLOSE_TICK", d.market_close_tick),
            after_hours_ticks: env_i64("AFTER_HOURS_TICKS", d.after_hours_ticks),
            ticks_per_year: env_i64("TICKS_PER_YEAR", d.ticks_per_year),
            ticks_per_day: env_i64("TICKS_PER_DAY", d.ticks_per_day),
            max_price_move: env_f64("MAX_PRICE_MOVE", d.max_price_move),
            price_floor: env_f64("PRICE_FLOOR", d.price_floor),
            weight_agent_pressure: env_f64("PRICE_W_AGENT", d.weight_agent_pressure),
            weight_random_walk: env_f64("PRICE_W_RANDOM", d.weight_random_walk),
            weight_sector: env_f64("PRICE_W_SECTOR", d.weight_sector),
            events_enabled: env_bool("EVENTS_ENABLED", d.events_enabled),
            black_swan_chance: env_f64("BLACK_SWAN_CHANCE", d.black_swan_chance),
            base_event_chance: env_f64("BASE_EVENT_CHANCE", d.base_event_chance),
            news_trade_value_threshold: env_f64(
                "NEWS_TRADE_VALUE_THRESHOLD",
                d.news_trade_value_threshold,
            ),
            news_price_move_pct: env_f64("NEWS_PRICE_MOVE_PCT", d.news_price_move_pct),
            news_analysis_chance: env_f64("NEWS_ANALYSIS_CHANCE", d.news_analysis_chance),
            news_sentiment_window: env_i64("NEWS_SENTIMENT_WINDOW", d.news_sentiment_window),
            webhook_timeout_ms: env_u64("WEBHOOK_TIMEOUT_MS", d.webhook_timeout_ms),
            webhook_failure_threshold: env_i64(
                "WEBHOOK_FAILURE_THRESHOLD",
                d.webhook_failure_threshold,
            ),
            webhook_concurrency: env_usize("WEBHOOK_CONCURRENCY", d.webhook_concurrency),
            heartbeat_interval_ms: env_u64("HEARTBEAT_INTERVAL_MS", d.heartbeat_interval_ms),
            portfolio_snapshot_ticks: env_i64(
                "PORTFOLIO_SNAPSHOT_TICKS",
                d.portfolio_snapshot_ticks,
            ),
            world_snapshot_ticks: env_i64("WORLD_SNAPSHOT_TICKS", d.world_snapshot_ticks),
            event_log_retention_ticks: env_i64("EVENT_LOG_RETENTION", d.event_log_retention_ticks),
            trade_recovery_window: env_i64("TRADE_RECOVERY_WINDOW", d.trade_recovery_window),
            trade_recovery_cap: env_f64("TRADE_RECOVERY_CAP", d.trade_recovery_cap),
            clean_period_ticks: env_i64("CLEAN_PERIOD_TICKS", d.clean_period_ticks),
            clean_period_bonus: env_f64("CLEAN_PERIOD_BONUS", d.clean_period_bonus),
            sec_activate_ticks: env_i64("SEC_ACTIVATE_TICKS", d.sec_activate_ticks),
            sec_charge_ticks: env_i64("SEC_CHARGE_TICKS", d.sec_charge_ticks),
            sec_trial_ticks: env_i64("SEC_TRIAL_TICKS", d.sec_trial_ticks),
            sec_resolve_ticks: env_i64("SEC_RESOLVE_TICKS", d.sec_resolve_ticks),
            sec_conviction_prob: env_f64("SEC_CONVICTION_PROB", d.sec_conviction_prob),
            sec_settle_prob: env_f64("SEC_SETTLE_PROB", d.sec_settle_prob),
            sec_insider_window: env_i64("SEC_INSIDER_WINDOW", d.sec_insider_window),
            regime_decay_ticks: env_i64("REGIME_DECAY_TICKS", d.regime_decay_ticks),
            maker_levels: env_usize("MAKER_LEVELS", d.maker_levels),
            maker_base_qty: env_i64("MAKER_BASE_QTY", d.maker_base_qty),
            rng_seed: env::var("RNG_SEED").ok().and_then(|v| v.parse::<u64>().ok()),
            halt_on_invariant: env_bool("HALT_ON_INVARIANT", d.halt_on_invariant),
        }
    }

    /// Length of a full simulated day (open session plus after hours).
    pub fn day_length_ticks(&self) -> i64 {
        self.market_close_tick + self.after_hours_ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.tick_interval_ms, 1000);
        assert_eq!(cfg.day_length_ticks(), 420);
        assert!(cfg.max_price_move > 0.0 && cfg.max_price_move < 1.0);
        assert!(cfg.sec_activate_ticks < cfg.sec_charge_ticks);
        assert!(cfg.sec_charge_ticks < cfg.sec_trial_ticks);
        assert!(cfg.sec_trial_ticks < cfg.sec_resolve_ticks);
    }
}
