//! The composite price engine.
//!
//! Per tick, each company's return combines agent order-flow pressure, a
//! zero-drift geometric-Brownian draw, sector correlation, and decaying
//! event impact; the result is clamped, floored, and rounded to cents.

use std::collections::HashMap;

use rand::distributions::Distribution;
use rand_chacha::ChaCha8Rng;
use statrs::distribution::Normal;
use tracing::warn;

use crate::config::EngineConfig;
use crate::models::{Company, MarketEvent, Sector, Trade};

/// Manipulation-score contributions start above this pressure magnitude.
const MANIPULATION_PRESSURE_THRESHOLD: f64 = 0.02;

/// Engine-owned per-sector aggregates feeding sector correlation.
#[derive(Debug, Clone, Default)]
pub struct SectorStats {
    /// Percent-scale rolling performance of the sector's constituents.
    pub performance: f64,
    /// Mean constituent volatility.
    pub volatility: f64,
}

/// Per-driver contributions in basis-point-like units (return × 10_000).
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnBreakdown {
    pub agent_pressure_bps: f64,
    pub random_walk_bps: f64,
    pub sector_bps: f64,
    pub event_bps: f64,
}

/// One symbol's result for the tick.
#[derive(Debug, Clone)]
pub struct PriceChange {
    pub symbol: String,
    pub old_price: f64,
    pub new_price: f64,
    pub change: f64,
    pub change_percent: f64,
    pub volume: i64,
    pub breakdown: ReturnBreakdown,
}

pub struct PriceEngine {
    companies: HashMap<String, Company>,
    sectors: HashMap<Sector, SectorStats>,
    weight_agent: f64,
    weight_random: f64,
    weight_sector: f64,
    max_move: f64,
    price_floor: f64,
    ticks_per_year: i64,
}

impl PriceEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            companies: HashMap::new(),
            sectors: HashMap::new(),
            weight_agent: config.weight_agent_pressure,
            weight_random: config.weight_random_walk,
            weight_sector: config.weight_sector,
            max_move: config.max_price_move,
            price_floor: config.price_floor,
            ticks_per_year: config.ticks_per_year,
        }
    }

    /// Load (or reload) the tradable universe. Sector volatility is derived
    /// immediately; performance accumulates from subsequent ticks.
    pub fn load_companies(&mut self, companies: Vec<Company>) {
        self.companies.clear();
        for company in companies {
            self.companies.insert(company.symbol.clone(), company);
        }
        self.refresh_sector_volatility();
    }

    fn refresh_sector_volatility(&mut self) {
        for sector in Sector::ALL {
            let vols: Vec<f64> = self
                .companies
                .values()
                .filter(|c| c.sector == sector)
                .map(|c| c.volatility)
                .collect();
            if vols.is_empty() {
                continue;
            }
            let stats = self.sectors.entry(sector).or_default();
            stats.volatility = vols.iter().sum::<f64>() / vols.len() as f64;
        }
    }

    pub fn company(&self, symbol: &str) -> Option<&Company> {
        self.companies.get(symbol)
    }

    pub fn company_mut(&mut self, symbol: &str) -> Option<&mut Company> {
        self.companies.get_mut(symbol)
    }

    pub fn companies(&self) -> impl Iterator<Item = &Company> {
        self.companies.values()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.companies.keys().cloned().collect()
    }

    pub fn sector_stats(&self, sector: Sector) -> Option<&SectorStats> {
        self.sectors.get(&sector)
    }

    /// Blend freshly observed news sentiment into a company's running score.
    pub fn apply_sentiment(&mut self, symbol: &str, sentiment: f64) {
        if let Some(company) = self.companies.get_mut(symbol) {
            company.sentiment = 0.8 * company.sentiment + 0.2 * sentiment.clamp(-1.0, 1.0);
        }
    }

    /// Signed, volume-weighted buy/sell imbalance from this tick's trades.
    /// Trades at or above the current price count as buy-aggressive.
    fn agent_pressure(company: &Company, trades: &[&Trade]) -> f64 {
        if trades.is_empty() {
            return 0.0;
        }

        let mut buy_value = 0.0;
        let mut sell_value = 0.0;
        for trade in trades {
            if trade.price >= company.price {
                buy_value += trade.value();
            } else {
                sell_value += trade.value();
            }
        }

        let total = buy_value + sell_value;
        if total <= 0.0 {
            return 0.0;
        }
        let imbalance = (buy_value - sell_value) / total;

        let reference = company.shares_outstanding as f64 * 0.01 * company.price;
        let volume_ratio = if reference > 0.0 {
            (total / reference).min(1.0)
        } else {
            1.0
        };

        imbalance * company.volatility * 10.0 * (0.5 + volume_ratio)
    }

    /// Zero-drift GBM step with the symbol's (annualized) volatility.
    fn random_walk(&self, volatility: f64, rng: &mut ChaCha8Rng) -> f64 {
        let sigma = volatility / (self.ticks_per_year.max(1) as f64).sqrt();
        let normal = match Normal::new(0.0, 1.0) {
            Ok(n) => n,
            Err(_) => return 0.0,
        };
        let z: f64 = normal.sample(rng);
        (sigma * z - 0.5 * sigma * sigma).exp_m1()
    }

    fn sector_correlation(&self, company: &Company) -> f64 {
        let performance = self
            .sectors
            .get(&company.sector)
            .map(|s| s.performance)
            .unwrap_or(0.0);
        (performance / 100.0) * company.beta * 0.5
    }

    /// Decayed, scope-weighted impact of every live event touching this
    /// symbol. Direct symbol hits weigh 1.0; sector or market-wide spillover
    /// weighs 0.3.
    fn event_impact(company: &Company, events: &[MarketEvent], tick: i64) -> f64 {
        let mut total = 0.0;
        for event in events {
            if event.expired(tick) || event.duration_ticks <= 0 {
                continue;
            }
            let direct = event
                .symbol
                .as_deref()
                .map(|s| s == company.symbol)
                .unwrap_or(false);
            let scoped = direct
                || event.event_type.is_market_wide()
                || event.sector.map(|s| s == company.sector).unwrap_or(false);
            if !scoped {
                continue;
            }

            let elapsed = (tick - event.origin_tick).max(0) as f64;
            let decay = 1.0 - elapsed / event.duration_ticks as f64;
            if decay <= 0.0 {
                continue;
            }
            total += event.impact * decay * if direct { 1.0 } else { 0.3 };
        }
        total * company.volatility * 5.0
    }

    /// Run the composite model for every company. `trades` is this tick's
    /// full fill list; `events` the currently active events.
    pub fn update_prices(
        &mut self,
        tick: i64,
        trades: &[Trade],
        events: &[MarketEvent],
        rng: &mut ChaCha8Rng,
    ) -> Vec<PriceChange> {
        let mut by_symbol: HashMap<&str, Vec<&Trade>> = HashMap::new();
        for trade in trades {
            by_symbol.entry(trade.symbol.as_str()).or_default().push(trade);
        }

        // Deterministic iteration so the per-tick RNG stream is stable.
        let mut symbols: Vec<String> = self.companies.keys().cloned().collect();
        symbols.sort();

        let mut changes = Vec::with_capacity(symbols.len());
        let mut sector_returns: HashMap<Sector, Vec<f64>> = HashMap::new();

        for symbol in &symbols {
            let symbol_trades = by_symbol.get(symbol.as_str()).cloned().unwrap_or_default();
            let (pressure, random, sector, event_term, volume) = {
                let company = self.companies.get(symbol).expect("symbol from keys");
                let pressure = Self::agent_pressure(company, &symbol_trades);
                let random = self.random_walk(company.volatility, rng);
                let sector = self.sector_correlation(company);
                let event_term = Self::event_impact(company, events, tick);
                let volume: i64 = symbol_trades.iter().map(|t| t.quantity).sum();
                (pressure, random, sector, event_term, volume)
            };

            let weighted_pressure = self.weight_agent * pressure;
            let weighted_random = self.weight_random * random;
            let weighted_sector = self.weight_sector * sector;
            let raw = weighted_pressure + weighted_random + weighted_sector + event_term;
            if !raw.is_finite() {
                warn!(symbol = %symbol, "non-finite composite return, skipping update");
                continue;
            }
            let clamped = raw.clamp(-self.max_move, self.max_move);

            let company = self.companies.get_mut(symbol).expect("symbol from keys");
            let old_price = company.price;
            let mut new_price = (old_price * (1.0 + clamped)).max(self.price_floor);
            new_price = (new_price * 100.0).round() / 100.0;
            new_price = new_price.max(self.price_floor);

            company.previous_close = old_price;
            company.price = new_price;
            company.high = company.high.max(new_price);
            company.low = company.low.min(new_price);
            company.momentum = 0.9 * company.momentum + 0.1 * clamped;
            company.manipulation_score *= 0.99;
            if pressure.abs() > MANIPULATION_PRESSURE_THRESHOLD {
                company.manipulation_score += pressure.abs();
            }
            company.market_cap = new_price * company.shares_outstanding as f64;

            let actual_return = if old_price > 0.0 {
                new_price / old_price - 1.0
            } else {
                0.0
            };
            sector_returns
                .entry(company.sector)
                .or_default()
                .push(actual_return);

            changes.push(PriceChange {
                symbol: symbol.clone(),
                old_price,
                new_price,
                change: new_price - old_price,
                change_percent: actual_return * 100.0,
                volume,
                breakdown: ReturnBreakdown {
                    agent_pressure_bps: weighted_pressure * 10_000.0,
                    random_walk_bps: weighted_random * 10_000.0,
                    sector_bps: weighted_sector * 10_000.0,
                    event_bps: event_term * 10_000.0,
                },
            });
        }

        // Roll the realized constituent returns into sector performance.
        for (sector, returns) in sector_returns {
            let mean_pct = returns.iter().sum::<f64>() / returns.len() as f64 * 100.0;
            let stats = self.sectors.entry(sector).or_default();
            stats.performance = 0.9 * stats.performance + 0.1 * mean_pct;
        }
        self.refresh_sector_volatility();

        changes
    }

    /// Mean momentum across the universe; drives regime detection.
    pub fn mean_momentum(&self) -> f64 {
        if self.companies.is_empty() {
            return 0.0;
        }
        self.companies.values().map(|c| c.momentum).sum::<f64>() / self.companies.len() as f64
    }

    /// Mean manipulation score across the universe.
    pub fn mean_manipulation(&self) -> f64 {
        if self.companies.is_empty() {
            return 0.0;
        }
        self.companies.values().map(|c| c.manipulation_score).sum::<f64>()
            / self.companies.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType;
    use chrono::Utc;
    use rand::SeedableRng;

    fn trade(symbol: &str, price: f64, qty: i64) -> Trade {
        Trade {
            id: "t".to_string(),
            symbol: symbol.to_string(),
            buyer_agent_id: "b".to_string(),
            seller_agent_id: "s".to_string(),
            buyer_order_id: "bo".to_string(),
            seller_order_id: "so".to_string(),
            price,
            quantity: qty,
            tick: 1,
            executed_at: Utc::now(),
        }
    }

    fn engine_with_company(company: Company) -> PriceEngine {
        let mut engine = PriceEngine::new(&EngineConfig::default());
        engine.load_companies(vec![company]);
        engine
    }

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(7)
    }

    #[test]
    fn clamp_bounds_extreme_pressure() {
        // Extreme buy pressure: volatility 1, tiny float, huge trade.
        let company = Company::new("PUMP", "Pump Corp", Sector::Technology, 100.0, 100, 1.0, 1.0);
        let mut engine = engine_with_company(company);

        let trades = vec![trade("PUMP", 200.0, 100_000)];
        let changes = engine.update_prices(1, &trades, &[], &mut rng());

        let change = &changes[0];
        assert!(change.new_price <= 110.0 + 1e-9, "price {} above clamp", change.new_price);
        assert!((change.new_price / change.old_price - 1.0).abs() <= 0.1 + 1e-9);
    }

    #[test]
    fn price_never_below_floor() {
        let company = Company::new("DUST", "Dust Inc", Sector::Energy, 0.01, 1_000_000, 3.0, 1.0);
        let mut engine = engine_with_company(company);

        for tick in 1..50 {
            let changes = engine.update_prices(tick, &[], &[], &mut rng());
            assert!(changes[0].new_price >= 0.01);
        }
    }

    #[test]
    fn no_trades_means_zero_pressure() {
        let company = Company::new("IDLE", "Idle Co", Sector::Finance, 50.0, 1_000_000, 0.2, 1.0);
        let mut engine = engine_with_company(company);

        let changes = engine.update_prices(1, &[], &[], &mut rng());
        assert_eq!(changes[0].breakdown.agent_pressure_bps, 0.0);
        assert_eq!(changes[0].volume, 0);
    }

    #[test]
    fn event_impact_decays_and_spills_to_sector() {
        let direct = Company::new("BIO", "Bio Corp", Sector::Healthcare, 100.0, 1_000_000, 0.5, 1.0);
        let event = MarketEvent {
            id: "e1".to_string(),
            event_type: EventType::FdaApproval,
            symbol: Some("BIO".to_string()),
            sector: Some(Sector::Healthcare),
            impact: 0.2,
            duration_ticks: 10,
            origin_tick: 0,
            headline: "FDA approves".to_string(),
        };

        // Fresh event, direct hit.
        let fresh = PriceEngine::event_impact(&direct, std::slice::from_ref(&event), 0);
        assert!((fresh - 0.2 * 1.0 * 0.5 * 5.0).abs() < 1e-9);

        // Half-decayed.
        let halfway = PriceEngine::event_impact(&direct, std::slice::from_ref(&event), 5);
        assert!((halfway - 0.2 * 0.5 * 0.5 * 5.0).abs() < 1e-9);

        // Expired.
        assert_eq!(PriceEngine::event_impact(&direct, std::slice::from_ref(&event), 10), 0.0);

        // Sector neighbor gets the 0.3 spillover factor.
        let neighbor =
            Company::new("MED", "Med Co", Sector::Healthcare, 100.0, 1_000_000, 0.5, 1.0);
        let spill = PriceEngine::event_impact(&neighbor, std::slice::from_ref(&event), 0);
        assert!((spill - 0.2 * 1.0 * 0.3 * 0.5 * 5.0).abs() < 1e-9);

        // Unrelated sector sees nothing.
        let other = Company::new("OIL", "Oil Co", Sector::Energy, 100.0, 1_000_000, 0.5, 1.0);
        assert_eq!(PriceEngine::event_impact(&other, std::slice::from_ref(&event), 0), 0.0);
    }

    #[test]
    fn manipulation_score_decays_and_accumulates() {
        let company = Company::new("MANI", "Mani Corp", Sector::Crypto, 100.0, 1000, 1.0, 1.0);
        let mut engine = engine_with_company(company);

        // Heavy one-sided flow drives the score up.
        let trades = vec![trade("MANI", 150.0, 10_000)];
        engine.update_prices(1, &trades, &[], &mut rng());
        let after_pump = engine.company("MANI").unwrap().manipulation_score;
        assert!(after_pump > 0.0);

        // Quiet ticks decay it.
        engine.update_prices(2, &[], &[], &mut rng());
        let after_quiet = engine.company("MANI").unwrap().manipulation_score;
        assert!(after_quiet < after_pump);
        assert!((after_quiet - after_pump * 0.99).abs() < 1e-9);
    }

    #[test]
    fn same_seed_same_prices() {
        let make = || {
            let company =
                Company::new("DET", "Det Co", Sector::Media, 75.0, 1_000_000, 0.4, 1.2);
            engine_with_company(company)
        };

        let mut a = make();
        let mut b = make();
        for tick in 1..20 {
            let ca = a.update_prices(tick, &[], &[], &mut ChaCha8Rng::seed_from_u64(tick as u64));
            let cb = b.update_prices(tick, &[], &[], &mut ChaCha8Rng::seed_from_u64(tick as u64));
            assert_eq!(ca[0].new_price, cb[0].new_price);
        }
    }

    #[test]
    fn running_extremes_track_session() {
        let company = Company::new("SWING", "Swing Co", Sector::Consumer, 100.0, 1_000_000, 0.8, 1.0);
        let mut engine = engine_with_company(company);

        for tick in 1..100 {
            engine.update_prices(tick, &[], &[], &mut rng());
            let c = engine.company("SWING").unwrap();
            assert!(c.high >= c.price || (c.high - c.price).abs() < 1e-9);
            assert!(c.low <= c.price || (c.low - c.price).abs() < 1e-9);
            assert!(c.high >= c.low);
        }
    }
}
