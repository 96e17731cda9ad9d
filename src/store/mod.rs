//! Durable state store for the tick engine.
//!
//! SQLite with WAL so the gateway can read while the engine writes. All
//! monetary columns are fixed-scale decimal strings: 4 fractional digits for
//! prices, 2 for cash. Multi-row writes inside a tick run in a single
//! `BEGIN IMMEDIATE` transaction.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{info, warn};

use crate::models::{
    Agent, AgentInvestigationStatus, AgentStatus, Company, CrimeType, Holding, Investigation,
    InvestigationStage, MarketRegime, NewsArticle, NewsCategory, Order, OrderSide, OrderStatus,
    OrderType, Sector, Trade, TradingStatus, Violation, WorldState,
};

/// Format a price with store scale (4 fractional digits).
pub fn price_str(v: f64) -> String {
    format!("{v:.4}")
}

/// Format a cash amount with store scale (2 fractional digits).
pub fn cash_str(v: f64) -> String {
    format!("{v:.2}")
}

fn num(s: &str) -> f64 {
    s.trim().parse::<f64>().unwrap_or(0.0)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    role TEXT NOT NULL,
    status TEXT NOT NULL,
    investigation_status TEXT NOT NULL,
    cash TEXT NOT NULL,
    margin_used TEXT NOT NULL,
    margin_limit TEXT NOT NULL,
    reputation INTEGER NOT NULL,
    callback_url TEXT,
    webhook_secret TEXT,
    webhook_failures INTEGER NOT NULL DEFAULT 0,
    webhook_paused INTEGER NOT NULL DEFAULT 0,
    last_webhook_error TEXT,
    avg_response_time_ms REAL NOT NULL DEFAULT 0,
    response_count INTEGER NOT NULL DEFAULT 0,
    imprisoned_until_tick INTEGER,
    last_violation_tick INTEGER,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS companies (
    symbol TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    sector TEXT NOT NULL,
    price TEXT NOT NULL,
    previous_close TEXT NOT NULL,
    open_price TEXT NOT NULL,
    high TEXT NOT NULL,
    low TEXT NOT NULL,
    shares_outstanding INTEGER NOT NULL,
    market_cap TEXT NOT NULL,
    volatility REAL NOT NULL,
    beta REAL NOT NULL,
    momentum REAL NOT NULL DEFAULT 0,
    sentiment REAL NOT NULL DEFAULT 0,
    manipulation_score REAL NOT NULL DEFAULT 0,
    trading_status TEXT NOT NULL,
    ceo_agent_id TEXT
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL REFERENCES agents(id),
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    order_type TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    limit_price TEXT,
    stop_price TEXT,
    filled_quantity INTEGER NOT NULL DEFAULT 0,
    avg_fill_price TEXT NOT NULL DEFAULT '0.0000',
    status TEXT NOT NULL,
    tick_submitted INTEGER NOT NULL,
    tick_filled INTEGER,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_orders_symbol_status ON orders(symbol, status, created_at);
CREATE INDEX IF NOT EXISTS idx_orders_agent_status ON orders(agent_id, status);

CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    buyer_agent_id TEXT NOT NULL REFERENCES agents(id),
    seller_agent_id TEXT NOT NULL REFERENCES agents(id),
    buyer_order_id TEXT NOT NULL,
    seller_order_id TEXT NOT NULL,
    price TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    tick INTEGER NOT NULL,
    executed_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_trades_tick ON trades(tick DESC);
CREATE INDEX IF NOT EXISTS idx_trades_symbol_tick ON trades(symbol, tick DESC);

CREATE TABLE IF NOT EXISTS holdings (
    agent_id TEXT NOT NULL REFERENCES agents(id),
    symbol TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    avg_cost TEXT NOT NULL,
    PRIMARY KEY (agent_id, symbol)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS news (
    id TEXT PRIMARY KEY,
    tick INTEGER NOT NULL,
    headline TEXT NOT NULL,
    content TEXT NOT NULL,
    category TEXT NOT NULL,
    sentiment REAL NOT NULL,
    symbols_json TEXT NOT NULL,
    agents_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_news_tick ON news(tick DESC);

CREATE TABLE IF NOT EXISTS investigations (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL REFERENCES agents(id),
    crime_type TEXT NOT NULL,
    stage TEXT NOT NULL,
    tick_opened INTEGER NOT NULL,
    tick_activated INTEGER,
    tick_charged INTEGER,
    tick_trial INTEGER,
    tick_resolved INTEGER,
    fine TEXT NOT NULL DEFAULT '0.00',
    sentence_years REAL NOT NULL DEFAULT 0,
    evidence_count INTEGER NOT NULL DEFAULT 1
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_investigations_agent ON investigations(agent_id, stage);

CREATE TABLE IF NOT EXISTS violations (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL REFERENCES agents(id),
    crime_type TEXT NOT NULL,
    tick INTEGER NOT NULL,
    description TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_violations_agent_tick ON violations(agent_id, tick DESC);

CREATE TABLE IF NOT EXISTS world_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    tick INTEGER NOT NULL,
    market_open INTEGER NOT NULL,
    regime TEXT NOT NULL,
    interest_rate REAL NOT NULL,
    last_tick_at TEXT,
    seed INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS actions (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    tick INTEGER NOT NULL,
    action_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    result TEXT NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_actions_agent_tick ON actions(agent_id, tick DESC);

CREATE TABLE IF NOT EXISTS portfolio_snapshots (
    tick INTEGER NOT NULL,
    agent_id TEXT NOT NULL,
    cash TEXT NOT NULL,
    net_worth TEXT NOT NULL,
    holdings_json TEXT NOT NULL,
    PRIMARY KEY (tick, agent_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS world_snapshots (
    tick INTEGER PRIMARY KEY,
    companies_json TEXT NOT NULL,
    books_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tick_records (
    tick INTEGER PRIMARY KEY,
    record_json TEXT NOT NULL,
    seq_start INTEGER NOT NULL,
    seq_end INTEGER NOT NULL,
    recorded_at TEXT NOT NULL
);
"#;

const AGENT_COLS: &str = "id, name, role, status, investigation_status, cash, margin_used, \
     margin_limit, reputation, callback_url, webhook_secret, webhook_failures, webhook_paused, \
     last_webhook_error, avg_response_time_ms, response_count, imprisoned_until_tick, \
     last_violation_tick, created_at";

const COMPANY_COLS: &str = "symbol, name, sector, price, previous_close, open_price, high, low, \
     shares_outstanding, market_cap, volatility, beta, momentum, sentiment, manipulation_score, \
     trading_status, ceo_agent_id";

const ORDER_COLS: &str = "id, agent_id, symbol, side, order_type, quantity, limit_price, \
     stop_price, filled_quantity, avg_fill_price, status, tick_submitted, tick_filled, created_at";

const TRADE_COLS: &str = "id, symbol, buyer_agent_id, seller_agent_id, buyer_order_id, \
     seller_order_id, price, quantity, tick, executed_at";

const INVESTIGATION_COLS: &str = "id, agent_id, crime_type, stage, tick_opened, tick_activated, \
     tick_charged, tick_trial, tick_resolved, fine, sentence_years, evidence_count";

/// Engine-side handle to the relational store.
pub struct EngineStore {
    conn: Arc<Mutex<Connection>>,
}

impl EngineStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open database at {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize database schema")?;
        info!("store initialized at {db_path}");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Throwaway in-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // World state
    // ------------------------------------------------------------------

    pub fn load_world_state(&self) -> Result<Option<WorldState>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT tick, market_open, regime, interest_rate, last_tick_at, seed \
             FROM world_state WHERE id = 1",
        )?;
        let mut rows = stmt.query([])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let regime: String = row.get(2)?;
        let last_tick_at: Option<String> = row.get(4)?;
        let seed: i64 = row.get(5)?;
        Ok(Some(WorldState {
            tick: row.get(0)?,
            market_open: row.get::<_, i64>(1)? != 0,
            regime: MarketRegime::parse(&regime).unwrap_or(MarketRegime::Normal),
            interest_rate: row.get(3)?,
            last_tick_at: last_tick_at.map(|s| parse_ts(&s)),
            seed: seed as u64,
        }))
    }

    pub fn save_world_state(&self, world: &WorldState) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO world_state (id, tick, market_open, regime, interest_rate, last_tick_at, seed) \
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(id) DO UPDATE SET \
                tick=excluded.tick, market_open=excluded.market_open, regime=excluded.regime, \
                interest_rate=excluded.interest_rate, last_tick_at=excluded.last_tick_at, \
                seed=excluded.seed",
            params![
                world.tick,
                world.market_open as i64,
                world.regime.as_str(),
                world.interest_rate,
                world.last_tick_at.map(|t| t.to_rfc3339()),
                world.seed as i64,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    fn row_to_agent(row: &rusqlite::Row) -> rusqlite::Result<Agent> {
        let status: String = row.get(3)?;
        let inv_status: String = row.get(4)?;
        let cash: String = row.get(5)?;
        let margin_used: String = row.get(6)?;
        let margin_limit: String = row.get(7)?;
        let created_at: String = row.get(18)?;
        Ok(Agent {
            id: row.get(0)?,
            name: row.get(1)?,
            role: row.get(2)?,
            status: AgentStatus::parse(&status).unwrap_or(AgentStatus::Active),
            investigation_status: AgentInvestigationStatus::parse(&inv_status)
                .unwrap_or(AgentInvestigationStatus::None),
            cash: num(&cash),
            margin_used: num(&margin_used),
            margin_limit: num(&margin_limit),
            reputation: row.get::<_, i64>(8)? as f64,
            callback_url: row.get(9)?,
            webhook_secret: row.get(10)?,
            webhook_failures: row.get(11)?,
            webhook_paused: row.get::<_, i64>(12)? != 0,
            last_webhook_error: row.get(13)?,
            avg_response_time_ms: row.get(14)?,
            response_count: row.get(15)?,
            imprisoned_until_tick: row.get(16)?,
            last_violation_tick: row.get(17)?,
            created_at: parse_ts(&created_at),
        })
    }

    pub fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agents (id, name, role, status, investigation_status, cash, margin_used, \
                margin_limit, reputation, callback_url, webhook_secret, webhook_failures, \
                webhook_paused, last_webhook_error, avg_response_time_ms, response_count, \
                imprisoned_until_tick, last_violation_tick, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19) \
             ON CONFLICT(id) DO UPDATE SET \
                name=excluded.name, role=excluded.role, status=excluded.status, \
                investigation_status=excluded.investigation_status, cash=excluded.cash, \
                margin_used=excluded.margin_used, margin_limit=excluded.margin_limit, \
                reputation=excluded.reputation, callback_url=excluded.callback_url, \
                webhook_secret=excluded.webhook_secret",
            params![
                agent.id,
                agent.name,
                agent.role,
                agent.status.as_str(),
                agent.investigation_status.as_str(),
                cash_str(agent.cash),
                cash_str(agent.margin_used),
                cash_str(agent.margin_limit),
                agent.reputation.round() as i64,
                agent.callback_url,
                agent.webhook_secret,
                agent.webhook_failures,
                agent.webhook_paused as i64,
                agent.last_webhook_error,
                agent.avg_response_time_ms,
                agent.response_count,
                agent.imprisoned_until_tick,
                agent.last_violation_tick,
                agent.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {AGENT_COLS} FROM agents WHERE id = ?1");
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query([agent_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_agent(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {AGENT_COLS} FROM agents ORDER BY id");
        let mut stmt = conn.prepare_cached(&sql)?;
        let agents = stmt
            .query_map([], Self::row_to_agent)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(agents)
    }

    /// Agents eligible for webhook delivery: active, with a callback URL.
    pub fn agents_with_callbacks(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {AGENT_COLS} FROM agents \
             WHERE status = 'active' AND callback_url IS NOT NULL AND callback_url != '' \
             ORDER BY id"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let agents = stmt
            .query_map([], Self::row_to_agent)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(agents)
    }

    pub fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET status = ?1 WHERE id = ?2",
            params![status.as_str(), agent_id],
        )?;
        Ok(())
    }

    pub fn set_investigation_status(
        &self,
        agent_id: &str,
        status: AgentInvestigationStatus,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET investigation_status = ?1 WHERE id = ?2",
            params![status.as_str(), agent_id],
        )?;
        Ok(())
    }

    pub fn set_agent_cash(&self, agent_id: &str, cash: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET cash = ?1 WHERE id = ?2",
            params![cash_str(cash), agent_id],
        )?;
        Ok(())
    }

    /// Conditional deduction: succeeds only when the balance covers it.
    /// Used by BRIBE so two actions can't spend the same cash.
    pub fn try_deduct_cash(&self, agent_id: &str, amount: f64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE agents \
             SET cash = printf('%.2f', CAST(cash AS REAL) - ?1) \
             WHERE id = ?2 AND CAST(cash AS REAL) >= ?1",
            params![amount, agent_id],
        )?;
        Ok(changed > 0)
    }

    pub fn add_cash(&self, agent_id: &str, amount: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET cash = printf('%.2f', CAST(cash AS REAL) + ?1) WHERE id = ?2",
            params![amount, agent_id],
        )?;
        Ok(())
    }

    pub fn set_margin_used(&self, agent_id: &str, amount: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET margin_used = ?1 WHERE id = ?2",
            params![cash_str(amount.max(0.0)), agent_id],
        )?;
        Ok(())
    }

    pub fn update_reputation(&self, agent_id: &str, reputation: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET reputation = ?1 WHERE id = ?2",
            params![reputation.clamp(0, 100), agent_id],
        )?;
        Ok(())
    }

    pub fn set_imprisoned(&self, agent_id: &str, until_tick: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET status = 'imprisoned', imprisoned_until_tick = ?1 WHERE id = ?2",
            params![until_tick, agent_id],
        )?;
        Ok(())
    }

    /// Release agents whose sentence has elapsed; returns the released ids.
    pub fn release_imprisoned(&self, current_tick: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM agents \
             WHERE status = 'imprisoned' AND imprisoned_until_tick IS NOT NULL \
               AND imprisoned_until_tick <= ?1",
        )?;
        let ids: Vec<String> = stmt
            .query_map([current_tick], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        for id in &ids {
            conn.execute(
                "UPDATE agents SET status = 'active', imprisoned_until_tick = NULL WHERE id = ?1",
                [id],
            )?;
        }
        Ok(ids)
    }

    pub fn set_last_violation(&self, agent_id: &str, tick: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET last_violation_tick = ?1 WHERE id = ?2",
            params![tick, agent_id],
        )?;
        Ok(())
    }

    pub fn record_webhook_success(
        &self,
        agent_id: &str,
        avg_response_time_ms: f64,
        response_count: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET webhook_failures = 0, webhook_paused = 0, last_webhook_error = NULL, \
                avg_response_time_ms = ?1, response_count = ?2 \
             WHERE id = ?3",
            params![avg_response_time_ms, response_count, agent_id],
        )?;
        Ok(())
    }

    pub fn record_webhook_failure(
        &self,
        agent_id: &str,
        failures: i64,
        error: &str,
        paused: bool,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET webhook_failures = ?1, last_webhook_error = ?2, webhook_paused = ?3 \
             WHERE id = ?4",
            params![failures, error, paused as i64, agent_id],
        )?;
        Ok(())
    }

    /// Reconnect signal from the gateway: unpause and forget failures.
    pub fn resume_webhooks(&self, agent_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET webhook_failures = 0, webhook_paused = 0 WHERE id = ?1",
            [agent_id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Companies
    // ------------------------------------------------------------------

    fn row_to_company(row: &rusqlite::Row) -> rusqlite::Result<Company> {
        let sector: String = row.get(2)?;
        let price: String = row.get(3)?;
        let previous_close: String = row.get(4)?;
        let open_price: String = row.get(5)?;
        let high: String = row.get(6)?;
        let low: String = row.get(7)?;
        let market_cap: String = row.get(9)?;
        let trading_status: String = row.get(15)?;
        Ok(Company {
            symbol: row.get(0)?,
            name: row.get(1)?,
            sector: Sector::parse(&sector).unwrap_or(Sector::Technology),
            price: num(&price),
            previous_close: num(&previous_close),
            open_price: num(&open_price),
            high: num(&high),
            low: num(&low),
            shares_outstanding: row.get(8)?,
            market_cap: num(&market_cap),
            volatility: row.get(10)?,
            beta: row.get(11)?,
            momentum: row.get(12)?,
            sentiment: row.get(13)?,
            manipulation_score: row.get(14)?,
            trading_status: TradingStatus::parse(&trading_status).unwrap_or(TradingStatus::Active),
            ceo_agent_id: row.get(16)?,
        })
    }

    pub fn upsert_company(&self, company: &Company) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO companies (symbol, name, sector, price, previous_close, open_price, high, \
                low, shares_outstanding, market_cap, volatility, beta, momentum, sentiment, \
                manipulation_score, trading_status, ceo_agent_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17) \
             ON CONFLICT(symbol) DO UPDATE SET \
                name=excluded.name, sector=excluded.sector, price=excluded.price, \
                previous_close=excluded.previous_close, open_price=excluded.open_price, \
                high=excluded.high, low=excluded.low, \
                shares_outstanding=excluded.shares_outstanding, market_cap=excluded.market_cap, \
                volatility=excluded.volatility, beta=excluded.beta, momentum=excluded.momentum, \
                sentiment=excluded.sentiment, manipulation_score=excluded.manipulation_score, \
                trading_status=excluded.trading_status, ceo_agent_id=excluded.ceo_agent_id",
            params![
                company.symbol,
                company.name,
                company.sector.as_str(),
                price_str(company.price),
                price_str(company.previous_close),
                price_str(company.open_price),
                price_str(company.high),
                price_str(company.low),
                company.shares_outstanding,
                cash_str(company.market_cap),
                company.volatility,
                company.beta,
                company.momentum,
                company.sentiment,
                company.manipulation_score,
                company.trading_status.as_str(),
                company.ceo_agent_id,
            ],
        )?;
        Ok(())
    }

    pub fn list_companies(&self) -> Result<Vec<Company>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {COMPANY_COLS} FROM companies ORDER BY symbol");
        let mut stmt = conn.prepare_cached(&sql)?;
        let companies = stmt
            .query_map([], Self::row_to_company)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(companies)
    }

    pub fn get_company(&self, symbol: &str) -> Result<Option<Company>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {COMPANY_COLS} FROM companies WHERE symbol = ?1");
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query([symbol])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_company(row)?)),
            None => Ok(None),
        }
    }

    /// Persist the per-tick market fields for a batch of companies in one
    /// transaction (phase 11 of the tick).
    pub fn update_company_market_batch(&self, companies: &[&Company]) -> Result<()> {
        if companies.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<()> {
            for company in companies {
                conn.execute(
                    "UPDATE companies SET price = ?1, previous_close = ?2, high = ?3, low = ?4, \
                        momentum = ?5, sentiment = ?6, manipulation_score = ?7, market_cap = ?8 \
                     WHERE symbol = ?9",
                    params![
                        price_str(company.price),
                        price_str(company.previous_close),
                        price_str(company.high),
                        price_str(company.low),
                        company.momentum,
                        company.sentiment,
                        company.manipulation_score,
                        cash_str(company.market_cap),
                        company.symbol,
                    ],
                )?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    fn row_to_order(row: &rusqlite::Row) -> rusqlite::Result<Order> {
        let side: String = row.get(3)?;
        let order_type: String = row.get(4)?;
        let limit_price: Option<String> = row.get(6)?;
        let stop_price: Option<String> = row.get(7)?;
        let avg_fill_price: String = row.get(9)?;
        let status: String = row.get(10)?;
        let created_at: String = row.get(13)?;
        Ok(Order {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            symbol: row.get(2)?,
            side: OrderSide::parse(&side).unwrap_or(OrderSide::Buy),
            order_type: OrderType::parse(&order_type).unwrap_or(OrderType::Limit),
            quantity: row.get(5)?,
            limit_price: limit_price.map(|s| num(&s)),
            stop_price: stop_price.map(|s| num(&s)),
            filled_quantity: row.get(8)?,
            avg_fill_price: num(&avg_fill_price),
            status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Pending),
            tick_submitted: row.get(11)?,
            tick_filled: row.get(12)?,
            created_at: parse_ts(&created_at),
        })
    }

    pub fn insert_order(&self, order: &Order) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO orders (id, agent_id, symbol, side, order_type, quantity, limit_price, \
                stop_price, filled_quantity, avg_fill_price, status, tick_submitted, tick_filled, \
                created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                order.id,
                order.agent_id,
                order.symbol,
                order.side.as_str(),
                order.order_type.as_str(),
                order.quantity,
                order.limit_price.map(price_str),
                order.stop_price.map(price_str),
                order.filled_quantity,
                price_str(order.avg_fill_price),
                order.status.as_str(),
                order.tick_submitted,
                order.tick_filled,
                order.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_order(&self, order_id: &str) -> Result<Option<Order>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {ORDER_COLS} FROM orders WHERE id = ?1");
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query([order_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_order(row)?)),
            None => Ok(None),
        }
    }

    /// Symbols with pending orders, for the matching phase.
    pub fn symbols_with_pending_orders(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT symbol FROM orders WHERE status = 'pending' ORDER BY symbol",
        )?;
        let symbols = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(symbols)
    }

    /// Pending queue for one symbol, ordered by submission time (FIFO).
    pub fn pending_orders(&self, symbol: &str) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {ORDER_COLS} FROM orders \
             WHERE symbol = ?1 AND status = 'pending' \
             ORDER BY created_at, id"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let orders = stmt
            .query_map([symbol], Self::row_to_order)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(orders)
    }

    /// Reject every pending order on a symbol (halted/suspended trading).
    pub fn reject_pending_orders(&self, symbol: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE orders SET status = 'rejected' WHERE symbol = ?1 AND status = 'pending'",
            [symbol],
        )?;
        Ok(changed)
    }

    /// Orders currently resting or partially filled for an agent.
    pub fn open_orders_for_agent(&self, agent_id: &str) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {ORDER_COLS} FROM orders \
             WHERE agent_id = ?1 AND status IN ('pending', 'open', 'partial') \
             ORDER BY created_at, id"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let orders = stmt
            .query_map([agent_id], Self::row_to_order)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(orders)
    }

    /// Apply an execution delta to an order with the monotone status machine
    /// enforced. Returns false (and leaves the row alone) on a regression.
    pub fn apply_order_execution(
        &self,
        order_id: &str,
        add_filled: i64,
        fill_avg_price: f64,
        next_status: OrderStatus,
        tick: i64,
    ) -> Result<bool> {
        let Some(order) = self.get_order(order_id)? else {
            warn!(order_id, "execution update for unknown order");
            return Ok(false);
        };
        if !order.status.can_transition_to(next_status) {
            warn!(
                order_id,
                from = order.status.as_str(),
                to = next_status.as_str(),
                "rejected non-monotone order status transition"
            );
            return Ok(false);
        }

        let new_filled = order.filled_quantity + add_filled;
        let new_avg = if new_filled > 0 {
            (order.avg_fill_price * order.filled_quantity as f64
                + fill_avg_price * add_filled as f64)
                / new_filled as f64
        } else {
            0.0
        };
        let tick_filled = if next_status == OrderStatus::Filled {
            Some(tick)
        } else {
            order.tick_filled
        };

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET filled_quantity = ?1, avg_fill_price = ?2, status = ?3, \
                tick_filled = ?4 \
             WHERE id = ?5",
            params![
                new_filled,
                price_str(new_avg),
                next_status.as_str(),
                tick_filled,
                order_id,
            ],
        )?;
        Ok(true)
    }

    /// Plain status move (cancel, reject) with monotonicity enforced.
    pub fn set_order_status(&self, order_id: &str, next_status: OrderStatus) -> Result<bool> {
        let Some(order) = self.get_order(order_id)? else {
            return Ok(false);
        };
        if !order.status.can_transition_to(next_status) {
            warn!(
                order_id,
                from = order.status.as_str(),
                to = next_status.as_str(),
                "rejected non-monotone order status transition"
            );
            return Ok(false);
        }
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET status = ?1 WHERE id = ?2",
            params![next_status.as_str(), order_id],
        )?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Trades
    // ------------------------------------------------------------------

    fn row_to_trade(row: &rusqlite::Row) -> rusqlite::Result<Trade> {
        let price: String = row.get(6)?;
        let executed_at: String = row.get(9)?;
        Ok(Trade {
            id: row.get(0)?,
            symbol: row.get(1)?,
            buyer_agent_id: row.get(2)?,
            seller_agent_id: row.get(3)?,
            buyer_order_id: row.get(4)?,
            seller_order_id: row.get(5)?,
            price: num(&price),
            quantity: row.get(7)?,
            tick: row.get(8)?,
            executed_at: parse_ts(&executed_at),
        })
    }

    pub fn insert_trades(&self, trades: &[Trade]) -> Result<()> {
        if trades.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<()> {
            for trade in trades {
                conn.execute(
                    "INSERT INTO trades (id, symbol, buyer_agent_id, seller_agent_id, \
                        buyer_order_id, seller_order_id, price, quantity, tick, executed_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        trade.id,
                        trade.symbol,
                        trade.buyer_agent_id,
                        trade.seller_agent_id,
                        trade.buyer_order_id,
                        trade.seller_order_id,
                        price_str(trade.price),
                        trade.quantity,
                        trade.tick,
                        trade.executed_at.to_rfc3339(),
                    ],
                )?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    pub fn trades_since(&self, tick_ge: i64) -> Result<Vec<Trade>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {TRADE_COLS} FROM trades WHERE tick >= ?1 ORDER BY tick, id");
        let mut stmt = conn.prepare_cached(&sql)?;
        let trades = stmt
            .query_map([tick_ge], Self::row_to_trade)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(trades)
    }

    pub fn trades_for_agent_since(&self, agent_id: &str, tick_ge: i64) -> Result<Vec<Trade>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {TRADE_COLS} FROM trades \
             WHERE tick >= ?1 AND (buyer_agent_id = ?2 OR seller_agent_id = ?2) \
             ORDER BY tick, id"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let trades = stmt
            .query_map(params![tick_ge, agent_id], Self::row_to_trade)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(trades)
    }

    // ------------------------------------------------------------------
    // Holdings
    // ------------------------------------------------------------------

    fn row_to_holding(row: &rusqlite::Row) -> rusqlite::Result<Holding> {
        let avg_cost: String = row.get(3)?;
        Ok(Holding {
            agent_id: row.get(0)?,
            symbol: row.get(1)?,
            quantity: row.get(2)?,
            avg_cost: num(&avg_cost),
        })
    }

    pub fn get_holding(&self, agent_id: &str, symbol: &str) -> Result<Option<Holding>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT agent_id, symbol, quantity, avg_cost FROM holdings \
             WHERE agent_id = ?1 AND symbol = ?2",
        )?;
        let mut rows = stmt.query(params![agent_id, symbol])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_holding(row)?)),
            None => Ok(None),
        }
    }

    /// Upsert a holding; rows with zero quantity are deleted.
    pub fn set_holding(&self, holding: &Holding) -> Result<()> {
        let conn = self.conn.lock();
        if holding.quantity == 0 {
            conn.execute(
                "DELETE FROM holdings WHERE agent_id = ?1 AND symbol = ?2",
                params![holding.agent_id, holding.symbol],
            )?;
            return Ok(());
        }
        conn.execute(
            "INSERT INTO holdings (agent_id, symbol, quantity, avg_cost) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(agent_id, symbol) DO UPDATE SET \
                quantity=excluded.quantity, avg_cost=excluded.avg_cost",
            params![
                holding.agent_id,
                holding.symbol,
                holding.quantity,
                price_str(holding.avg_cost),
            ],
        )?;
        Ok(())
    }

    pub fn holdings_for_agent(&self, agent_id: &str) -> Result<Vec<Holding>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT agent_id, symbol, quantity, avg_cost FROM holdings \
             WHERE agent_id = ?1 ORDER BY symbol",
        )?;
        let holdings = stmt
            .query_map([agent_id], Self::row_to_holding)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(holdings)
    }

    pub fn all_holdings(&self) -> Result<Vec<Holding>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT agent_id, symbol, quantity, avg_cost FROM holdings ORDER BY agent_id, symbol",
        )?;
        let holdings = stmt
            .query_map([], Self::row_to_holding)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(holdings)
    }

    pub fn delete_holdings_for_agent(&self, agent_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM holdings WHERE agent_id = ?1", [agent_id])?;
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // News
    // ------------------------------------------------------------------

    pub fn insert_news(&self, articles: &[NewsArticle]) -> Result<()> {
        if articles.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<()> {
            for article in articles {
                conn.execute(
                    "INSERT INTO news (id, tick, headline, content, category, sentiment, \
                        symbols_json, agents_json) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        article.id,
                        article.tick,
                        article.headline,
                        article.content,
                        article.category.as_str(),
                        article.sentiment,
                        serde_json::to_string(&article.symbols)?,
                        serde_json::to_string(&article.agents)?,
                    ],
                )?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Mean sentiment per symbol over news since `tick_ge`.
    pub fn news_sentiment_since(&self, tick_ge: i64) -> Result<HashMap<String, f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT sentiment, symbols_json FROM news WHERE tick >= ?1",
        )?;
        let mut rows = stmt.query([tick_ge])?;

        let mut sums: HashMap<String, (f64, usize)> = HashMap::new();
        while let Some(row) = rows.next()? {
            let sentiment: f64 = row.get(0)?;
            let symbols_json: String = row.get(1)?;
            let symbols: Vec<String> = serde_json::from_str(&symbols_json).unwrap_or_default();
            for symbol in symbols {
                let entry = sums.entry(symbol).or_insert((0.0, 0));
                entry.0 += sentiment;
                entry.1 += 1;
            }
        }
        Ok(sums
            .into_iter()
            .map(|(symbol, (sum, count))| (symbol, sum / count as f64))
            .collect())
    }

    // ------------------------------------------------------------------
    // Investigations & violations
    // ------------------------------------------------------------------

    fn row_to_investigation(row: &rusqlite::Row) -> rusqlite::Result<Investigation> {
        let crime_type: String = row.get(2)?;
        let stage: String = row.get(3)?;
        let fine: String = row.get(9)?;
        Ok(Investigation {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            crime_type: CrimeType::parse(&crime_type).unwrap_or(CrimeType::MarketManipulation),
            stage: InvestigationStage::parse(&stage).unwrap_or(InvestigationStage::Open),
            tick_opened: row.get(4)?,
            tick_activated: row.get(5)?,
            tick_charged: row.get(6)?,
            tick_trial: row.get(7)?,
            tick_resolved: row.get(8)?,
            fine: num(&fine),
            sentence_years: row.get(10)?,
            evidence_count: row.get(11)?,
        })
    }

    pub fn insert_investigation(&self, inv: &Investigation) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO investigations (id, agent_id, crime_type, stage, tick_opened, \
                tick_activated, tick_charged, tick_trial, tick_resolved, fine, sentence_years, \
                evidence_count) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                inv.id,
                inv.agent_id,
                inv.crime_type.as_str(),
                inv.stage.as_str(),
                inv.tick_opened,
                inv.tick_activated,
                inv.tick_charged,
                inv.tick_trial,
                inv.tick_resolved,
                cash_str(inv.fine),
                inv.sentence_years,
                inv.evidence_count,
            ],
        )?;
        Ok(())
    }

    pub fn update_investigation(&self, inv: &Investigation) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE investigations SET stage = ?1, tick_activated = ?2, tick_charged = ?3, \
                tick_trial = ?4, tick_resolved = ?5, fine = ?6, sentence_years = ?7, \
                evidence_count = ?8 \
             WHERE id = ?9",
            params![
                inv.stage.as_str(),
                inv.tick_activated,
                inv.tick_charged,
                inv.tick_trial,
                inv.tick_resolved,
                cash_str(inv.fine),
                inv.sentence_years,
                inv.evidence_count,
                inv.id,
            ],
        )?;
        Ok(())
    }

    pub fn unresolved_investigations(&self) -> Result<Vec<Investigation>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {INVESTIGATION_COLS} FROM investigations \
             WHERE stage NOT IN ('convicted', 'acquitted', 'settled') \
             ORDER BY tick_opened, id"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let investigations = stmt
            .query_map([], Self::row_to_investigation)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(investigations)
    }

    pub fn open_investigation_for(&self, agent_id: &str) -> Result<Option<Investigation>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {INVESTIGATION_COLS} FROM investigations \
             WHERE agent_id = ?1 AND stage NOT IN ('convicted', 'acquitted', 'settled') \
             ORDER BY tick_opened LIMIT 1"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query([agent_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_investigation(row)?)),
            None => Ok(None),
        }
    }

    pub fn insert_violation(&self, violation: &Violation) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO violations (id, agent_id, crime_type, tick, description) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                violation.id,
                violation.agent_id,
                violation.crime_type.as_str(),
                violation.tick,
                violation.description,
            ],
        )?;
        Ok(())
    }

    /// Agents with no violation recorded in (tick_gt, now]; used by the
    /// clean-period reputation bonus.
    pub fn violations_since(&self, agent_id: &str, tick_gt: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM violations WHERE agent_id = ?1 AND tick > ?2",
            params![agent_id, tick_gt],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Actions audit
    // ------------------------------------------------------------------

    pub fn record_action(
        &self,
        id: &str,
        agent_id: &str,
        tick: i64,
        action_type: &str,
        payload_json: &str,
        result: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO actions (id, agent_id, tick, action_type, payload_json, result, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                agent_id,
                tick,
                action_type,
                payload_json,
                result,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    pub fn insert_portfolio_snapshots(
        &self,
        tick: i64,
        rows: &[(String, f64, f64, String)],
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<()> {
            for (agent_id, cash, net_worth, holdings_json) in rows {
                conn.execute(
                    "INSERT OR REPLACE INTO portfolio_snapshots \
                        (tick, agent_id, cash, net_worth, holdings_json) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![tick, agent_id, cash_str(*cash), cash_str(*net_worth), holdings_json],
                )?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Most recent snapshot net worth at or before `tick` for an agent.
    pub fn snapshot_net_worth_at(&self, agent_id: &str, tick: i64) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT net_worth FROM portfolio_snapshots \
             WHERE agent_id = ?1 AND tick <= ?2 ORDER BY tick DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![agent_id, tick])?;
        match rows.next()? {
            Some(row) => {
                let s: String = row.get(0)?;
                Ok(Some(num(&s)))
            }
            None => Ok(None),
        }
    }

    pub fn insert_world_snapshot(
        &self,
        tick: i64,
        companies_json: &str,
        books_json: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO world_snapshots (tick, companies_json, books_json, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![tick, companies_json, books_json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn insert_tick_record(
        &self,
        tick: i64,
        record_json: &str,
        seq_start: i64,
        seq_end: i64,
        retention_ticks: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO tick_records (tick, record_json, seq_start, seq_end, recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![tick, record_json, seq_start, seq_end, Utc::now().to_rfc3339()],
        )?;
        conn.execute(
            "DELETE FROM tick_records WHERE tick < ?1",
            params![tick - retention_ticks],
        )?;
        Ok(())
    }

    pub fn tick_record(&self, tick: i64) -> Result<Option<(String, i64, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT record_json, seq_start, seq_end FROM tick_records WHERE tick = ?1",
        )?;
        let mut rows = stmt.query([tick])?;
        match rows.next()? {
            Some(row) => Ok(Some((row.get(0)?, row.get(1)?, row.get(2)?))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_agent(cash: f64) -> (EngineStore, Agent) {
        let store = EngineStore::open_in_memory().unwrap();
        let agent = Agent::new("agent-1", "Tester", cash);
        store.upsert_agent(&agent).unwrap();
        (store, agent)
    }

    #[test]
    fn world_state_round_trips() {
        let store = EngineStore::open_in_memory().unwrap();
        assert!(store.load_world_state().unwrap().is_none());

        let world = WorldState {
            tick: 42,
            market_open: true,
            regime: MarketRegime::Bull,
            interest_rate: 0.03,
            last_tick_at: Some(Utc::now()),
            seed: 12345,
        };
        store.save_world_state(&world).unwrap();

        let loaded = store.load_world_state().unwrap().unwrap();
        assert_eq!(loaded.tick, 42);
        assert!(loaded.market_open);
        assert_eq!(loaded.regime, MarketRegime::Bull);
        assert_eq!(loaded.seed, 12345);
    }

    #[test]
    fn cash_deduction_is_conditional() {
        let (store, agent) = store_with_agent(100.0);

        assert!(store.try_deduct_cash(&agent.id, 60.0).unwrap());
        assert!(!store.try_deduct_cash(&agent.id, 60.0).unwrap());

        let reloaded = store.get_agent(&agent.id).unwrap().unwrap();
        assert!((reloaded.cash - 40.0).abs() < 1e-9);
    }

    #[test]
    fn cash_is_stored_with_two_decimals() {
        let (store, agent) = store_with_agent(1000.0);
        store.add_cash(&agent.id, 0.005).unwrap();
        let reloaded = store.get_agent(&agent.id).unwrap().unwrap();
        // The store boundary carries scale-2 strings.
        assert!((reloaded.cash * 100.0).fract().abs() < 1e-9);
    }

    #[test]
    fn order_status_updates_enforce_monotonicity() {
        let (store, agent) = store_with_agent(1000.0);
        let order = Order {
            id: "o1".to_string(),
            agent_id: agent.id.clone(),
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: 100,
            limit_price: Some(150.0),
            stop_price: None,
            filled_quantity: 0,
            avg_fill_price: 0.0,
            status: OrderStatus::Pending,
            tick_submitted: 1,
            tick_filled: None,
            created_at: Utc::now(),
        };
        store.insert_order(&order).unwrap();

        assert!(store
            .apply_order_execution("o1", 40, 150.0, OrderStatus::Partial, 2)
            .unwrap());
        assert!(store
            .apply_order_execution("o1", 60, 151.0, OrderStatus::Filled, 3)
            .unwrap());

        let loaded = store.get_order("o1").unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Filled);
        assert_eq!(loaded.filled_quantity, 100);
        assert_eq!(loaded.tick_filled, Some(3));
        // VWAP of 40 @ 150 and 60 @ 151.
        assert!((loaded.avg_fill_price - 150.6).abs() < 1e-6);

        // Terminal state refuses further transitions.
        assert!(!store
            .apply_order_execution("o1", 1, 150.0, OrderStatus::Partial, 4)
            .unwrap());
        assert!(!store.set_order_status("o1", OrderStatus::Cancelled).unwrap());
    }

    #[test]
    fn pending_queue_is_fifo_and_rejectable() {
        let (store, agent) = store_with_agent(1000.0);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            let order = Order {
                id: id.to_string(),
                agent_id: agent.id.clone(),
                symbol: "AAPL".to_string(),
                side: OrderSide::Buy,
                order_type: OrderType::Market,
                quantity: 10,
                limit_price: None,
                stop_price: None,
                filled_quantity: 0,
                avg_fill_price: 0.0,
                status: OrderStatus::Pending,
                tick_submitted: 1,
                tick_filled: None,
                created_at: Utc::now() + chrono::Duration::milliseconds(i as i64),
            };
            store.insert_order(&order).unwrap();
        }

        assert_eq!(store.symbols_with_pending_orders().unwrap(), vec!["AAPL"]);
        let pending = store.pending_orders("AAPL").unwrap();
        let ids: Vec<&str> = pending.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        assert_eq!(store.reject_pending_orders("AAPL").unwrap(), 3);
        assert!(store.pending_orders("AAPL").unwrap().is_empty());
    }

    #[test]
    fn holdings_delete_on_zero() {
        let (store, agent) = store_with_agent(1000.0);
        let holding = Holding {
            agent_id: agent.id.clone(),
            symbol: "AAPL".to_string(),
            quantity: 100,
            avg_cost: 100.0,
        };
        store.set_holding(&holding).unwrap();
        assert!(store.get_holding(&agent.id, "AAPL").unwrap().is_some());

        store
            .set_holding(&Holding {
                quantity: 0,
                ..holding
            })
            .unwrap();
        assert!(store.get_holding(&agent.id, "AAPL").unwrap().is_none());
    }

    #[test]
    fn news_sentiment_aggregates_per_symbol() {
        let store = EngineStore::open_in_memory().unwrap();
        let article = |id: &str, tick: i64, sentiment: f64, symbols: Vec<&str>| NewsArticle {
            id: id.to_string(),
            tick,
            headline: "h".to_string(),
            content: "c".to_string(),
            category: NewsCategory::MarketMoves,
            sentiment,
            symbols: symbols.into_iter().map(String::from).collect(),
            agents: Vec::new(),
        };

        store
            .insert_news(&[
                article("n1", 10, 0.5, vec!["AAPL"]),
                article("n2", 11, -0.5, vec!["AAPL", "MSFT"]),
                article("n3", 2, 1.0, vec!["AAPL"]), // outside window
            ])
            .unwrap();

        let sentiment = store.news_sentiment_since(10).unwrap();
        assert!((sentiment["AAPL"] - 0.0).abs() < 1e-9);
        assert!((sentiment["MSFT"] + 0.5).abs() < 1e-9);
    }

    #[test]
    fn reputation_is_clamped_at_the_store_boundary() {
        let (store, agent) = store_with_agent(1000.0);
        store.update_reputation(&agent.id, 250).unwrap();
        assert_eq!(store.get_agent(&agent.id).unwrap().unwrap().reputation, 100.0);
        store.update_reputation(&agent.id, -50).unwrap();
        assert_eq!(store.get_agent(&agent.id).unwrap().unwrap().reputation, 0.0);
    }

    #[test]
    fn imprisonment_release_is_tick_gated() {
        let (store, agent) = store_with_agent(1000.0);
        store.set_imprisoned(&agent.id, 100).unwrap();

        assert!(store.release_imprisoned(99).unwrap().is_empty());
        let released = store.release_imprisoned(100).unwrap();
        assert_eq!(released, vec![agent.id.clone()]);

        let reloaded = store.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(reloaded.status, AgentStatus::Active);
        assert_eq!(reloaded.imprisoned_until_tick, None);
    }

    #[test]
    fn tick_records_prune_beyond_retention() {
        let store = EngineStore::open_in_memory().unwrap();
        for tick in 0..20 {
            store
                .insert_tick_record(tick, "{}", tick * 10, tick * 10 + 5, 10)
                .unwrap();
        }
        assert!(store.tick_record(5).unwrap().is_none());
        assert!(store.tick_record(19).unwrap().is_some());
        assert!(store.tick_record(10).unwrap().is_some());
    }

    #[test]
    fn investigation_rows_round_trip() {
        let (store, agent) = store_with_agent(1000.0);
        let inv = Investigation {
            id: "inv-1".to_string(),
            agent_id: agent.id.clone(),
            crime_type: CrimeType::WashTrading,
            stage: InvestigationStage::Open,
            tick_opened: 5,
            tick_activated: None,
            tick_charged: None,
            tick_trial: None,
            tick_resolved: None,
            fine: 0.0,
            sentence_years: 0.0,
            evidence_count: 1,
        };
        store.insert_investigation(&inv).unwrap();

        let open = store.open_investigation_for(&agent.id).unwrap().unwrap();
        assert_eq!(open.crime_type, CrimeType::WashTrading);

        let mut advanced = open.clone();
        advanced.stage = InvestigationStage::Active;
        advanced.tick_activated = Some(25);
        store.update_investigation(&advanced).unwrap();

        let unresolved = store.unresolved_investigations().unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].stage, InvestigationStage::Active);
    }
}
