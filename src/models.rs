//! Core simulation entities shared across the engine.
//!
//! Monetary values are finite `f64` inside the engine and cross the store
//! boundary as fixed-scale decimal strings (4 fractional digits for prices,
//! 2 for cash). See `store::{price_str, cash_str}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Agent lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Bankrupt,
    Imprisoned,
    Fled,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Bankrupt => "bankrupt",
            AgentStatus::Imprisoned => "imprisoned",
            AgentStatus::Fled => "fled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AgentStatus::Active),
            "bankrupt" => Some(AgentStatus::Bankrupt),
            "imprisoned" => Some(AgentStatus::Imprisoned),
            "fled" => Some(AgentStatus::Fled),
            _ => None,
        }
    }
}

/// Agent-side view of any open investigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentInvestigationStatus {
    None,
    UnderInvestigation,
    Charged,
    Convicted,
    Acquitted,
}

impl AgentInvestigationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentInvestigationStatus::None => "none",
            AgentInvestigationStatus::UnderInvestigation => "under_investigation",
            AgentInvestigationStatus::Charged => "charged",
            AgentInvestigationStatus::Convicted => "convicted",
            AgentInvestigationStatus::Acquitted => "acquitted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(AgentInvestigationStatus::None),
            "under_investigation" => Some(AgentInvestigationStatus::UnderInvestigation),
            "charged" => Some(AgentInvestigationStatus::Charged),
            "convicted" => Some(AgentInvestigationStatus::Convicted),
            "acquitted" => Some(AgentInvestigationStatus::Acquitted),
            _ => None,
        }
    }
}

/// A registered external agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub role: String,
    pub status: AgentStatus,
    pub investigation_status: AgentInvestigationStatus,
    pub cash: f64,
    pub margin_used: f64,
    pub margin_limit: f64,
    /// Reputation in [0, 100]. Fractional in memory so slow decay accumulates;
    /// persisted as an integer only when the integer value moves.
    pub reputation: f64,
    pub callback_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_failures: i64,
    pub webhook_paused: bool,
    pub last_webhook_error: Option<String>,
    pub avg_response_time_ms: f64,
    pub response_count: i64,
    pub imprisoned_until_tick: Option<i64>,
    pub last_violation_tick: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>, cash: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: "trader".to_string(),
            status: AgentStatus::Active,
            investigation_status: AgentInvestigationStatus::None,
            cash,
            margin_used: 0.0,
            margin_limit: cash,
            reputation: 50.0,
            callback_url: None,
            webhook_secret: None,
            webhook_failures: 0,
            webhook_paused: false,
            last_webhook_error: None,
            avg_response_time_ms: 0.0,
            response_count: 0,
            imprisoned_until_tick: None,
            last_violation_tick: None,
            created_at: Utc::now(),
        }
    }
}

/// Market sector; event templates are permitted per sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sector {
    Technology,
    Finance,
    Healthcare,
    Energy,
    Consumer,
    Industrial,
    Media,
    Crypto,
}

impl Sector {
    pub const ALL: [Sector; 8] = [
        Sector::Technology,
        Sector::Finance,
        Sector::Healthcare,
        Sector::Energy,
        Sector::Consumer,
        Sector::Industrial,
        Sector::Media,
        Sector::Crypto,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sector::Technology => "technology",
            Sector::Finance => "finance",
            Sector::Healthcare => "healthcare",
            Sector::Energy => "energy",
            Sector::Consumer => "consumer",
            Sector::Industrial => "industrial",
            Sector::Media => "media",
            Sector::Crypto => "crypto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "technology" => Some(Sector::Technology),
            "finance" => Some(Sector::Finance),
            "healthcare" => Some(Sector::Healthcare),
            "energy" => Some(Sector::Energy),
            "consumer" => Some(Sector::Consumer),
            "industrial" => Some(Sector::Industrial),
            "media" => Some(Sector::Media),
            "crypto" => Some(Sector::Crypto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingStatus {
    Active,
    Suspended,
    Frozen,
}

impl TradingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingStatus::Active => "active",
            TradingStatus::Suspended => "suspended",
            TradingStatus::Frozen => "frozen",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TradingStatus::Active),
            "suspended" => Some(TradingStatus::Suspended),
            "frozen" => Some(TradingStatus::Frozen),
            _ => None,
        }
    }
}

/// A listed company / tradable symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub symbol: String,
    pub name: String,
    pub sector: Sector,
    pub price: f64,
    pub previous_close: f64,
    pub open_price: f64,
    /// Per-session running extremes.
    pub high: f64,
    pub low: f64,
    pub shares_outstanding: i64,
    pub market_cap: f64,
    pub volatility: f64,
    pub beta: f64,
    pub momentum: f64,
    pub sentiment: f64,
    pub manipulation_score: f64,
    pub trading_status: TradingStatus,
    pub ceo_agent_id: Option<String>,
}

impl Company {
    pub fn new(
        symbol: impl Into<String>,
        name: impl Into<String>,
        sector: Sector,
        price: f64,
        shares_outstanding: i64,
        volatility: f64,
        beta: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            name: name.into(),
            sector,
            price,
            previous_close: price,
            open_price: price,
            high: price,
            low: price,
            shares_outstanding,
            market_cap: price * shares_outstanding as f64,
            volatility,
            beta,
            momentum: 0.0,
            sentiment: 0.0,
            manipulation_score: 0.0,
            trading_status: TradingStatus::Active,
            ceo_agent_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::Stop => "STOP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MARKET" => Some(OrderType::Market),
            "LIMIT" => Some(OrderType::Limit),
            "STOP" => Some(OrderType::Stop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::Partial => "partial",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "open" => Some(OrderStatus::Open),
            "partial" => Some(OrderStatus::Partial),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "rejected" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Monotone status machine:
    /// pending → {open|partial|filled|rejected},
    /// open → {partial|filled|cancelled},
    /// partial → {filled|cancelled}; terminal states persist.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            OrderStatus::Pending => matches!(
                next,
                OrderStatus::Open
                    | OrderStatus::Partial
                    | OrderStatus::Filled
                    | OrderStatus::Rejected
            ),
            OrderStatus::Open => matches!(
                next,
                OrderStatus::Partial | OrderStatus::Filled | OrderStatus::Cancelled
            ),
            OrderStatus::Partial => matches!(next, OrderStatus::Filled | OrderStatus::Cancelled),
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected => false,
        }
    }
}

/// An order as submitted by an agent (via the gateway) and settled by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub agent_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: i64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub filled_quantity: i64,
    pub avg_fill_price: f64,
    pub status: OrderStatus,
    pub tick_submitted: i64,
    pub tick_filled: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining(&self) -> i64 {
        self.quantity - self.filled_quantity
    }
}

/// An executed fill. Price is always the resting order's level price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub buyer_agent_id: String,
    pub seller_agent_id: String,
    pub buyer_order_id: String,
    pub seller_order_id: String,
    pub price: f64,
    pub quantity: i64,
    pub tick: i64,
    pub executed_at: DateTime<Utc>,
}

impl Trade {
    pub fn value(&self) -> f64 {
        self.price * self.quantity as f64
    }
}

/// (agent, symbol) position. Negative quantity denotes a short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub agent_id: String,
    pub symbol: String,
    pub quantity: i64,
    pub avg_cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    EarningsBeat,
    EarningsMiss,
    FdaApproval,
    FdaRejection,
    ProductLaunch,
    Scandal,
    MergerRumor,
    SectorBoom,
    SectorBust,
    MemePump,
    ShortSqueeze,
    BlackSwan,
    MarketCrash,
    MarketRally,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::EarningsBeat => "EARNINGS_BEAT",
            EventType::EarningsMiss => "EARNINGS_MISS",
            EventType::FdaApproval => "FDA_APPROVAL",
            EventType::FdaRejection => "FDA_REJECTION",
            EventType::ProductLaunch => "PRODUCT_LAUNCH",
            EventType::Scandal => "SCANDAL",
            EventType::MergerRumor => "MERGER_RUMOR",
            EventType::SectorBoom => "SECTOR_BOOM",
            EventType::SectorBust => "SECTOR_BUST",
            EventType::MemePump => "MEME_PUMP",
            EventType::ShortSqueeze => "SHORT_SQUEEZE",
            EventType::BlackSwan => "BLACK_SWAN",
            EventType::MarketCrash => "MARKET_CRASH",
            EventType::MarketRally => "MARKET_RALLY",
        }
    }

    /// Market-wide events affect every symbol regardless of scope.
    pub fn is_market_wide(&self) -> bool {
        matches!(
            self,
            EventType::BlackSwan | EventType::MarketCrash | EventType::MarketRally
        )
    }
}

/// A typed market event injected into the price engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    pub id: String,
    pub event_type: EventType,
    pub symbol: Option<String>,
    pub sector: Option<Sector>,
    /// Signed impact in return space, before volatility scaling.
    pub impact: f64,
    pub duration_ticks: i64,
    pub origin_tick: i64,
    pub headline: String,
}

impl MarketEvent {
    pub fn expired(&self, current_tick: i64) -> bool {
        current_tick >= self.origin_tick + self.duration_ticks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewsCategory {
    Earnings,
    Regulatory,
    MarketMoves,
    Corporate,
    Crime,
    Analysis,
    Macro,
}

impl NewsCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NewsCategory::Earnings => "earnings",
            NewsCategory::Regulatory => "regulatory",
            NewsCategory::MarketMoves => "market_moves",
            NewsCategory::Corporate => "corporate",
            NewsCategory::Crime => "crime",
            NewsCategory::Analysis => "analysis",
            NewsCategory::Macro => "macro",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "earnings" => Some(NewsCategory::Earnings),
            "regulatory" => Some(NewsCategory::Regulatory),
            "market_moves" => Some(NewsCategory::MarketMoves),
            "corporate" => Some(NewsCategory::Corporate),
            "crime" => Some(NewsCategory::Crime),
            "analysis" => Some(NewsCategory::Analysis),
            "macro" => Some(NewsCategory::Macro),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsArticle {
    pub id: String,
    pub tick: i64,
    pub headline: String,
    pub content: String,
    pub category: NewsCategory,
    /// Sentiment in [-1, 1].
    pub sentiment: f64,
    pub symbols: Vec<String>,
    pub agents: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrimeType {
    InsiderTrading,
    MarketManipulation,
    AccountingFraud,
    WashTrading,
    Bribery,
}

impl CrimeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrimeType::InsiderTrading => "insider_trading",
            CrimeType::MarketManipulation => "market_manipulation",
            CrimeType::AccountingFraud => "accounting_fraud",
            CrimeType::WashTrading => "wash_trading",
            CrimeType::Bribery => "bribery",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insider_trading" => Some(CrimeType::InsiderTrading),
            "market_manipulation" => Some(CrimeType::MarketManipulation),
            "accounting_fraud" => Some(CrimeType::AccountingFraud),
            "wash_trading" => Some(CrimeType::WashTrading),
            "bribery" => Some(CrimeType::Bribery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationStage {
    Open,
    Active,
    Charged,
    Trial,
    Convicted,
    Acquitted,
    Settled,
}

impl InvestigationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestigationStage::Open => "open",
            InvestigationStage::Active => "active",
            InvestigationStage::Charged => "charged",
            InvestigationStage::Trial => "trial",
            InvestigationStage::Convicted => "convicted",
            InvestigationStage::Acquitted => "acquitted",
            InvestigationStage::Settled => "settled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(InvestigationStage::Open),
            "active" => Some(InvestigationStage::Active),
            "charged" => Some(InvestigationStage::Charged),
            "trial" => Some(InvestigationStage::Trial),
            "convicted" => Some(InvestigationStage::Convicted),
            "acquitted" => Some(InvestigationStage::Acquitted),
            "settled" => Some(InvestigationStage::Settled),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            InvestigationStage::Convicted
                | InvestigationStage::Acquitted
                | InvestigationStage::Settled
        )
    }

    /// Monotone lifecycle: open → active → charged → trial → resolution.
    pub fn can_transition_to(&self, next: InvestigationStage) -> bool {
        if *self == next {
            return true;
        }
        match self {
            InvestigationStage::Open => matches!(next, InvestigationStage::Active),
            InvestigationStage::Active => matches!(next, InvestigationStage::Charged),
            InvestigationStage::Charged => matches!(next, InvestigationStage::Trial),
            InvestigationStage::Trial => matches!(
                next,
                InvestigationStage::Convicted
                    | InvestigationStage::Acquitted
                    | InvestigationStage::Settled
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Investigation {
    pub id: String,
    pub agent_id: String,
    pub crime_type: CrimeType,
    pub stage: InvestigationStage,
    pub tick_opened: i64,
    pub tick_activated: Option<i64>,
    pub tick_charged: Option<i64>,
    pub tick_trial: Option<i64>,
    pub tick_resolved: Option<i64>,
    pub fine: f64,
    pub sentence_years: f64,
    /// Detections folded into this investigation since it opened.
    pub evidence_count: i64,
}

/// Alert pushed on the agent channel and the agent's next webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigationAlert {
    pub investigation_id: String,
    pub agent_id: String,
    pub crime_type: CrimeType,
    pub stage: InvestigationStage,
    pub message: String,
    pub tick: i64,
}

/// A suspected violation produced by the detector, kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub id: String,
    pub agent_id: String,
    pub crime_type: CrimeType,
    pub tick: i64,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    Normal,
    Bull,
    Bear,
    Crash,
    Bubble,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::Normal => "normal",
            MarketRegime::Bull => "bull",
            MarketRegime::Bear => "bear",
            MarketRegime::Crash => "crash",
            MarketRegime::Bubble => "bubble",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(MarketRegime::Normal),
            "bull" => Some(MarketRegime::Bull),
            "bear" => Some(MarketRegime::Bear),
            "crash" => Some(MarketRegime::Crash),
            "bubble" => Some(MarketRegime::Bubble),
            _ => None,
        }
    }
}

/// Singleton world row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldState {
    pub tick: i64,
    pub market_open: bool,
    pub regime: MarketRegime,
    pub interest_rate: f64,
    pub last_tick_at: Option<DateTime<Utc>>,
    /// Seed for the deterministic per-tick RNG stream.
    pub seed: u64,
}

impl Default for WorldState {
    fn default() -> Self {
        Self {
            tick: 0,
            market_open: true,
            regime: MarketRegime::Normal,
            interest_rate: 0.05,
            last_tick_at: None,
            seed: 0,
        }
    }
}

/// Actions an agent may return from its webhook response.
///
/// Unknown tags are rejected at the parse boundary and reported back in the
/// next tick's `actionResults`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentAction {
    Buy {
        symbol: String,
        quantity: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit_price: Option<f64>,
    },
    Sell {
        symbol: String,
        quantity: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit_price: Option<f64>,
    },
    Short {
        symbol: String,
        quantity: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit_price: Option<f64>,
    },
    Cover {
        symbol: String,
        quantity: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit_price: Option<f64>,
    },
    CancelOrder {
        order_id: String,
    },
    Rumor {
        symbol: String,
        #[serde(default)]
        content: Option<String>,
    },
    Message {
        to: String,
        content: String,
    },
    Ally {
        with: String,
    },
    Bribe {
        target: String,
        amount: f64,
    },
    Whistleblow {
        target: String,
    },
    Flee {},
}

impl AgentAction {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentAction::Buy { .. } => "BUY",
            AgentAction::Sell { .. } => "SELL",
            AgentAction::Short { .. } => "SHORT",
            AgentAction::Cover { .. } => "COVER",
            AgentAction::CancelOrder { .. } => "CANCEL_ORDER",
            AgentAction::Rumor { .. } => "RUMOR",
            AgentAction::Message { .. } => "MESSAGE",
            AgentAction::Ally { .. } => "ALLY",
            AgentAction::Bribe { .. } => "BRIBE",
            AgentAction::Whistleblow { .. } => "WHISTLEBLOW",
            AgentAction::Flee {} => "FLEE",
        }
    }
}

/// Outcome of one processed action, delivered on the next tick's webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_type: String,
    pub ok: bool,
    pub message: String,
}

impl ActionResult {
    pub fn ok(action_type: &str, message: impl Into<String>) -> Self {
        Self {
            action_type: action_type.to_string(),
            ok: true,
            message: message.into(),
        }
    }

    pub fn err(action_type: &str, message: impl Into<String>) -> Self {
        Self {
            action_type: action_type.to_string(),
            ok: false,
            message: message.into(),
        }
    }
}
