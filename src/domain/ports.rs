use crate::domain::errors::BrokerError;
use crate::domain::trading::types::{OrderSide, OrderStatus, TimeInForce};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct Quote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub cash: Decimal,
    pub buying_power: Decimal,
    pub equity: Decimal,
    pub day_trade_count: u64,
}

#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: Decimal,
    pub avg_entry: Decimal,
    pub market_value: Decimal,
    pub unrealized_pl: Decimal,
}

#[derive(Debug, Clone)]
pub struct BrokerOrder {
    pub broker_order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub filled_avg_price: Option<Decimal>,
    pub status: OrderStatus,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AssetInfo {
    pub symbol: String,
    pub exchange: String,
    pub tradable: bool,
    pub fractionable: bool,
    pub shortable: bool,
}

/// Latest bar per symbol, used by the scanner's batched universe pass.
#[derive(Debug, Clone)]
pub struct BarSnapshot {
    pub symbol: String,
    pub open: Decimal,
    pub close: Decimal,
    pub prev_close: Option<Decimal>,
    pub volume: Decimal,
    pub avg_volume: Option<Decimal>,
    pub ts: DateTime<Utc>,
}

/// Entry leg of a bracket submission.
#[derive(Debug, Clone)]
pub struct EntrySpec {
    pub order_type: crate::domain::trading::types::OrderType,
    pub limit_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct BracketIds {
    pub entry_order_id: String,
    pub stop_loss_order_id: String,
    pub take_profit_order_id: String,
}

/// Per-symbol outcome of a bulk close.
#[derive(Debug, Clone)]
pub struct CloseResult {
    pub symbol: String,
    pub success: bool,
    pub broker_order_id: Option<String>,
    pub error: Option<String>,
}

/// Uniform broker contract. This is the only place broker-specific encoding
/// lives; every other component depends on this trait alone.
///
/// Time-in-force policy: the entry leg MAY be DAY, the stop-loss and
/// take-profit legs MUST be GTC. Prices must be rounded to the broker's
/// minimum increment before submission.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;

    async fn get_quote(&self, symbol: &str) -> Result<Quote, BrokerError>;

    async fn get_account(&self) -> Result<AccountSnapshot, BrokerError>;

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn list_orders(
        &self,
        statuses: &[OrderStatus],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<BrokerOrder>, BrokerError>;

    async fn list_assets(&self) -> Result<Vec<AssetInfo>, BrokerError>;

    /// Latest bars for up to one batch of symbols (the adapter's batch limit).
    async fn latest_bars(&self, symbols: &[String]) -> Result<Vec<BarSnapshot>, BrokerError>;

    #[allow(clippy::too_many_arguments)]
    async fn submit_bracket(
        &self,
        symbol: &str,
        qty: Decimal,
        side: OrderSide,
        time_in_force: TimeInForce,
        entry: EntrySpec,
        stop_loss_price: Decimal,
        take_profit_price: Decimal,
    ) -> Result<BracketIds, BrokerError>;

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError>;

    /// Market order closing the entire position at the broker.
    async fn close_position(
        &self,
        symbol: &str,
        reason: Option<&str>,
    ) -> Result<CloseResult, BrokerError>;

    /// Bulk close; idempotent. Partial failure is reported per symbol, not
    /// as a single error.
    async fn close_all_positions(&self) -> Result<Vec<CloseResult>, BrokerError>;

    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder, BrokerError>;
}

/// A news headline from the catalyst source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Headline {
    pub title: String,
    pub summary: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
}

#[async_trait]
pub trait NewsService: Send + Sync {
    /// Recent headlines mentioning the symbol. An empty vec means no signal,
    /// not an error.
    async fn headlines_for(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Headline>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvisorAction {
    Exit,
    Hold,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorVerdict {
    pub action: AdvisorAction,
    pub reason: String,
}

/// Context handed to the external advisor on a REVIEW verdict.
#[derive(Debug, Clone, Serialize)]
pub struct AdvisorContext {
    pub symbol: String,
    pub side: String,
    pub pnl_pct: f64,
    pub exit_signals: Vec<String>,
    pub hold_signals: Vec<String>,
}

/// Optional external advisor (LLM or heuristic). The platform is fully
/// functional without one; calls are strictly budgeted by the caller.
#[async_trait]
pub trait Advisor: Send + Sync {
    async fn consult(&self, context: &AdvisorContext) -> anyhow::Result<AdvisorVerdict>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub source: String,
    pub message: String,
    pub ts: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, source: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            source: source.to_string(),
            message: message.into(),
            ts: Utc::now(),
        }
    }
}

/// Outbound alert delivery. Implementations must never block the trading hot
/// path; failures are logged and swallowed by the mailbox task.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()>;
}
