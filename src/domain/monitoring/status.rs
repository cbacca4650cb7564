use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::monitoring::signals::Recommendation;

/// Run state of the monitor for one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorRunState {
    Pending,
    Starting,
    Running,
    Sleeping,
    Stopped,
    Error,
}

impl MonitorRunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorRunState::Pending => "pending",
            MonitorRunState::Starting => "starting",
            MonitorRunState::Running => "running",
            MonitorRunState::Sleeping => "sleeping",
            MonitorRunState::Stopped => "stopped",
            MonitorRunState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MonitorRunState::Pending),
            "starting" => Some(MonitorRunState::Starting),
            "running" => Some(MonitorRunState::Running),
            "sleeping" => Some(MonitorRunState::Sleeping),
            "stopped" => Some(MonitorRunState::Stopped),
            "error" => Some(MonitorRunState::Error),
            _ => None,
        }
    }
}

/// Snapshot row the monitor upserts each tick for one open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub position_id: Uuid,
    pub symbol: String,
    pub state: MonitorRunState,
    pub last_price: Option<Decimal>,
    pub high_watermark: Option<Decimal>,
    pub pnl_pct: Option<f64>,
    pub rsi: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub vwap_position: Option<String>,
    pub hold_signals: Vec<String>,
    pub exit_signals: Vec<String>,
    pub recommendation: Recommendation,
    pub advisor_calls: i64,
    pub estimated_cost: f64,
    pub last_checkin: DateTime<Utc>,
}

impl MonitorStatus {
    pub fn pending(position_id: Uuid, symbol: &str) -> Self {
        Self {
            position_id,
            symbol: symbol.to_string(),
            state: MonitorRunState::Pending,
            last_price: None,
            high_watermark: None,
            pnl_pct: None,
            rsi: None,
            macd_histogram: None,
            vwap_position: None,
            hold_signals: Vec::new(),
            exit_signals: Vec::new(),
            recommendation: Recommendation::Hold,
            advisor_calls: 0,
            estimated_cost: 0.0,
            last_checkin: Utc::now(),
        }
    }
}
