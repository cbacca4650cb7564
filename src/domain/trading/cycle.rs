use crate::domain::errors::EngineError;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Pipeline states of a trading cycle. `Stopped` is the emergency-stop state
/// and requires a manual restart; `Closed` and `Error` are the other terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleState {
    Created,
    Scanning,
    FilteringNews,
    FilteringPatterns,
    FilteringTechnical,
    RiskValidation,
    Executing,
    Monitoring,
    Closed,
    Stopped,
    Error,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Created => "created",
            CycleState::Scanning => "scanning",
            CycleState::FilteringNews => "filtering_news",
            CycleState::FilteringPatterns => "filtering_patterns",
            CycleState::FilteringTechnical => "filtering_technical",
            CycleState::RiskValidation => "risk_validation",
            CycleState::Executing => "executing",
            CycleState::Monitoring => "monitoring",
            CycleState::Closed => "closed",
            CycleState::Stopped => "stopped",
            CycleState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(CycleState::Created),
            "scanning" => Some(CycleState::Scanning),
            "filtering_news" => Some(CycleState::FilteringNews),
            "filtering_patterns" => Some(CycleState::FilteringPatterns),
            "filtering_technical" => Some(CycleState::FilteringTechnical),
            "risk_validation" => Some(CycleState::RiskValidation),
            "executing" => Some(CycleState::Executing),
            "monitoring" => Some(CycleState::Monitoring),
            "closed" => Some(CycleState::Closed),
            "stopped" => Some(CycleState::Stopped),
            "error" => Some(CycleState::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CycleState::Closed | CycleState::Stopped | CycleState::Error
        )
    }

    fn pipeline_rank(&self) -> Option<u8> {
        match self {
            CycleState::Created => Some(0),
            CycleState::Scanning => Some(1),
            CycleState::FilteringNews => Some(2),
            CycleState::FilteringPatterns => Some(3),
            CycleState::FilteringTechnical => Some(4),
            CycleState::RiskValidation => Some(5),
            CycleState::Executing => Some(6),
            CycleState::Monitoring => Some(7),
            _ => None,
        }
    }

    /// Forward-only pipeline advancement; any non-terminal state may fail
    /// into `Error` or be stopped by the risk monitor.
    pub fn can_transition_to(&self, next: CycleState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            CycleState::Error | CycleState::Stopped => true,
            CycleState::Closed => matches!(self, CycleState::Monitoring),
            _ => match (self.pipeline_rank(), next.pipeline_rank()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleMode {
    Autonomous,
    Supervised,
    Paper,
}

impl CycleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleMode::Autonomous => "autonomous",
            CycleMode::Supervised => "supervised",
            CycleMode::Paper => "paper",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "autonomous" => Some(CycleMode::Autonomous),
            "supervised" => Some(CycleMode::Supervised),
            "paper" => Some(CycleMode::Paper),
            _ => None,
        }
    }
}

/// One trading day of pipeline work. Unique per date; only one open cycle
/// per date is allowed (enforced by the store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingCycle {
    pub id: Uuid,
    pub date: NaiveDate,
    pub state: CycleState,
    pub mode: CycleMode,
    pub configuration: serde_json::Value,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub trades_executed: i64,
    pub trades_won: i64,
    pub trades_lost: i64,
    pub daily_pnl: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TradingCycle {
    pub fn new(date: NaiveDate, mode: CycleMode, configuration: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            date,
            state: CycleState::Created,
            mode,
            configuration,
            started_at: None,
            stopped_at: None,
            trades_executed: 0,
            trades_won: 0,
            trades_lost: 0,
            daily_pnl: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn advance(&mut self, next: CycleState, now: DateTime<Utc>) -> Result<(), EngineError> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidPositionTransition {
                from: self.state.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        if self.started_at.is_none() && next != CycleState::Error {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.stopped_at = Some(now);
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_is_forward_only() {
        use CycleState::*;
        assert!(Created.can_transition_to(Scanning));
        assert!(Scanning.can_transition_to(FilteringNews));
        // Skipping a disabled stage is allowed.
        assert!(Scanning.can_transition_to(FilteringTechnical));
        assert!(Executing.can_transition_to(Monitoring));
        assert!(Monitoring.can_transition_to(Closed));

        assert!(!FilteringNews.can_transition_to(Scanning));
        assert!(!Executing.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Scanning));
    }

    #[test]
    fn any_live_state_can_stop_or_error() {
        use CycleState::*;
        for s in [Created, Scanning, RiskValidation, Executing, Monitoring] {
            assert!(s.can_transition_to(Stopped));
            assert!(s.can_transition_to(Error));
        }
        assert!(!Stopped.can_transition_to(Monitoring));
        assert!(!Error.can_transition_to(Stopped));
    }

    #[test]
    fn advance_stamps_timestamps() {
        let mut cycle = TradingCycle::new(
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            CycleMode::Paper,
            serde_json::Value::Null,
        );
        let now = Utc::now();
        cycle.advance(CycleState::Scanning, now).unwrap();
        assert_eq!(cycle.started_at, Some(now));
        cycle.advance(CycleState::Stopped, now).unwrap();
        assert_eq!(cycle.stopped_at, Some(now));
        assert!(cycle.advance(CycleState::Monitoring, now).is_err());
    }
}
