use rust_decimal::Decimal;
use thiserror::Error;

/// Failure classes of the broker contract. Every adapter maps its wire-level
/// errors into one of these before they cross the port boundary.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Broker authentication failed")]
    AuthFailed,

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Invalid price for {symbol}: {price}")]
    InvalidPrice { symbol: String, price: Decimal },

    #[error("Insufficient buying power: need ${need}, available ${available}")]
    InsufficientBuyingPower { need: Decimal, available: Decimal },

    #[error("Order not found at broker: {broker_order_id}")]
    OrderNotFound { broker_order_id: String },

    #[error("Transient broker error: {reason}")]
    Transient { reason: String },
}

impl BrokerError {
    /// Whether an idempotent operation may be retried after this error.
    /// Order submission is never retried regardless of this flag.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Transient { .. } | BrokerError::RateLimited { .. }
        )
    }
}

/// Pre-trade validation failures. Each variant carries a stable reason code
/// that is persisted on the risk event and returned to the orchestrator.
#[derive(Debug, Error)]
pub enum RiskViolation {
    #[error("Cycle is stopped; no further trades accepted")]
    CycleStopped,

    #[error("Max positions reached: {current} >= {max}")]
    MaxPositions { current: usize, max: usize },

    #[error("Risk budget exceeded: requested ${requested}, remaining ${remaining}")]
    RiskBudgetExceeded {
        requested: Decimal,
        remaining: Decimal,
    },

    #[error("Open position already exists for {symbol}")]
    DuplicatePosition { symbol: String },

    #[error("Sector exposure limit for {sector}: {current_pct:.2}% > {max_pct:.2}%")]
    SectorExposureLimit {
        sector: String,
        current_pct: f64,
        max_pct: f64,
    },

    #[error("Projected daily loss ${projected} exceeds limit ${max}")]
    DailyLossProjection { projected: Decimal, max: Decimal },
}

impl RiskViolation {
    pub fn reason_code(&self) -> &'static str {
        match self {
            RiskViolation::CycleStopped => "cycle_stopped",
            RiskViolation::MaxPositions { .. } => "max_positions",
            RiskViolation::RiskBudgetExceeded { .. } => "risk_budget_exceeded",
            RiskViolation::DuplicatePosition { .. } => "duplicate_position",
            RiskViolation::SectorExposureLimit { .. } => "sector_exposure",
            RiskViolation::DailyLossProjection { .. } => "daily_loss_projection",
        }
    }
}

/// Lifecycle violations inside the order/position engine. These indicate a
/// bug or corrupted state, not a routine business rejection.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid order transition: {from} -> {to}")]
    InvalidOrderTransition { from: String, to: String },

    #[error("Invalid position transition: {from} -> {to}")]
    InvalidPositionTransition { from: String, to: String },

    #[error("Side mapping violation: {purpose} order for {position_side} position cannot be {side}")]
    SideMappingViolation {
        position_side: String,
        purpose: String,
        side: String,
    },

    #[error("Fill overflow: filled {filled} > ordered {qty}")]
    OverFill { filled: Decimal, qty: Decimal },

    #[error("Broker order id already set on order {order_id}")]
    BrokerIdAlreadySet { order_id: String },

    #[error("Position not found: {id}")]
    PositionNotFound { id: String },

    #[error("Order not found: {id}")]
    OrderNotFound { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn retryable_classes() {
        assert!(
            BrokerError::Transient {
                reason: "503".into()
            }
            .is_retryable()
        );
        assert!(
            BrokerError::RateLimited {
                retry_after_secs: 30
            }
            .is_retryable()
        );
        assert!(!BrokerError::AuthFailed.is_retryable());
        assert!(
            !BrokerError::InvalidPrice {
                symbol: "AAPL".into(),
                price: dec!(27.07)
            }
            .is_retryable()
        );
    }

    #[test]
    fn violation_reason_codes_are_stable() {
        assert_eq!(RiskViolation::CycleStopped.reason_code(), "cycle_stopped");
        assert_eq!(
            RiskViolation::DuplicatePosition {
                symbol: "AAPL".into()
            }
            .reason_code(),
            "duplicate_position"
        );
    }

    #[test]
    fn violation_messages_contain_amounts() {
        let v = RiskViolation::RiskBudgetExceeded {
            requested: dec!(500),
            remaining: dec!(120),
        };
        let msg = v.to_string();
        assert!(msg.contains("500"));
        assert!(msg.contains("120"));
    }
}
