//! Append-only audit entities: risk events and watchdog activity, plus the
//! per-issue-kind auto-fix policy rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::ports::AlertSeverity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub id: Uuid,
    pub cycle_id: Option<Uuid>,
    pub position_id: Option<Uuid>,
    pub event_type: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub details: serde_json::Value,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

impl RiskEvent {
    pub fn new(
        cycle_id: Option<Uuid>,
        position_id: Option<Uuid>,
        event_type: &str,
        severity: AlertSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cycle_id,
            position_id,
            event_type: event_type.to_string(),
            severity,
            message: message.into(),
            details: serde_json::Value::Null,
            resolved: false,
            created_at: Utc::now(),
        }
    }
}

/// Reconciliation issue kinds the watchdog classifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueKind {
    PhantomPosition,
    OrphanPosition,
    QtyMismatch,
    OrderStatusMismatch,
    StuckOrder,
    StaleCycle,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::PhantomPosition => "phantom_position",
            IssueKind::OrphanPosition => "orphan_position",
            IssueKind::QtyMismatch => "qty_mismatch",
            IssueKind::OrderStatusMismatch => "order_status_mismatch",
            IssueKind::StuckOrder => "stuck_order",
            IssueKind::StaleCycle => "stale_cycle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "phantom_position" => Some(IssueKind::PhantomPosition),
            "orphan_position" => Some(IssueKind::OrphanPosition),
            "qty_mismatch" => Some(IssueKind::QtyMismatch),
            "order_status_mismatch" => Some(IssueKind::OrderStatusMismatch),
            "stuck_order" => Some(IssueKind::StuckOrder),
            "stale_cycle" => Some(IssueKind::StaleCycle),
        _ => None,
        }
    }

    /// Issue kinds that may never be auto-fixed, regardless of the rules
    /// table: anything touching real-money positions or creating orders.
    pub fn auto_fix_forbidden(&self) -> bool {
        matches!(self, IssueKind::OrphanPosition)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchdogDecision {
    AutoFix,
    Escalate,
    Monitor,
    NoAction,
    Defer,
}

impl WatchdogDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchdogDecision::AutoFix => "auto_fix",
            WatchdogDecision::Escalate => "escalate",
            WatchdogDecision::Monitor => "monitor",
            WatchdogDecision::NoAction => "no_action",
            WatchdogDecision::Defer => "defer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto_fix" => Some(WatchdogDecision::AutoFix),
            "escalate" => Some(WatchdogDecision::Escalate),
            "monitor" => Some(WatchdogDecision::Monitor),
            "no_action" => Some(WatchdogDecision::NoAction),
            "defer" => Some(WatchdogDecision::Defer),
            _ => None,
        }
    }
}

/// One observe/decide/act tuple in the append-only watchdog log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogActivity {
    pub id: Uuid,
    pub logged_at: DateTime<Utc>,
    pub session: String,
    pub cycle_id: Option<Uuid>,
    pub observation_type: String,
    pub issues_summary: String,
    pub decision: WatchdogDecision,
    pub action_type: Option<String>,
    pub action_detail: Option<String>,
    pub action_result: Option<String>,
    pub issue_kind: Option<IssueKind>,
    pub issue_severity: Option<AlertSeverity>,
    pub observe_ms: i64,
    pub act_ms: i64,
    pub metadata: serde_json::Value,
}

/// Per-issue-kind policy row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogRule {
    pub issue_kind: IssueKind,
    pub auto_fix_enabled: bool,
    pub fix_template: Option<String>,
    pub max_fixes_per_hour: i64,
    pub cooldown_minutes: i64,
    pub escalation_priority: i64,
    pub active: bool,
}

impl WatchdogRule {
    /// Conservative defaults: only phantom positions and order status drift
    /// may be fixed automatically.
    pub fn defaults() -> Vec<WatchdogRule> {
        vec![
            WatchdogRule {
                issue_kind: IssueKind::PhantomPosition,
                auto_fix_enabled: true,
                fix_template: Some("close_local_position".to_string()),
                max_fixes_per_hour: 10,
                cooldown_minutes: 5,
                escalation_priority: 1,
                active: true,
            },
            WatchdogRule {
                issue_kind: IssueKind::OrphanPosition,
                auto_fix_enabled: false,
                fix_template: None,
                max_fixes_per_hour: 0,
                cooldown_minutes: 0,
                escalation_priority: 1,
                active: true,
            },
            WatchdogRule {
                issue_kind: IssueKind::QtyMismatch,
                auto_fix_enabled: true,
                fix_template: Some("update_local_qty".to_string()),
                max_fixes_per_hour: 10,
                cooldown_minutes: 5,
                escalation_priority: 2,
                active: true,
            },
            WatchdogRule {
                issue_kind: IssueKind::OrderStatusMismatch,
                auto_fix_enabled: true,
                fix_template: Some("sync_order_status".to_string()),
                max_fixes_per_hour: 10,
                cooldown_minutes: 1,
                escalation_priority: 3,
                active: true,
            },
            WatchdogRule {
                issue_kind: IssueKind::StuckOrder,
                auto_fix_enabled: false,
                fix_template: None,
                max_fixes_per_hour: 0,
                cooldown_minutes: 0,
                escalation_priority: 2,
                active: true,
            },
            WatchdogRule {
                issue_kind: IssueKind::StaleCycle,
                auto_fix_enabled: false,
                fix_template: None,
                max_fixes_per_hour: 0,
                cooldown_minutes: 0,
                escalation_priority: 3,
                active: true,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_kind_round_trip() {
        for kind in [
            IssueKind::PhantomPosition,
            IssueKind::OrphanPosition,
            IssueKind::QtyMismatch,
            IssueKind::OrderStatusMismatch,
            IssueKind::StuckOrder,
            IssueKind::StaleCycle,
        ] {
            assert_eq!(IssueKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn orphans_can_never_be_auto_fixed() {
        assert!(IssueKind::OrphanPosition.auto_fix_forbidden());
        let rule = WatchdogRule::defaults()
            .into_iter()
            .find(|r| r.issue_kind == IssueKind::OrphanPosition)
            .unwrap();
        assert!(!rule.auto_fix_enabled);
    }
}
