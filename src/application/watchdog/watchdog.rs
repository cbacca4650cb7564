//! Reconciliation watchdog: a 5-minute audit of local state against broker
//! truth. Every observe/decide/act tuple lands in the append-only activity
//! log; fixes only happen when the rules engine lets them through.

use crate::application::alerts::AlertMailbox;
use crate::application::engine::{OrderEngine, PositionIssueKind};
use crate::application::watchdog::rules::{FixGate, RulesEngine};
use crate::config::SettingsStore;
use crate::domain::audit::{IssueKind, WatchdogActivity, WatchdogDecision};
use crate::domain::clock::Clock;
use crate::domain::ports::AlertSeverity;
use crate::domain::trading::types::OrderStatus;
use crate::infrastructure::observability::Metrics;
use crate::infrastructure::persistence::repositories::{
    SqliteCycleRepository, SqliteWatchdogRepository,
};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::time::{Duration, interval};
use tracing::{error, info, warn};
use uuid::Uuid;

const STUCK_ORDER_MINUTES: i64 = 5;
const ORDER_SYNC_WINDOW_HOURS: i64 = 24;
const STALE_CYCLE_MINUTES: i64 = 30;
const UNKNOWN_ORDER_GRACE_MINUTES: i64 = 60;

#[derive(Debug, Default)]
pub struct WatchdogReport {
    pub issues_found: usize,
    pub fixes_applied: usize,
    pub escalations: usize,
    pub orders_synced: usize,
}

pub struct Watchdog {
    engine: Arc<OrderEngine>,
    repo: Arc<SqliteWatchdogRepository>,
    cycles: Arc<SqliteCycleRepository>,
    rules: RulesEngine,
    settings: Arc<SettingsStore>,
    clock: Arc<dyn Clock>,
    alerts: Arc<AlertMailbox>,
    metrics: Metrics,
    session: String,
    tick_running: AtomicBool,
}

impl Watchdog {
    pub fn new(
        engine: Arc<OrderEngine>,
        settings: Arc<SettingsStore>,
        clock: Arc<dyn Clock>,
        alerts: Arc<AlertMailbox>,
        metrics: Metrics,
    ) -> Arc<Self> {
        let pool = engine.orders_repo().pool().clone();
        let repo = Arc::new(SqliteWatchdogRepository::new(pool.clone()));
        Arc::new(Self {
            rules: RulesEngine::new(repo.clone()),
            cycles: Arc::new(SqliteCycleRepository::new(pool)),
            engine,
            repo,
            settings,
            clock,
            alerts,
            metrics,
            session: Uuid::new_v4().to_string()[..8].to_string(),
            tick_running: AtomicBool::new(false),
        })
    }

    pub async fn run(self: Arc<Self>, cycle_id: Uuid) {
        info!("Watchdog started (session {})", self.session);
        if let Err(e) = self.repo.seed_default_rules().await {
            error!("Watchdog: failed to seed rules: {e:#}");
        }

        let mut tick = interval(Duration::from_secs(300));
        tick.tick().await;
        loop {
            tick.tick().await;
            if !self.clock.in_market_hours() {
                continue;
            }
            if self.tick_running.swap(true, Ordering::SeqCst) {
                warn!("Watchdog: previous run still active, skipping");
                continue;
            }
            if let Err(e) = self.tick_once(cycle_id).await {
                error!("Watchdog: run failed: {e:#}");
            }
            self.tick_running.store(false, Ordering::SeqCst);
        }
    }

    /// One audit pass: stuck orders, position reconciliation, order status
    /// sync, stale cycles.
    pub async fn tick_once(&self, cycle_id: Uuid) -> Result<WatchdogReport> {
        let observe_start = Instant::now();
        let mut report = WatchdogReport::default();
        let now = Utc::now();

        // 1. Stuck orders: non-terminal past the cutoff. Detection only;
        //    convergence happens in the sync step below.
        let stuck = self
            .engine
            .orders_repo()
            .stuck_orders(now - ChronoDuration::minutes(STUCK_ORDER_MINUTES))
            .await?;
        for order in &stuck {
            report.issues_found += 1;
            report.escalations += 1;
            self.log_issue(
                cycle_id,
                "stuck_orders",
                IssueKind::StuckOrder,
                AlertSeverity::Warning,
                WatchdogDecision::Escalate,
                &format!("{} {} since {:?}", order.symbol, order.status, order.submitted_at),
                None,
                observe_start.elapsed().as_millis() as i64,
                0,
            )
            .await;
            self.alerts.post_warning(
                "Watchdog",
                format!(
                    "Stuck order: {} {} ({})",
                    order.symbol,
                    order.status,
                    order.id
                ),
            );
        }

        // 2. Position reconciliation against broker truth.
        let issues = self.engine.detect_position_issues(Some(cycle_id)).await?;
        for issue in issues {
            report.issues_found += 1;
            let observe_ms = observe_start.elapsed().as_millis() as i64;
            match &issue.kind {
                PositionIssueKind::Phantom => {
                    let kind = IssueKind::PhantomPosition;
                    if self.rules.gate(kind).await? == FixGate::Allowed {
                        let act_start = Instant::now();
                        let result = match issue.position_id {
                            Some(id) => self.engine.fix_phantom(id).await,
                            None => Ok(()),
                        };
                        let outcome = if result.is_ok() { "success" } else { "failed" };
                        if result.is_ok() {
                            report.fixes_applied += 1;
                        }
                        self.log_issue(
                            cycle_id,
                            "position_reconciliation",
                            kind,
                            issue.severity,
                            WatchdogDecision::AutoFix,
                            &format!("phantom {}", issue.symbol),
                            Some(("close_local_position", outcome)),
                            observe_ms,
                            act_start.elapsed().as_millis() as i64,
                        )
                        .await;
                    } else {
                        report.escalations += 1;
                        self.escalate(cycle_id, kind, &issue.symbol, issue.severity, observe_ms)
                            .await;
                    }
                }
                PositionIssueKind::Orphan => {
                    // Real money with no local row: human judgment only.
                    report.escalations += 1;
                    self.escalate(
                        cycle_id,
                        IssueKind::OrphanPosition,
                        &issue.symbol,
                        AlertSeverity::Critical,
                        observe_ms,
                    )
                    .await;
                }
                PositionIssueKind::QtyMismatch {
                    broker_qty,
                    drift_pct,
                    ..
                } => {
                    let kind = IssueKind::QtyMismatch;
                    let small_drift = *drift_pct < 10.0;
                    if small_drift && self.rules.gate(kind).await? == FixGate::Allowed {
                        let act_start = Instant::now();
                        let result = match issue.position_id {
                            Some(id) => self.engine.fix_qty_mismatch(id, *broker_qty).await,
                            None => Ok(()),
                        };
                        let outcome = if result.is_ok() { "success" } else { "failed" };
                        if result.is_ok() {
                            report.fixes_applied += 1;
                        }
                        self.log_issue(
                            cycle_id,
                            "position_reconciliation",
                            kind,
                            issue.severity,
                            WatchdogDecision::AutoFix,
                            &format!("qty drift {:.1}% on {}", drift_pct, issue.symbol),
                            Some(("update_local_qty", outcome)),
                            observe_ms,
                            act_start.elapsed().as_millis() as i64,
                        )
                        .await;
                    } else {
                        report.escalations += 1;
                        self.escalate(cycle_id, kind, &issue.symbol, issue.severity, observe_ms)
                            .await;
                    }
                }
            }
        }

        // 3. Order status sync: non-terminal orders from the last day. The
        //    broker is authoritative; unknown submits resolve here too.
        let sync_candidates = self
            .engine
            .orders_repo()
            .list_non_terminal_since(now - ChronoDuration::hours(ORDER_SYNC_WINDOW_HOURS))
            .await?;
        for order in sync_candidates {
            let changed = if order.status == OrderStatus::SubmittedUnknown {
                self.engine
                    .resolve_unknown_order(
                        order.id,
                        ChronoDuration::minutes(UNKNOWN_ORDER_GRACE_MINUTES),
                    )
                    .await
                    .map(|_| true)
            } else {
                self.engine.sync_order_with_broker(order.id).await
            };
            match changed {
                Ok(true) => {
                    report.orders_synced += 1;
                    self.metrics
                        .watchdog_issues_total
                        .with_label_values(&["order_status_mismatch", "auto_fix"])
                        .inc();
                }
                Ok(false) => {}
                Err(e) => warn!("Watchdog: order sync failed for {}: {e:#}", order.id),
            }
        }

        // 4. Stale cycles.
        let stale = self
            .cycles
            .stale_cycles(now - ChronoDuration::minutes(STALE_CYCLE_MINUTES))
            .await?;
        for cycle in &stale {
            report.issues_found += 1;
            report.escalations += 1;
            self.escalate(
                cycle.id,
                IssueKind::StaleCycle,
                &format!("cycle {} quiet in {}", cycle.id, cycle.state.as_str()),
                AlertSeverity::Warning,
                observe_start.elapsed().as_millis() as i64,
            )
            .await;
        }

        if report.issues_found == 0 {
            self.log_issue(
                cycle_id,
                "full_audit",
                IssueKind::OrderStatusMismatch,
                AlertSeverity::Info,
                WatchdogDecision::NoAction,
                &format!("clean audit, {} orders synced", report.orders_synced),
                None,
                observe_start.elapsed().as_millis() as i64,
                0,
            )
            .await;
        }

        info!(
            "Watchdog: audit done - {} issues, {} fixed, {} escalated, {} orders synced",
            report.issues_found, report.fixes_applied, report.escalations, report.orders_synced
        );
        Ok(report)
    }

    async fn escalate(
        &self,
        cycle_id: Uuid,
        kind: IssueKind,
        detail: &str,
        severity: AlertSeverity,
        observe_ms: i64,
    ) {
        let message = format!("{}: {detail}", kind.as_str());
        match severity {
            AlertSeverity::Critical => self.alerts.post_critical("Watchdog", message),
            _ => self.alerts.post_warning("Watchdog", message),
        }
        self.log_issue(
            cycle_id,
            "position_reconciliation",
            kind,
            severity,
            WatchdogDecision::Escalate,
            detail,
            None,
            observe_ms,
            0,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_issue(
        &self,
        cycle_id: Uuid,
        observation_type: &str,
        kind: IssueKind,
        severity: AlertSeverity,
        decision: WatchdogDecision,
        summary: &str,
        action: Option<(&str, &str)>,
        observe_ms: i64,
        act_ms: i64,
    ) {
        self.metrics
            .watchdog_issues_total
            .with_label_values(&[kind.as_str(), decision.as_str()])
            .inc();

        let activity = WatchdogActivity {
            id: Uuid::new_v4(),
            logged_at: Utc::now(),
            session: self.session.clone(),
            cycle_id: Some(cycle_id),
            observation_type: observation_type.to_string(),
            issues_summary: summary.to_string(),
            decision,
            action_type: action.map(|(a, _)| a.to_string()),
            action_detail: action.map(|_| summary.to_string()),
            action_result: action.map(|(_, r)| r.to_string()),
            issue_kind: Some(kind),
            issue_severity: Some(severity),
            observe_ms,
            act_ms,
            metadata: serde_json::Value::Null,
        };
        if let Err(e) = self.repo.log_activity(&activity).await {
            error!("Watchdog: failed to log activity: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::engine::TradeCandidate;
    use crate::config::Settings;
    use crate::domain::clock::{FixedClock, SessionSpec};
    use crate::domain::trading::cycle::{CycleMode, TradingCycle};
    use crate::domain::trading::types::{PositionSide, PositionStatus};
    use crate::infrastructure::mock::{InjectedFailure, MockBroker};
    use crate::infrastructure::persistence::database::Database;
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal_macros::dec;

    struct Fixture {
        watchdog: Arc<Watchdog>,
        engine: Arc<OrderEngine>,
        broker: Arc<MockBroker>,
        repo: Arc<SqliteWatchdogRepository>,
        cycle_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let broker = Arc::new(MockBroker::new());
        let clock = Arc::new(FixedClock::at(
            Utc.with_ymd_and_hms(2025, 3, 10, 15, 0, 0).unwrap(),
            SessionSpec::us_equities(),
        ));
        let alerts = AlertMailbox::new(64);
        let metrics = Metrics::new().unwrap();
        let settings = crate::config::SettingsStore::new(Settings::default(), None);
        let engine = Arc::new(OrderEngine::new(
            broker.clone(),
            db.clone(),
            alerts.clone(),
            metrics.clone(),
            std::time::Duration::from_secs(10),
        ));
        let watchdog = Watchdog::new(engine.clone(), settings, clock, alerts, metrics);
        let repo = Arc::new(SqliteWatchdogRepository::new(db.pool.clone()));
        repo.seed_default_rules().await.unwrap();

        let cycles = SqliteCycleRepository::new(db.pool.clone());
        let cycle = TradingCycle::new(
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            CycleMode::Paper,
            serde_json::Value::Null,
        );
        cycles.create(&cycle).await.unwrap();

        Fixture {
            watchdog,
            engine,
            broker,
            repo,
            cycle_id: cycle.id,
        }
    }

    async fn open_filled(fx: &Fixture, symbol: &str) -> Uuid {
        let candidate = TradeCandidate {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            qty: dec!(10),
            entry_price: dec!(150),
            stop_loss: dec!(145),
            take_profit: dec!(165),
            risk_amount: dec!(50),
            pattern: None,
            catalyst: None,
            entry_volume: None,
        };
        let opened = fx.engine.open_position(fx.cycle_id, &candidate).await.unwrap();
        let entry = fx.engine.orders_repo().get(opened.entry_order_id).await.unwrap();
        let broker_id = entry.broker_order_id.unwrap();
        fx.broker.fill_order(&broker_id, dec!(150), Utc::now());
        fx.engine
            .on_fill(&broker_id, dec!(10), dec!(150), Utc::now())
            .await
            .unwrap();
        opened.position_id
    }

    #[tokio::test]
    async fn phantom_position_is_auto_fixed_and_logged() {
        let fx = fixture().await;
        let position_id = open_filled(&fx, "SYMX").await;
        fx.broker.remove_broker_position("SYMX");

        let report = fx.watchdog.tick_once(fx.cycle_id).await.unwrap();
        assert_eq!(report.issues_found, 1);
        assert_eq!(report.fixes_applied, 1);

        let position = fx.engine.positions_repo().get(position_id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Closed);

        let activity = fx.repo.recent_activity(10).await.unwrap();
        let fix = activity
            .iter()
            .find(|a| a.decision == WatchdogDecision::AutoFix)
            .unwrap();
        assert_eq!(fix.issue_kind, Some(IssueKind::PhantomPosition));
        assert_eq!(fix.action_result.as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn orphan_is_escalated_never_fixed() {
        let fx = fixture().await;
        fx.broker.set_broker_position(crate::domain::ports::BrokerPosition {
            symbol: "GHST".to_string(),
            qty: dec!(25),
            avg_entry: dec!(10),
            market_value: dec!(250),
            unrealized_pl: dec!(0),
        });

        let report = fx.watchdog.tick_once(fx.cycle_id).await.unwrap();
        assert_eq!(report.issues_found, 1);
        assert_eq!(report.fixes_applied, 0);
        assert_eq!(report.escalations, 1);

        let activity = fx.repo.recent_activity(10).await.unwrap();
        assert!(activity.iter().any(|a| {
            a.issue_kind == Some(IssueKind::OrphanPosition)
                && a.decision == WatchdogDecision::Escalate
        }));
    }

    #[tokio::test]
    async fn large_qty_drift_escalates_small_drift_fixes() {
        let fx = fixture().await;
        let position_id = open_filled(&fx, "AAPL").await;

        fx.broker.set_broker_position(crate::domain::ports::BrokerPosition {
            symbol: "AAPL".to_string(),
            qty: dec!(5),
            avg_entry: dec!(150),
            market_value: dec!(750),
            unrealized_pl: dec!(0),
        });
        let report = fx.watchdog.tick_once(fx.cycle_id).await.unwrap();
        assert_eq!(report.fixes_applied, 0);
        assert_eq!(report.escalations, 1);
        // Local row untouched.
        let position = fx.engine.positions_repo().get(position_id).await.unwrap();
        assert_eq!(position.qty, dec!(10));

        fx.broker.set_broker_position(crate::domain::ports::BrokerPosition {
            symbol: "AAPL".to_string(),
            qty: dec!(9.5),
            avg_entry: dec!(150),
            market_value: dec!(1425),
            unrealized_pl: dec!(0),
        });
        let report = fx.watchdog.tick_once(fx.cycle_id).await.unwrap();
        assert_eq!(report.fixes_applied, 1);
        let position = fx.engine.positions_repo().get(position_id).await.unwrap();
        assert_eq!(position.qty, dec!(9.5));
    }

    #[tokio::test]
    async fn missed_fill_converges_via_order_sync() {
        let fx = fixture().await;
        let candidate = TradeCandidate {
            symbol: "MSFT".to_string(),
            side: PositionSide::Long,
            qty: dec!(10),
            entry_price: dec!(300),
            stop_loss: dec!(290),
            take_profit: dec!(330),
            risk_amount: dec!(100),
            pattern: None,
            catalyst: None,
            entry_volume: None,
        };
        let opened = fx.engine.open_position(fx.cycle_id, &candidate).await.unwrap();
        let entry = fx.engine.orders_repo().get(opened.entry_order_id).await.unwrap();
        // The fill happens at the broker but no callback ever arrives.
        fx.broker
            .fill_order(&entry.broker_order_id.unwrap(), dec!(299.90), Utc::now());

        let report = fx.watchdog.tick_once(fx.cycle_id).await.unwrap();
        assert!(report.orders_synced >= 1);

        let position = fx.engine.positions_repo().get(opened.position_id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.entry_price, Some(dec!(299.90)));
    }

    #[tokio::test]
    async fn ambiguous_submit_surfaces_as_stuck_and_resolves() {
        let fx = fixture().await;
        fx.broker.fail_next_submit(InjectedFailure::Unavailable);
        let candidate = TradeCandidate {
            symbol: "AAPL".to_string(),
            side: PositionSide::Long,
            qty: dec!(10),
            entry_price: dec!(150),
            stop_loss: dec!(145),
            take_profit: dec!(165),
            risk_amount: dec!(50),
            pattern: None,
            catalyst: None,
            entry_volume: None,
        };
        fx.engine.open_position(fx.cycle_id, &candidate).await.unwrap_err();

        // Within the grace window the unknown order is deferred, not forced.
        let report = fx.watchdog.tick_once(fx.cycle_id).await.unwrap();
        assert_eq!(report.fixes_applied, 0);
        let stuck = fx
            .engine
            .orders_repo()
            .stuck_orders(Utc::now() + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stuck[0].status, OrderStatus::SubmittedUnknown);
    }
}
