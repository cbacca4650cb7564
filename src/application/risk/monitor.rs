//! Continuous P&L monitor. One task per active cycle; on a daily-loss breach
//! it runs the emergency-stop protocol: atomic cycle flip, liquidate
//! everything, CRITICAL alert, manual restart required.

use crate::application::alerts::AlertMailbox;
use crate::application::engine::{CloseAllReport, OrderEngine};
use crate::config::SettingsStore;
use crate::domain::audit::RiskEvent;
use crate::domain::ports::AlertSeverity;
use crate::infrastructure::observability::Metrics;
use crate::infrastructure::persistence::repositories::{
    SqliteCycleRepository, SqlitePositionRepository, SqliteRiskEventRepository,
};
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{Duration, interval};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub enum RiskTickOutcome {
    Healthy { pnl: Decimal },
    Warned { pnl: Decimal },
    Stopped { pnl: Decimal, report: CloseAllReport },
    AlreadyStopped,
}

pub struct RiskMonitor {
    engine: Arc<OrderEngine>,
    positions: Arc<SqlitePositionRepository>,
    cycles: Arc<SqliteCycleRepository>,
    risk_events: Arc<SqliteRiskEventRepository>,
    settings: Arc<SettingsStore>,
    alerts: Arc<AlertMailbox>,
    metrics: Metrics,
    /// Warning latch: one WARNING per threshold crossing, re-armed when P&L
    /// recovers above the threshold.
    warned: AtomicBool,
}

impl RiskMonitor {
    pub fn new(
        engine: Arc<OrderEngine>,
        settings: Arc<SettingsStore>,
        alerts: Arc<AlertMailbox>,
        metrics: Metrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            positions: engine.positions_repo(),
            cycles: Arc::new(SqliteCycleRepository::new(
                engine.orders_repo().pool().clone(),
            )),
            risk_events: Arc::new(SqliteRiskEventRepository::new(
                engine.orders_repo().pool().clone(),
            )),
            engine,
            settings,
            alerts,
            metrics,
            warned: AtomicBool::new(false),
        })
    }

    pub async fn run(self: Arc<Self>, cycle_id: Uuid) {
        let interval_secs = self.settings.snapshot().risk.check_interval_seconds;
        info!("RiskMonitor started for cycle {cycle_id} (interval: {interval_secs}s)");
        let mut tick = interval(Duration::from_secs(interval_secs.max(1)));
        tick.tick().await;

        loop {
            tick.tick().await;
            match self.tick_once(cycle_id).await {
                Ok(RiskTickOutcome::Stopped { .. }) | Ok(RiskTickOutcome::AlreadyStopped) => {
                    info!("RiskMonitor: cycle {cycle_id} stopped; monitor exiting");
                    return;
                }
                Ok(_) => {}
                Err(e) => error!("RiskMonitor: tick failed: {e:#}"),
            }
        }
    }

    /// One evaluation pass; separated from the loop so tests can drive it.
    pub async fn tick_once(&self, cycle_id: Uuid) -> Result<RiskTickOutcome> {
        let cycle = self.cycles.get(cycle_id).await?;
        if cycle.state.is_terminal() {
            return Ok(RiskTickOutcome::AlreadyStopped);
        }

        let settings = self.settings.snapshot();
        let (realized, unrealized) = self.positions.aggregate_pnl(cycle_id).await?;
        let pnl = realized + unrealized;
        self.metrics.daily_pnl_usd.set(pnl.to_f64().unwrap_or(0.0));

        let max_loss = settings.risk.max_daily_loss;
        if pnl <= -max_loss {
            return self.emergency_stop(cycle_id, pnl).await;
        }

        let warn_level = max_loss
            * Decimal::try_from(settings.risk.warning_threshold_pct).unwrap_or(Decimal::ONE);
        if pnl <= -warn_level {
            // Rate-limited: one warning per crossing, not one per tick.
            if !self.warned.swap(true, Ordering::SeqCst) {
                warn!("RiskMonitor: P&L {pnl} crossed warning level -{warn_level}");
                self.alerts.post_warning(
                    "RiskMonitor",
                    format!("Daily P&L {pnl} has crossed the warning level -{warn_level}"),
                );
            }
            return Ok(RiskTickOutcome::Warned { pnl });
        }

        self.warned.store(false, Ordering::SeqCst);
        Ok(RiskTickOutcome::Healthy { pnl })
    }

    /// Emergency stop. The conditional state flip makes this single-entry;
    /// the loser of the race (or a repeat invocation) coalesces into a no-op.
    async fn emergency_stop(&self, cycle_id: Uuid, pnl: Decimal) -> Result<RiskTickOutcome> {
        if !self.cycles.try_stop(cycle_id, Utc::now()).await? {
            return Ok(RiskTickOutcome::AlreadyStopped);
        }

        error!("RiskMonitor: EMERGENCY STOP for cycle {cycle_id} at P&L {pnl}");
        self.metrics
            .emergency_stops_total
            .with_label_values(&["daily_loss_limit"])
            .inc();

        let report = self.engine.close_all(cycle_id, "daily_loss_limit").await?;

        let event = RiskEvent::new(
            Some(cycle_id),
            None,
            "emergency_stop",
            AlertSeverity::Critical,
            format!(
                "Daily loss limit breached at {pnl}; close_all attempted {} submitted {} failed {}",
                report.attempted,
                report.submitted,
                report.failures.len()
            ),
        );
        self.risk_events.insert(&event).await?;

        self.alerts.post_critical(
            "RiskMonitor",
            format!(
                "EMERGENCY STOP: P&L {pnl}. Closed {}/{} positions ({} failures: {:?}). \
                 Cycle stopped; manual restart required.",
                report.submitted,
                report.attempted,
                report.failures.len(),
                report.failures
            ),
        );

        Ok(RiskTickOutcome::Stopped { pnl, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::engine::TradeCandidate;
    use crate::config::Settings;
    use crate::domain::trading::cycle::{CycleMode, CycleState, TradingCycle};
    use crate::domain::trading::types::PositionSide;
    use crate::infrastructure::mock::MockBroker;
    use crate::infrastructure::persistence::database::Database;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    async fn setup() -> (Arc<OrderEngine>, Arc<MockBroker>, Arc<RiskMonitor>, Uuid) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let broker = Arc::new(MockBroker::new());
        let alerts = AlertMailbox::new(64);
        let metrics = Metrics::new().unwrap();
        let engine = Arc::new(OrderEngine::new(
            broker.clone(),
            db.clone(),
            alerts.clone(),
            metrics.clone(),
            Duration::from_secs(10),
        ));
        let settings = SettingsStore::new(Settings::default(), None);
        let monitor = RiskMonitor::new(engine.clone(), settings, alerts, metrics);

        let cycles = SqliteCycleRepository::new(db.pool.clone());
        let cycle = TradingCycle::new(
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            CycleMode::Paper,
            serde_json::Value::Null,
        );
        cycles.create(&cycle).await.unwrap();
        (engine, broker, monitor, cycle.id)
    }

    async fn open_losing_position(
        engine: &OrderEngine,
        broker: &MockBroker,
        cycle_id: Uuid,
        symbol: &str,
        unrealized: Decimal,
    ) {
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
        let opened = engine.open_position(cycle_id, &candidate).await.unwrap();
        let entry = engine.orders_repo().get(opened.entry_order_id).await.unwrap();
        let broker_id = entry.broker_order_id.unwrap();
        broker.fill_order(&broker_id, dec!(150), Utc::now());
        engine
            .on_fill(&broker_id, dec!(10), dec!(150), Utc::now())
            .await
            .unwrap();

        // Mark the position down far enough to produce the wanted P&L.
        let adverse = dec!(150) + unrealized / dec!(10);
        let positions = engine.positions_repo();
        let p = positions.get(opened.position_id).await.unwrap();
        let stamp = p.updated_at;
        let mut p = p.clone();
        p.mark_price(adverse, Utc::now());
        positions.update(&p, stamp).await.unwrap();
    }

    #[tokio::test]
    async fn healthy_cycle_passes() {
        let (_engine, _broker, monitor, cycle_id) = setup().await;
        let outcome = monitor.tick_once(cycle_id).await.unwrap();
        assert!(matches!(outcome, RiskTickOutcome::Healthy { .. }));
    }

    #[tokio::test]
    async fn warning_fires_once_per_crossing() {
        let (engine, broker, monitor, cycle_id) = setup().await;
        // -1600 on a 2000 limit: past the 75% warning level.
        open_losing_position(&engine, &broker, cycle_id, "AAPL", dec!(-1600)).await;

        let first = monitor.tick_once(cycle_id).await.unwrap();
        assert!(matches!(first, RiskTickOutcome::Warned { .. }));
        assert!(monitor.warned.load(Ordering::SeqCst));

        // Second tick at the same level: still warned, latch stays set.
        let second = monitor.tick_once(cycle_id).await.unwrap();
        assert!(matches!(second, RiskTickOutcome::Warned { .. }));
    }

    #[tokio::test]
    async fn daily_loss_breach_triggers_emergency_stop() {
        let (engine, broker, monitor, cycle_id) = setup().await;
        // Realized -1800 and unrealized -250: total -2050 on a 2000 limit.
        open_losing_position(&engine, &broker, cycle_id, "AAPL", dec!(-250)).await;
        open_losing_position(&engine, &broker, cycle_id, "MSFT", dec!(0)).await;
        let positions = engine.positions_repo();
        let all = positions.list_open(Some(cycle_id)).await.unwrap();
        let msft = all.iter().find(|p| p.symbol == "MSFT").unwrap();
        let stamp = msft.updated_at;
        let mut msft = msft.clone();
        msft.realized_pnl = dec!(-1800);
        positions.update(&msft, stamp).await.unwrap();

        let outcome = monitor.tick_once(cycle_id).await.unwrap();
        let RiskTickOutcome::Stopped { pnl, report } = outcome else {
            panic!("expected emergency stop, got {outcome:?}");
        };
        assert_eq!(pnl, dec!(-2050));
        assert_eq!(report.attempted, 2);
        assert_eq!(report.submitted, 2);

        // The flip is single-entry: a second tick coalesces.
        let again = monitor.tick_once(cycle_id).await.unwrap();
        assert!(matches!(again, RiskTickOutcome::AlreadyStopped));

        let cycles = SqliteCycleRepository::new(engine.orders_repo().pool().clone());
        let cycle = cycles.get(cycle_id).await.unwrap();
        assert_eq!(cycle.state, CycleState::Stopped);
    }
}
