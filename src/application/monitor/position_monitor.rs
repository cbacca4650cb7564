//! Position monitor daemon: wakes on a schedule during market hours, walks
//! the open positions, evaluates hold/exit signals, and acts on the verdict.
//! STRONG exits close immediately; MODERATE-only verdicts may consult the
//! budgeted external advisor; everything else holds.

use crate::application::alerts::AlertMailbox;
use crate::application::engine::OrderEngine;
use crate::application::monitor::indicators::IndicatorService;
use crate::config::SettingsStore;
use crate::domain::clock::Clock;
use crate::domain::monitoring::signals::{
    PositionSnapshot, Recommendation, SignalStrength, evaluate,
};
use crate::domain::monitoring::status::{MonitorRunState, MonitorStatus};
use crate::domain::ports::{Advisor, AdvisorAction, AdvisorContext, BrokerAdapter};
use crate::domain::trading::types::Position;
use crate::infrastructure::observability::Metrics;
use crate::infrastructure::persistence::repositories::SqliteMonitorStatusRepository;
use anyhow::Result;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::time::{Duration, interval, timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct PositionMonitor {
    engine: Arc<OrderEngine>,
    broker: Arc<dyn BrokerAdapter>,
    status_repo: Arc<SqliteMonitorStatusRepository>,
    indicators: IndicatorService,
    advisor: Option<Arc<dyn Advisor>>,
    settings: Arc<SettingsStore>,
    clock: Arc<dyn Clock>,
    alerts: Arc<AlertMailbox>,
    metrics: Metrics,
    /// Tick re-entrancy latch: a slow tick is skipped over, never queued.
    tick_running: AtomicBool,
    /// Advisor budget for the current cycle.
    advisor_calls: AtomicU32,
}

impl PositionMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<OrderEngine>,
        broker: Arc<dyn BrokerAdapter>,
        advisor: Option<Arc<dyn Advisor>>,
        settings: Arc<SettingsStore>,
        clock: Arc<dyn Clock>,
        alerts: Arc<AlertMailbox>,
        metrics: Metrics,
    ) -> Arc<Self> {
        let status_repo = Arc::new(SqliteMonitorStatusRepository::new(
            engine.orders_repo().pool().clone(),
        ));
        Arc::new(Self {
            engine,
            broker,
            status_repo,
            indicators: IndicatorService::new(),
            advisor,
            settings,
            clock,
            alerts,
            metrics,
            tick_running: AtomicBool::new(false),
            advisor_calls: AtomicU32::new(0),
        })
    }

    pub async fn run(self: Arc<Self>, cycle_id: Uuid) {
        let interval_secs = self.settings.snapshot().monitor.check_interval_seconds;
        info!("PositionMonitor started for cycle {cycle_id} (interval: {interval_secs}s)");
        let mut tick = interval(Duration::from_secs(interval_secs.max(1)));
        tick.tick().await;

        loop {
            tick.tick().await;
            if !self.clock.in_market_hours() {
                continue;
            }
            // Skip, never queue, if the previous tick still runs.
            if self.tick_running.swap(true, Ordering::SeqCst) {
                warn!("PositionMonitor: previous tick still running, skipping");
                continue;
            }
            if let Err(e) = self.tick_once(cycle_id).await {
                error!("PositionMonitor: tick failed: {e:#}");
            }
            self.tick_running.store(false, Ordering::SeqCst);
        }
    }

    /// One pass over the open positions. Public so tests and the one-shot
    /// CLI can drive it without the scheduler.
    pub async fn tick_once(&self, cycle_id: Uuid) -> Result<Vec<(Uuid, Recommendation)>> {
        let positions = self.engine.positions_repo().list_open(Some(cycle_id)).await?;
        let mut verdicts = Vec::with_capacity(positions.len());

        for position in positions {
            match self.evaluate_position(&position).await {
                Ok(recommendation) => verdicts.push((position.id, recommendation)),
                Err(e) => {
                    error!(
                        "PositionMonitor: evaluation failed for {}: {e:#}",
                        position.symbol
                    );
                }
            }
        }
        Ok(verdicts)
    }

    async fn evaluate_position(&self, position: &Position) -> Result<Recommendation> {
        let settings = self.settings.snapshot();
        let deadline = Duration::from_secs(settings.risk.broker_deadline_seconds.max(1));

        // Hold-time policy precedes the signal rules: a day trade that has
        // sat past its allowance leaves regardless of indicators.
        if let Some(entry_time) = position.entry_time {
            let held = self.clock.now() - entry_time;
            if held >= chrono::Duration::minutes(settings.positions.max_hold_time_minutes) {
                info!(
                    "PositionMonitor: EXIT {} (max_hold_time, held {}m)",
                    position.symbol,
                    held.num_minutes()
                );
                self.engine
                    .close_position(position.id, "max_hold_time")
                    .await?;
                self.indicators.forget(&position.symbol);
                return Ok(Recommendation::Exit);
            }
        }

        let quote = match timeout(deadline, self.broker.get_quote(&position.symbol)).await {
            Ok(Ok(quote)) => quote,
            Ok(Err(e)) => {
                warn!("PositionMonitor: no quote for {} ({e})", position.symbol);
                return Ok(Recommendation::Hold);
            }
            Err(_) => {
                warn!("PositionMonitor: quote deadline for {}", position.symbol);
                return Ok(Recommendation::Hold);
            }
        };

        // Session volume for the volume-decay rule; best effort.
        let session_volume = match timeout(
            deadline,
            self.broker.latest_bars(&[position.symbol.clone()]),
        )
        .await
        {
            Ok(Ok(bars)) => bars.first().map(|b| b.volume),
            _ => None,
        };

        let position = self
            .engine
            .mark_position_price(position.id, quote.last)
            .await?;
        let indicators = self
            .indicators
            .observe(&position.symbol, quote.last, session_volume);

        let volume_ratio = match (session_volume, position.entry_volume) {
            (Some(now), Some(at_entry)) if !at_entry.is_zero() => (now / at_entry).to_f64(),
            _ => None,
        };

        let snapshot = PositionSnapshot {
            pnl_pct: position
                .unrealized_pnl_pct
                .and_then(|p| p.to_f64())
                .unwrap_or(0.0),
            last_price: quote.last,
            high_watermark: position.high_watermark.unwrap_or(quote.last),
            rsi: indicators.rsi,
            macd_histogram: indicators.macd_histogram,
            volume_ratio,
            above_vwap: indicators.above_vwap,
            in_closing_window: self.clock.in_final_minutes(15),
        };
        let report = evaluate(&snapshot, &settings.monitor_thresholds());

        let mut recommendation = report.recommendation;
        let mut advisor_reason: Option<String> = None;

        if recommendation == Recommendation::Review {
            if let Some(verdict) = self.consult_advisor(&position, &report).await {
                if verdict.action == AdvisorAction::Exit {
                    recommendation = Recommendation::Exit;
                }
                advisor_reason = Some(verdict.reason);
            }
        }

        if recommendation == Recommendation::Exit {
            let reason = report
                .exit_signals
                .iter()
                .find(|s| s.strength == SignalStrength::Strong)
                .map(|s| s.kind.as_str().to_string())
                .or(advisor_reason.clone())
                .unwrap_or_else(|| "monitor_exit".to_string());
            info!(
                "PositionMonitor: EXIT {} ({reason}, pnl {:.2}%)",
                position.symbol, snapshot.pnl_pct
            );
            if let Err(e) = self.engine.close_position(position.id, &reason).await {
                error!(
                    "PositionMonitor: close failed for {}: {e:#}",
                    position.symbol
                );
                self.alerts.post_critical(
                    "PositionMonitor",
                    format!("Exit signal for {} but close failed: {e}", position.symbol),
                );
            } else {
                self.indicators.forget(&position.symbol);
            }
        }

        self.write_status(&position, &snapshot, &report, recommendation)
            .await;
        Ok(recommendation)
    }

    /// Consult the advisor on a REVIEW verdict, if one is configured and the
    /// cycle budget allows. Failures read as "no opinion".
    async fn consult_advisor(
        &self,
        position: &Position,
        report: &crate::domain::monitoring::signals::SignalReport,
    ) -> Option<crate::domain::ports::AdvisorVerdict> {
        let advisor = self.advisor.as_ref()?;
        let budget = self.settings.snapshot().monitor.max_advisor_calls;

        let used = self.advisor_calls.fetch_add(1, Ordering::SeqCst);
        if used >= budget {
            self.advisor_calls.fetch_sub(1, Ordering::SeqCst);
            info!(
                "PositionMonitor: advisor budget exhausted ({budget}), skipping consult for {}",
                position.symbol
            );
            return None;
        }

        let context = AdvisorContext {
            symbol: position.symbol.clone(),
            side: position.side.as_str().to_string(),
            pnl_pct: position
                .unrealized_pnl_pct
                .and_then(|p| p.to_f64())
                .unwrap_or(0.0),
            exit_signals: report
                .exit_signals
                .iter()
                .map(|s| s.kind.as_str().to_string())
                .collect(),
            hold_signals: report
                .hold_signals
                .iter()
                .map(|s| s.as_str().to_string())
                .collect(),
        };

        match advisor.consult(&context).await {
            Ok(verdict) => {
                self.metrics
                    .advisor_calls_total
                    .with_label_values(&[match verdict.action {
                        AdvisorAction::Exit => "exit",
                        AdvisorAction::Hold => "hold",
                    }])
                    .inc();
                Some(verdict)
            }
            Err(e) => {
                warn!("PositionMonitor: advisor consult failed: {e:#}");
                None
            }
        }
    }

    /// Upsert the status row; one retry, then the monitor row goes to error.
    async fn write_status(
        &self,
        position: &Position,
        snapshot: &PositionSnapshot,
        report: &crate::domain::monitoring::signals::SignalReport,
        recommendation: Recommendation,
    ) {
        let status = MonitorStatus {
            position_id: position.id,
            symbol: position.symbol.clone(),
            state: MonitorRunState::Running,
            last_price: Some(snapshot.last_price),
            high_watermark: Some(snapshot.high_watermark),
            pnl_pct: Some(snapshot.pnl_pct),
            rsi: snapshot.rsi,
            macd_histogram: snapshot.macd_histogram,
            vwap_position: snapshot.above_vwap.map(|above| {
                if above { "above" } else { "below" }.to_string()
            }),
            hold_signals: report
                .hold_signals
                .iter()
                .map(|s| s.as_str().to_string())
                .collect(),
            exit_signals: report
                .exit_signals
                .iter()
                .map(|s| s.kind.as_str().to_string())
                .collect(),
            recommendation,
            advisor_calls: self.advisor_calls.load(Ordering::SeqCst) as i64,
            estimated_cost: self.advisor_calls.load(Ordering::SeqCst) as f64 * 0.01,
            last_checkin: self.clock.now(),
        };

        if self.status_repo.upsert(&status).await.is_ok() {
            return;
        }
        warn!(
            "PositionMonitor: status write failed for {}, retrying once",
            position.symbol
        );
        if let Err(e) = self.status_repo.upsert(&status).await {
            error!(
                "PositionMonitor: status write failed twice for {}: {e:#}",
                position.symbol
            );
            let _ = self
                .status_repo
                .set_state(position.id, MonitorRunState::Error)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::engine::TradeCandidate;
    use crate::config::Settings;
    use crate::domain::clock::{FixedClock, SessionSpec};
    use crate::domain::ports::AdvisorVerdict;
    use crate::domain::trading::cycle::{CycleMode, TradingCycle};
    use crate::domain::trading::types::{PositionSide, PositionStatus};
    use crate::infrastructure::mock::MockBroker;
    use crate::infrastructure::persistence::database::Database;
    use crate::infrastructure::persistence::repositories::SqliteCycleRepository;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedAdvisor {
        action: AdvisorAction,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Advisor for ScriptedAdvisor {
        async fn consult(&self, _context: &AdvisorContext) -> Result<AdvisorVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AdvisorVerdict {
                action: self.action,
                reason: "scripted".to_string(),
            })
        }
    }

    struct Fixture {
        monitor: Arc<PositionMonitor>,
        engine: Arc<OrderEngine>,
        broker: Arc<MockBroker>,
        cycle_id: Uuid,
        clock: Arc<FixedClock>,
    }

    async fn fixture(advisor: Option<Arc<dyn Advisor>>) -> Fixture {
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
            Duration::from_secs(10),
        ));
        let monitor = PositionMonitor::new(
            engine.clone(),
            broker.clone(),
            advisor,
            settings,
            clock.clone(),
            alerts,
            metrics,
        );

        let cycles = SqliteCycleRepository::new(db.pool.clone());
        let cycle = TradingCycle::new(
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            CycleMode::Paper,
            serde_json::Value::Null,
        );
        cycles.create(&cycle).await.unwrap();

        Fixture {
            monitor,
            engine,
            broker,
            cycle_id: cycle.id,
            clock,
        }
    }

    async fn open_position(fx: &Fixture, symbol: &str, entry: Decimal) -> Uuid {
        let candidate = TradeCandidate {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            qty: dec!(10),
            entry_price: entry,
            stop_loss: entry * dec!(0.95),
            take_profit: entry * dec!(1.10),
            risk_amount: dec!(50),
            pattern: None,
            catalyst: None,
            entry_volume: Some(dec!(1000000)),
        };
        let opened = fx.engine.open_position(fx.cycle_id, &candidate).await.unwrap();
        let order = fx.engine.orders_repo().get(opened.entry_order_id).await.unwrap();
        let broker_id = order.broker_order_id.unwrap();
        fx.broker.fill_order(&broker_id, entry, Utc::now());
        fx.engine
            .on_fill(&broker_id, dec!(10), entry, Utc::now())
            .await
            .unwrap();
        opened.position_id
    }

    #[tokio::test]
    async fn healthy_position_holds_and_writes_status() {
        let fx = fixture(None).await;
        let position_id = open_position(&fx, "AAPL", dec!(100)).await;
        fx.broker.set_quote("AAPL", dec!(101));

        let verdicts = fx.monitor.tick_once(fx.cycle_id).await.unwrap();
        assert_eq!(verdicts, vec![(position_id, Recommendation::Hold)]);

        let status_repo =
            SqliteMonitorStatusRepository::new(fx.engine.orders_repo().pool().clone());
        let status = status_repo.get(position_id).await.unwrap().unwrap();
        assert_eq!(status.state, MonitorRunState::Running);
        assert_eq!(status.last_price, Some(dec!(101)));
        assert!(status.hold_signals.contains(&"healthy_profit".to_string()));
    }

    #[tokio::test]
    async fn stop_loss_breach_exits_the_position() {
        let fx = fixture(None).await;
        let position_id = open_position(&fx, "AAPL", dec!(100)).await;
        // -6%: past the -5% strong stop.
        fx.broker.set_quote("AAPL", dec!(94));

        let verdicts = fx.monitor.tick_once(fx.cycle_id).await.unwrap();
        assert_eq!(verdicts, vec![(position_id, Recommendation::Exit)]);
        assert_eq!(fx.broker.close_requests(), vec!["AAPL".to_string()]);
    }

    #[tokio::test]
    async fn market_close_window_exits() {
        let fx = fixture(None).await;
        let position_id = open_position(&fx, "AAPL", dec!(100)).await;
        fx.broker.set_quote("AAPL", dec!(101));

        // 19:50 UTC: ten minutes before the close.
        fx.clock.set(Utc.with_ymd_and_hms(2025, 3, 10, 19, 50, 0).unwrap());
        let verdicts = fx.monitor.tick_once(fx.cycle_id).await.unwrap();
        assert_eq!(verdicts, vec![(position_id, Recommendation::Exit)]);
    }

    #[tokio::test]
    async fn advisor_turns_review_into_exit_within_budget() {
        let advisor = Arc::new(ScriptedAdvisor {
            action: AdvisorAction::Exit,
            calls: AtomicUsize::new(0),
        });
        let fx = fixture(Some(advisor.clone() as Arc<dyn Advisor>)).await;
        let position_id = open_position(&fx, "AAPL", dec!(100)).await;

        // Volume collapse to 30% of entry volume: MODERATE, so REVIEW.
        fx.broker.set_quote("AAPL", dec!(101));
        fx.broker.set_bars(vec![crate::domain::ports::BarSnapshot {
            symbol: "AAPL".to_string(),
            open: dec!(100),
            close: dec!(101),
            prev_close: Some(dec!(100)),
            volume: dec!(300000),
            avg_volume: Some(dec!(1000000)),
            ts: Utc::now(),
        }]);

        let verdicts = fx.monitor.tick_once(fx.cycle_id).await.unwrap();
        assert_eq!(verdicts, vec![(position_id, Recommendation::Exit)]);
        assert_eq!(advisor.calls.load(Ordering::SeqCst), 1);

        let position = fx.engine.positions_repo().get(position_id).await.unwrap();
        assert_ne!(position.status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn advisor_budget_is_enforced() {
        let advisor = Arc::new(ScriptedAdvisor {
            action: AdvisorAction::Hold,
            calls: AtomicUsize::new(0),
        });
        let fx = fixture(Some(advisor.clone() as Arc<dyn Advisor>)).await;
        let position_id = open_position(&fx, "AAPL", dec!(100)).await;

        fx.broker.set_quote("AAPL", dec!(101));
        fx.broker.set_bars(vec![crate::domain::ports::BarSnapshot {
            symbol: "AAPL".to_string(),
            open: dec!(100),
            close: dec!(101),
            prev_close: Some(dec!(100)),
            volume: dec!(300000),
            avg_volume: Some(dec!(1000000)),
            ts: Utc::now(),
        }]);

        // Budget is 5; tick ten times in REVIEW conditions.
        for _ in 0..10 {
            let verdicts = fx.monitor.tick_once(fx.cycle_id).await.unwrap();
            assert_eq!(verdicts, vec![(position_id, Recommendation::Review)]);
        }
        assert_eq!(advisor.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn quote_outage_degrades_to_hold() {
        let fx = fixture(None).await;
        let position_id = open_position(&fx, "AAPL", dec!(100)).await;
        // No quote configured: the mock reports a transient error.

        let verdicts = fx.monitor.tick_once(fx.cycle_id).await.unwrap();
        assert_eq!(verdicts, vec![(position_id, Recommendation::Hold)]);
        assert!(fx.broker.close_requests().is_empty());
    }
}
