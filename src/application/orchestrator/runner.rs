//! The trading-cycle pipeline: scan, filter stages, risk validation,
//! execution. Stage failures degrade per policy; execution failures never
//! abort the batch; the cycle reaches `monitoring` even with zero trades.

use crate::application::alerts::AlertMailbox;
use crate::application::engine::{OrderEngine, TradeCandidate};
use crate::application::orchestrator::scanner::UniverseScanner;
use crate::application::orchestrator::stages::{
    NewsStage, PatternStage, StageEval, TechnicalStage, apply_stage_policy,
};
use crate::application::risk::RiskValidator;
use crate::config::SettingsStore;
use crate::domain::clock::Clock;
use crate::domain::ports::BrokerAdapter;
use crate::domain::trading::cycle::{CycleState, TradingCycle};
use crate::domain::trading::scoring::{ScanResult, ScanStatus, rank_candidates};
use crate::domain::trading::types::PositionSide;
use crate::infrastructure::alpaca::round_to_tick;
use crate::infrastructure::observability::Metrics;
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::{
    SqliteCycleRepository, SqliteScanResultRepository,
};
use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct CycleRunner {
    broker: Arc<dyn BrokerAdapter>,
    scanner: UniverseScanner,
    news_stage: NewsStage,
    pattern_stage: PatternStage,
    technical_stage: TechnicalStage,
    validator: Arc<RiskValidator>,
    engine: Arc<OrderEngine>,
    cycles: Arc<SqliteCycleRepository>,
    scan_results: Arc<SqliteScanResultRepository>,
    settings: Arc<SettingsStore>,
    alerts: Arc<AlertMailbox>,
    metrics: Metrics,
}

impl CycleRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        db: &Database,
        clock: Arc<dyn Clock>,
        news: Arc<dyn crate::domain::ports::NewsService>,
        validator: Arc<RiskValidator>,
        engine: Arc<OrderEngine>,
        settings: Arc<SettingsStore>,
        alerts: Arc<AlertMailbox>,
        metrics: Metrics,
    ) -> Self {
        Self {
            scanner: UniverseScanner::new(broker.clone(), db, clock),
            news_stage: NewsStage::new(news, chrono::Duration::hours(24)),
            pattern_stage: PatternStage,
            technical_stage: TechnicalStage,
            validator,
            engine,
            cycles: Arc::new(SqliteCycleRepository::new(db.pool.clone())),
            scan_results: Arc::new(SqliteScanResultRepository::new(db.pool.clone())),
            broker,
            settings,
            alerts,
            metrics,
        }
    }

    /// Run one full cycle for the date. Reuses the day's cycle if it is
    /// still live; a stopped or errored cycle needs a manual restart and is
    /// never silently resumed.
    pub async fn run(&self, date: NaiveDate) -> Result<Uuid> {
        let settings = self.settings.snapshot();

        let cycle = match self.cycles.find_by_date(date).await? {
            Some(existing) if existing.state.is_terminal() => {
                bail!(
                    "Cycle for {date} is {}; manual restart required",
                    existing.state.as_str()
                );
            }
            Some(existing) => existing,
            None => {
                let mode = settings.session.cycle_mode()?;
                let cycle = TradingCycle::new(
                    date,
                    mode,
                    serde_json::to_value(settings.as_ref()).unwrap_or(serde_json::Value::Null),
                );
                self.cycles.create(&cycle).await?;
                self.metrics
                    .cycles_total
                    .with_label_values(&["created"])
                    .inc();
                info!("CycleRunner: created cycle {} for {date}", cycle.id);
                cycle
            }
        };
        let cycle_id = cycle.id;

        match self.run_pipeline(&cycle, &settings).await {
            Ok(()) => Ok(cycle_id),
            Err(e) => {
                error!("CycleRunner: cycle {cycle_id} failed: {e:#}");
                self.advance(cycle_id, CycleState::Error).await.ok();
                self.metrics.cycles_total.with_label_values(&["error"]).inc();
                self.alerts
                    .post_critical("CycleRunner", format!("Cycle {cycle_id} failed: {e}"));
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        cycle: &TradingCycle,
        settings: &crate::config::Settings,
    ) -> Result<()> {
        let cycle_id = cycle.id;

        // Scan.
        self.advance(cycle_id, CycleState::Scanning).await?;
        let mut candidates = self
            .scanner
            .scan(cycle_id, settings)
            .await
            .context("Scan stage failed")?;
        self.metrics.stage_candidates.set(candidates.len() as f64);

        // News / catalyst.
        if settings.filters.news.enabled {
            self.advance(cycle_id, CycleState::FilteringNews).await?;
            let mut evals = Vec::with_capacity(candidates.len());
            for candidate in &candidates {
                evals.push(self.news_stage.evaluate(candidate).await);
            }
            candidates = self
                .apply_stage("news", candidates, evals, &settings.filters.news, |c, s| {
                    c.scores.catalyst = s;
                })
                .await?;
        }

        // Patterns.
        if settings.filters.pattern.enabled {
            self.advance(cycle_id, CycleState::FilteringPatterns).await?;
            let mut evals = Vec::with_capacity(candidates.len());
            for candidate in &mut candidates {
                let (eval, label) = self.pattern_stage.evaluate(candidate);
                if let Some(label) = label {
                    candidate.metadata = serde_json::json!({ "pattern": label });
                }
                evals.push(eval);
            }
            candidates = self
                .apply_stage(
                    "pattern",
                    candidates,
                    evals,
                    &settings.filters.pattern,
                    |c, s| {
                        c.scores.pattern = s;
                    },
                )
                .await?;
        }

        // Technicals.
        if settings.filters.technical.enabled {
            self.advance(cycle_id, CycleState::FilteringTechnical).await?;
            let evals: Vec<StageEval> = candidates
                .iter()
                .map(|c| self.technical_stage.evaluate(c))
                .collect();
            candidates = self
                .apply_stage(
                    "technical",
                    candidates,
                    evals,
                    &settings.filters.technical,
                    |c, s| {
                        c.scores.technical = s;
                    },
                )
                .await?;
        }

        // Selection + risk validation + execution.
        self.advance(cycle_id, CycleState::RiskValidation).await?;
        rank_candidates(&mut candidates);
        let top_n = settings.workflow.execute_top_n;
        for (idx, candidate) in candidates.iter_mut().enumerate() {
            candidate.status = if idx < top_n
                && candidate.composite_score >= settings.workflow.min_confidence_score
            {
                ScanStatus::Selected
            } else {
                ScanStatus::Candidate
            };
            self.scan_results.update_scores(candidate).await?;
        }
        let selected: Vec<&ScanResult> = candidates
            .iter()
            .filter(|c| c.status == ScanStatus::Selected)
            .collect();
        info!(
            "CycleRunner: {} of {} candidates selected",
            selected.len(),
            candidates.len()
        );

        self.advance(cycle_id, CycleState::Executing).await?;
        match self.broker.get_account().await {
            Ok(account) => {
                for candidate in &selected {
                    if let Err(e) = self.execute_candidate(cycle_id, candidate, settings, &account).await
                    {
                        // Per-candidate failures never abort the batch.
                        warn!(
                            "CycleRunner: execution failed for {}: {e:#}",
                            candidate.symbol
                        );
                    }
                }
            }
            Err(e) => {
                warn!("CycleRunner: account unavailable, skipping execution: {e}");
                self.alerts.post_warning(
                    "CycleRunner",
                    format!("Execution skipped, account unavailable: {e}"),
                );
            }
        }

        // Monitoring is reached even when nothing executed.
        self.advance(cycle_id, CycleState::Monitoring).await?;
        Ok(())
    }

    async fn apply_stage(
        &self,
        name: &str,
        candidates: Vec<ScanResult>,
        evals: Vec<StageEval>,
        policy: &crate::config::StagePolicy,
        set_score: impl FnMut(&mut ScanResult, f64),
    ) -> Result<Vec<ScanResult>> {
        let outcome = apply_stage_policy(name, candidates, evals, policy, set_score);
        for rejected in &outcome.rejected {
            self.scan_results.update_scores(rejected).await?;
        }
        self.metrics
            .stage_candidates
            .set(outcome.survivors.len() as f64);
        Ok(outcome.survivors)
    }

    async fn execute_candidate(
        &self,
        cycle_id: Uuid,
        candidate: &ScanResult,
        settings: &crate::config::Settings,
        account: &crate::domain::ports::AccountSnapshot,
    ) -> Result<()> {
        let tick = settings.exchange.tick_decimals;
        let entry_price = round_to_tick(candidate.price, tick);
        let stop_pct = Decimal::try_from(settings.positions.default_stop_loss_pct / 100.0)
            .unwrap_or_default();
        let tp_pct = Decimal::try_from(settings.positions.default_take_profit_pct / 100.0)
            .unwrap_or_default();
        let stop_loss = round_to_tick(entry_price * (Decimal::ONE - stop_pct), tick);
        let take_profit = round_to_tick(entry_price * (Decimal::ONE + tp_pct), tick);

        let qty = size_qty(entry_price, stop_loss, settings);
        if qty <= Decimal::ZERO {
            bail!("Sizing produced zero quantity for {}", candidate.symbol);
        }

        let pattern = candidate
            .metadata
            .get("pattern")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let trade = TradeCandidate {
            symbol: candidate.symbol.clone(),
            side: PositionSide::Long,
            qty,
            entry_price,
            stop_loss,
            take_profit,
            risk_amount: (entry_price - stop_loss).abs() * qty,
            pattern,
            catalyst: (candidate.scores.catalyst > 0.6).then(|| "news_sentiment".to_string()),
            entry_volume: Some(candidate.volume),
        };

        let verdict = self.validator.validate(cycle_id, &trade, account).await?;
        if !verdict.approved {
            info!(
                "CycleRunner: {} vetoed by risk ({})",
                trade.symbol,
                verdict.reason.as_deref().unwrap_or("unspecified")
            );
            return Ok(());
        }

        let mut trade = trade;
        trade.risk_amount = verdict.risk_amount;
        self.engine.open_position(cycle_id, &trade).await?;
        Ok(())
    }

    /// Advance the cycle through the state machine, validating the
    /// transition against the domain rules before persisting.
    async fn advance(&self, cycle_id: Uuid, state: CycleState) -> Result<()> {
        let mut cycle = self.cycles.get(cycle_id).await?;
        let now = Utc::now();
        cycle
            .advance(state, now)
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("Cycle {cycle_id} cannot enter {}", state.as_str()))?;
        self.cycles.set_state(cycle_id, state, now).await?;
        info!("CycleRunner: cycle {cycle_id} -> {}", state.as_str());
        Ok(())
    }
}

/// Risk-based sizing: an equal share of the risk budget per position slot,
/// divided by the per-share stop distance, capped by the max position value.
fn size_qty(entry: Decimal, stop: Decimal, settings: &crate::config::Settings) -> Decimal {
    let risk_per_share = (entry - stop).abs();
    if risk_per_share.is_zero() || entry.is_zero() {
        return Decimal::ZERO;
    }
    let per_slot =
        settings.risk.total_risk_budget / Decimal::from(settings.risk.max_positions.max(1) as i64);
    let by_risk = (per_slot / risk_per_share).floor();
    let by_value = (settings.risk.max_position_size / entry).floor();
    by_risk.min(by_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::domain::clock::{FixedClock, SessionSpec};
    use crate::domain::ports::{AssetInfo, BarSnapshot};
    use crate::infrastructure::mock::MockBroker;
    use crate::infrastructure::news::mock_news::MockNewsService;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Fixture {
        runner: CycleRunner,
        broker: Arc<MockBroker>,
        news: Arc<MockNewsService>,
        db: Database,
    }

    async fn fixture() -> Fixture {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let broker = Arc::new(MockBroker::new());
        let news = Arc::new(MockNewsService::new());
        let clock = Arc::new(FixedClock::at(
            Utc.with_ymd_and_hms(2025, 3, 10, 15, 0, 0).unwrap(),
            SessionSpec::us_equities(),
        ));
        let settings = crate::config::SettingsStore::new(Settings::default(), None);
        let alerts = AlertMailbox::new(64);
        let metrics = Metrics::new().unwrap();
        let engine = Arc::new(OrderEngine::new(
            broker.clone(),
            db.clone(),
            alerts.clone(),
            metrics.clone(),
            Duration::from_secs(10),
        ));
        let validator = Arc::new(RiskValidator::new(&db, settings.clone()));
        let runner = CycleRunner::new(
            broker.clone(),
            &db,
            clock,
            news.clone(),
            validator,
            engine,
            settings,
            alerts,
            metrics,
        );
        Fixture {
            runner,
            broker,
            news,
            db,
        }
    }

    fn seed_market(broker: &MockBroker) {
        broker.set_assets(vec![
            AssetInfo {
                symbol: "AAPL".to_string(),
                exchange: "NASDAQ".to_string(),
                tradable: true,
                fractionable: true,
                shortable: true,
            },
            AssetInfo {
                symbol: "MSFT".to_string(),
                exchange: "NASDAQ".to_string(),
                tradable: true,
                fractionable: true,
                shortable: true,
            },
        ]);
        broker.set_bars(vec![
            BarSnapshot {
                symbol: "AAPL".to_string(),
                open: dec!(150),
                close: dec!(151),
                prev_close: Some(dec!(143)),
                volume: dec!(2000000),
                avg_volume: Some(dec!(800000)),
                ts: Utc::now(),
            },
            BarSnapshot {
                symbol: "MSFT".to_string(),
                open: dec!(300),
                close: dec!(300.5),
                prev_close: Some(dec!(299)),
                volume: dec!(1000000),
                avg_volume: Some(dec!(950000)),
                ts: Utc::now(),
            },
        ]);
    }

    #[tokio::test]
    async fn full_pipeline_executes_top_candidate() {
        let fx = fixture().await;
        seed_market(&fx.broker);
        fx.news
            .add_headline("AAPL", "AAPL beats estimates and raises guidance", "");

        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let cycle_id = fx.runner.run(date).await.unwrap();

        let cycles = SqliteCycleRepository::new(fx.db.pool.clone());
        let cycle = cycles.get(cycle_id).await.unwrap();
        assert_eq!(cycle.state, CycleState::Monitoring);
        assert_eq!(cycle.trades_executed, 1);

        let brackets = fx.broker.submitted_brackets();
        assert_eq!(brackets.len(), 1);
        assert_eq!(brackets[0].symbol, "AAPL");

        let results = SqliteScanResultRepository::new(fx.db.pool.clone())
            .list_for_cycle(cycle_id)
            .await
            .unwrap();
        assert!(
            results
                .iter()
                .any(|r| r.symbol == "AAPL" && r.status == ScanStatus::Selected)
        );
    }

    #[tokio::test]
    async fn news_outage_degrades_and_still_trades() {
        let fx = fixture().await;
        seed_market(&fx.broker);
        fx.news.set_down(true);

        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let cycle_id = fx.runner.run(date).await.unwrap();

        let results = SqliteScanResultRepository::new(fx.db.pool.clone())
            .list_for_cycle(cycle_id)
            .await
            .unwrap();
        // Every candidate carries the fallback catalyst score.
        assert!(results.iter().all(|r| r.scores.catalyst == 0.5));
        // And at least one trade was still attempted.
        assert!(!fx.broker.submitted_brackets().is_empty());
    }

    #[tokio::test]
    async fn broker_outage_errors_the_cycle() {
        let fx = fixture().await;
        fx.broker.set_broker_down(true);

        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        assert!(fx.runner.run(date).await.is_err());

        let cycles = SqliteCycleRepository::new(fx.db.pool.clone());
        let cycle = cycles.find_by_date(date).await.unwrap().unwrap();
        assert_eq!(cycle.state, CycleState::Error);
    }

    #[tokio::test]
    async fn terminal_cycle_requires_manual_restart() {
        let fx = fixture().await;
        fx.broker.set_broker_down(true);
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        fx.runner.run(date).await.unwrap_err();

        let err = fx.runner.run(date).await.unwrap_err();
        assert!(err.to_string().contains("manual restart"));
    }

    #[tokio::test]
    async fn zero_selected_still_reaches_monitoring() {
        let fx = fixture().await;
        seed_market(&fx.broker);
        // Raise the confidence bar beyond reach.
        let mut settings = Settings::default();
        settings.workflow.min_confidence_score = 0.99;
        let store = crate::config::SettingsStore::new(settings, None);
        let runner = CycleRunner {
            settings: store,
            ..fx.runner
        };

        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let cycle_id = runner.run(date).await.unwrap();

        let cycles = SqliteCycleRepository::new(fx.db.pool.clone());
        let cycle = cycles.get(cycle_id).await.unwrap();
        assert_eq!(cycle.state, CycleState::Monitoring);
        assert_eq!(cycle.trades_executed, 0);
        assert!(fx.broker.submitted_brackets().is_empty());
    }

    #[test]
    fn sizing_respects_both_caps() {
        let settings = Settings::default();
        // Budget 10000 / 5 slots = 2000 per slot; stop distance 5 -> 400
        // shares by risk, but 10000 / 150 = 66 by value.
        let qty = size_qty(dec!(150), dec!(145), &settings);
        assert_eq!(qty, dec!(66));

        // Tight stop: risk cap dominates.
        let qty = size_qty(dec!(10), dec!(9), &settings);
        assert_eq!(qty, dec!(1000));
        assert!(size_qty(dec!(150), dec!(150), &settings).is_zero());
    }
}
