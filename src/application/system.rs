//! Application wiring and the scheduler. Services are constructed once at
//! startup and injected; no ambient process-wide state.

use crate::application::alerts::AlertMailbox;
use crate::application::engine::OrderEngine;
use crate::application::monitor::PositionMonitor;
use crate::application::orchestrator::CycleRunner;
use crate::application::risk::{RiskMonitor, RiskValidator};
use crate::application::watchdog::Watchdog;
use crate::config::{BrokerConfig, Settings, SettingsStore};
use crate::domain::clock::{Clock, SystemClock};
use crate::domain::ports::{Advisor, AlertSink, BrokerAdapter, NewsService};
use crate::domain::trading::cycle::CycleState;
use crate::infrastructure::advisor::HttpAdvisor;
use crate::infrastructure::alerts::{LogAlertSink, WebhookAlertSink};
use crate::infrastructure::alpaca::AlpacaBroker;
use crate::infrastructure::mock::MockBroker;
use crate::infrastructure::news::mock_news::MockNewsService;
use crate::infrastructure::news::rss::RssNewsService;
use crate::infrastructure::observability::{Metrics, MetricsReporter};
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::{
    SqliteCycleRepository, SqlitePositionRepository, SqliteWatchdogRepository,
};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

const SETTINGS_RELOAD_SECS: u64 = 60;
const SCHEDULER_TICK_SECS: u64 = 60;

pub struct Application {
    pub settings: Arc<SettingsStore>,
    pub db: Database,
    pub broker: Arc<dyn BrokerAdapter>,
    pub engine: Arc<OrderEngine>,
    pub runner: Arc<CycleRunner>,
    pub alerts: Arc<AlertMailbox>,
    pub metrics: Metrics,
    pub clock: Arc<dyn Clock>,
    advisor: Option<Arc<dyn Advisor>>,
    sinks: Vec<Arc<dyn AlertSink>>,
}

pub struct SystemHandle {
    pub tasks: Vec<JoinHandle<()>>,
}

impl Application {
    pub async fn build(config: BrokerConfig, settings_path: Option<PathBuf>) -> Result<Self> {
        let settings = match &settings_path {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        info!(
            "Building application (mode: {}, exchange profile: {})",
            settings.session.mode, settings.exchange.profile
        );

        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(
            settings.exchange.session_spec().context("Bad exchange session")?,
        ));
        let paper = settings.session.mode == "paper";
        let settings = SettingsStore::new(settings, settings_path);
        settings.spawn_reload_task(SETTINGS_RELOAD_SECS);

        // The store refuses to start on schema drift.
        let db = Database::new(&config.database_url).await?;
        SqliteWatchdogRepository::new(db.pool.clone())
            .seed_default_rules()
            .await?;

        let deadline = Duration::from_secs(settings.snapshot().risk.broker_deadline_seconds.max(1));
        let broker: Arc<dyn BrokerAdapter> =
            if paper && config.alpaca_api_key.is_empty() {
                info!("No broker credentials; using the in-memory paper broker");
                Arc::new(MockBroker::new())
            } else {
                Arc::new(AlpacaBroker::new(
                    config.alpaca_api_key.clone(),
                    config.alpaca_secret_key.clone(),
                    config.alpaca_base_url.clone(),
                    config.alpaca_data_url.clone(),
                    settings.snapshot().exchange.tick_decimals,
                    deadline,
                ))
            };

        let news: Arc<dyn NewsService> = match &config.news_feed_url {
            Some(url) => Arc::new(RssNewsService::new(url, Duration::from_secs(300))),
            None => {
                warn!("No NEWS_FEED_URL; news stage will run degraded");
                Arc::new(MockNewsService::new())
            }
        };

        let advisor: Option<Arc<dyn Advisor>> = config
            .advisor_url
            .as_deref()
            .map(|url| Arc::new(HttpAdvisor::new(url)) as Arc<dyn Advisor>);

        let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlertSink)];
        if let Some(url) = &config.alert_webhook_url {
            sinks.push(Arc::new(WebhookAlertSink::new(url)));
        }

        let alerts = AlertMailbox::new(256);
        let metrics = Metrics::new()?;
        let engine = Arc::new(OrderEngine::new(
            broker.clone(),
            db.clone(),
            alerts.clone(),
            metrics.clone(),
            deadline,
        ));
        let validator = Arc::new(RiskValidator::new(&db, settings.clone()));
        let runner = Arc::new(CycleRunner::new(
            broker.clone(),
            &db,
            clock.clone(),
            news,
            validator,
            engine.clone(),
            settings.clone(),
            alerts.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            settings,
            db,
            broker,
            engine,
            runner,
            alerts,
            metrics,
            clock,
            advisor,
            sinks,
        })
    }

    /// Start the task set: alert delivery, the scheduler, and (per cycle)
    /// the risk monitor, position monitor and watchdog.
    pub async fn start(self) -> Result<SystemHandle> {
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(self.alerts.clone().run(self.sinks.clone())));

        match self.broker.connect().await {
            Ok(()) => info!("Broker session established"),
            Err(e) => warn!("Broker connect failed at startup: {e}; continuing, watchdog will retry"),
        }

        let scheduler = Scheduler {
            settings: self.settings.clone(),
            engine: self.engine.clone(),
            runner: self.runner.clone(),
            broker: self.broker.clone(),
            advisor: self.advisor.clone(),
            alerts: self.alerts.clone(),
            metrics: self.metrics.clone(),
            clock: self.clock.clone(),
            db: self.db.clone(),
        };
        tasks.push(tokio::spawn(scheduler.run()));

        info!("Application started");
        Ok(SystemHandle { tasks })
    }
}

/// Drives the trading day: scans on the configured cadence during market
/// hours, spawns the per-cycle monitors once, and closes the cycle after the
/// session ends.
struct Scheduler {
    settings: Arc<SettingsStore>,
    engine: Arc<OrderEngine>,
    runner: Arc<CycleRunner>,
    broker: Arc<dyn BrokerAdapter>,
    advisor: Option<Arc<dyn Advisor>>,
    alerts: Arc<AlertMailbox>,
    metrics: Metrics,
    clock: Arc<dyn Clock>,
    db: Database,
}

impl Scheduler {
    async fn run(self) {
        let mut tick = tokio::time::interval(Duration::from_secs(SCHEDULER_TICK_SECS));
        let mut last_scan: Option<chrono::DateTime<chrono::Utc>> = None;
        let mut monitored_cycle: Option<Uuid> = None;
        let cycles = SqliteCycleRepository::new(self.db.pool.clone());

        info!("Scheduler started");
        loop {
            tick.tick().await;
            let now = self.clock.now();
            let phase = self.clock.phase();

            if phase == crate::domain::clock::MarketPhase::PreMarket || self.clock.in_market_hours()
            {
                let scan_due = match last_scan {
                    // Pre-market gets the first scan of the day; intra-day
                    // scans repeat on the configured cadence.
                    None => true,
                    Some(prev) => {
                        self.clock.in_market_hours() && {
                            let frequency =
                                self.settings.snapshot().workflow.scan_frequency_minutes;
                            now - prev >= chrono::Duration::minutes(frequency as i64)
                        }
                    }
                };
                if scan_due {
                    last_scan = Some(now);
                    match self.runner.run(now.date_naive()).await {
                        Ok(cycle_id) => {
                            if monitored_cycle != Some(cycle_id) {
                                monitored_cycle = Some(cycle_id);
                                self.spawn_cycle_tasks(cycle_id);
                            }
                        }
                        Err(e) => error!("Scheduler: cycle run failed: {e:#}"),
                    }
                }
            } else if let Some(cycle_id) = monitored_cycle.take() {
                // Session over: flatten the book if configured, then close a
                // cycle that reached monitoring.
                if self.settings.snapshot().positions.close_all_at_market_close {
                    match self.engine.close_all(cycle_id, "market_close").await {
                        Ok(report) if report.attempted > 0 => info!(
                            "Scheduler: market-close flatten submitted {}/{}",
                            report.submitted, report.attempted
                        ),
                        Ok(_) => {}
                        Err(e) => error!("Scheduler: market-close flatten failed: {e:#}"),
                    }
                }
                if let Ok(cycle) = cycles.get(cycle_id).await
                    && cycle.state == CycleState::Monitoring
                {
                    if let Err(e) = cycles
                        .set_state(cycle_id, CycleState::Closed, chrono::Utc::now())
                        .await
                    {
                        error!("Scheduler: failed to close cycle {cycle_id}: {e:#}");
                    } else {
                        self.metrics.cycles_total.with_label_values(&["closed"]).inc();
                        info!("Scheduler: cycle {cycle_id} closed after session end");
                    }
                }
                last_scan = None;
            }
        }
    }

    fn spawn_cycle_tasks(&self, cycle_id: Uuid) {
        info!("Scheduler: starting monitors for cycle {cycle_id}");

        let risk_monitor = RiskMonitor::new(
            self.engine.clone(),
            self.settings.clone(),
            self.alerts.clone(),
            self.metrics.clone(),
        );
        tokio::spawn(risk_monitor.run(cycle_id));

        let position_monitor = PositionMonitor::new(
            self.engine.clone(),
            self.broker.clone(),
            self.advisor.clone(),
            self.settings.clone(),
            self.clock.clone(),
            self.alerts.clone(),
            self.metrics.clone(),
        );
        tokio::spawn(position_monitor.run(cycle_id));

        let watchdog = Watchdog::new(
            self.engine.clone(),
            self.settings.clone(),
            self.clock.clone(),
            self.alerts.clone(),
            self.metrics.clone(),
        );
        tokio::spawn(watchdog.run(cycle_id));

        let reporter = MetricsReporter::new(
            self.metrics.clone(),
            Arc::new(SqlitePositionRepository::new(self.db.pool.clone())),
            Arc::new(SqliteCycleRepository::new(self.db.pool.clone())),
            cycle_id,
            60,
        );
        tokio::spawn(reporter.run());
    }
}
