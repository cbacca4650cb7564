use crate::domain::clock::SessionSpec;
use crate::domain::monitoring::signals::MonitorThresholds;
use crate::domain::trading::cycle::CycleMode;
use anyhow::{Context, Result};
use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{error, info};

/// Broker/database wiring. Secrets come from the environment, never from the
/// settings file.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub alpaca_api_key: String,
    pub alpaca_secret_key: String,
    pub alpaca_base_url: String,
    pub alpaca_data_url: String,
    pub database_url: String,
    pub news_feed_url: Option<String>,
    pub advisor_url: Option<String>,
    pub alert_webhook_url: Option<String>,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        let alpaca_api_key = env::var("ALPACA_API_KEY").unwrap_or_default();
        let alpaca_secret_key = env::var("ALPACA_SECRET_KEY").unwrap_or_default();
        let alpaca_base_url = env::var("ALPACA_BASE_URL")
            .unwrap_or_else(|_| "https://paper-api.alpaca.markets".to_string());
        let alpaca_data_url = env::var("ALPACA_DATA_URL")
            .unwrap_or_else(|_| "https://data.alpaca.markets".to_string());
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://catalyst.db".to_string());

        Ok(Self {
            alpaca_api_key,
            alpaca_secret_key,
            alpaca_base_url,
            alpaca_data_url,
            database_url,
            news_feed_url: env::var("NEWS_FEED_URL").ok(),
            advisor_url: env::var("ADVISOR_URL").ok(),
            alert_webhook_url: env::var("ALERT_WEBHOOK_URL").ok(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub mode: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            mode: "paper".to_string(),
        }
    }
}

impl SessionSettings {
    pub fn cycle_mode(&self) -> Result<CycleMode> {
        CycleMode::parse(&self.mode)
            .with_context(|| format!("Invalid session.mode: {}", self.mode))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    pub max_daily_loss: Decimal,
    pub warning_threshold_pct: f64,
    pub max_positions: usize,
    pub max_position_size: Decimal,
    pub max_sector_exposure_pct: f64,
    pub total_risk_budget: Decimal,
    pub check_interval_seconds: u64,
    pub broker_deadline_seconds: u64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            max_daily_loss: Decimal::from(2000),
            warning_threshold_pct: 0.75,
            max_positions: 5,
            max_position_size: Decimal::from(10000),
            max_sector_exposure_pct: 40.0,
            total_risk_budget: Decimal::from(10000),
            check_interval_seconds: 60,
            broker_deadline_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionSettings {
    pub default_stop_loss_pct: f64,
    pub default_take_profit_pct: f64,
    pub max_hold_time_minutes: i64,
    pub close_all_at_market_close: bool,
}

impl Default for PositionSettings {
    fn default() -> Self {
        Self {
            default_stop_loss_pct: 3.0,
            default_take_profit_pct: 8.0,
            max_hold_time_minutes: 390,
            close_all_at_market_close: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    pub scan_frequency_minutes: u64,
    pub execute_top_n: usize,
    pub min_confidence_score: f64,
    pub initial_universe_size: usize,
    pub universe_sample_cap: usize,
    pub min_price: Decimal,
    pub max_price: Decimal,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            scan_frequency_minutes: 30,
            execute_top_n: 3,
            min_confidence_score: 0.5,
            initial_universe_size: 200,
            universe_sample_cap: 500,
            min_price: Decimal::from(2),
            max_price: Decimal::from(500),
        }
    }
}

/// Per-stage graceful-degradation policy: an enabled-but-not-required stage
/// whose signal source fails hands out `fallback_score` instead of dropping
/// the candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagePolicy {
    pub enabled: bool,
    pub required: bool,
    pub fallback_score: f64,
    pub threshold: f64,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            required: false,
            fallback_score: 0.5,
            threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub news: StagePolicy,
    pub pattern: StagePolicy,
    pub technical: StagePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub check_interval_seconds: u64,
    pub trail_pct: f64,
    pub stop_loss_strong_pct: f64,
    pub take_profit_strong_pct: f64,
    pub max_advisor_calls: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            check_interval_seconds: 300,
            trail_pct: 3.0,
            stop_loss_strong_pct: 5.0,
            take_profit_strong_pct: 10.0,
            max_advisor_calls: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    /// "us" or "intl"; selects default monitor thresholds and tick handling.
    pub profile: String,
    pub market_open_utc: String,
    pub market_close_utc: String,
    pub lunch_start_utc: Option<String>,
    pub lunch_end_utc: Option<String>,
    pub tick_decimals: u32,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            profile: "us".to_string(),
            market_open_utc: "13:30".to_string(),
            market_close_utc: "20:00".to_string(),
            lunch_start_utc: None,
            lunch_end_utc: None,
            tick_decimals: 2,
        }
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").with_context(|| format!("Invalid HH:MM time: {s}"))
}

impl ExchangeSettings {
    pub fn session_spec(&self) -> Result<SessionSpec> {
        let mut spec = SessionSpec::us_equities();
        spec.open = parse_hhmm(&self.market_open_utc)?;
        spec.close = parse_hhmm(&self.market_close_utc)?;
        spec.lunch = match (&self.lunch_start_utc, &self.lunch_end_utc) {
            (Some(start), Some(end)) => Some((parse_hhmm(start)?, parse_hhmm(end)?)),
            _ => None,
        };
        Ok(spec)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub session: SessionSettings,
    pub risk: RiskSettings,
    pub positions: PositionSettings,
    pub workflow: WorkflowSettings,
    pub filters: FilterSettings,
    pub monitor: MonitorSettings,
    pub exchange: ExchangeSettings,
}

impl Settings {
    /// Load from a TOML file. Absent file means documented defaults; a file
    /// present overrides only the keys it contains.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Settings file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings: Settings = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))?;
        Ok(settings)
    }

    /// Monitor thresholds for the configured exchange profile, with the
    /// monitor section's overrides applied.
    pub fn monitor_thresholds(&self) -> MonitorThresholds {
        let mut thresholds = if self.exchange.profile == "intl" {
            MonitorThresholds::intl_defaults()
        } else {
            MonitorThresholds::us_defaults()
        };
        thresholds.trail_pct = self.monitor.trail_pct;
        thresholds.stop_loss_pct = self.monitor.stop_loss_strong_pct;
        thresholds.take_profit_pct = self.monitor.take_profit_strong_pct;
        thresholds
    }
}

/// Hot-reloadable settings handle. Readers take an `Arc` snapshot; a
/// background task refreshes the snapshot from disk every `reload_secs`.
pub struct SettingsStore {
    current: RwLock<Arc<Settings>>,
    path: Option<PathBuf>,
}

impl SettingsStore {
    pub fn new(settings: Settings, path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Arc::new(settings)),
            path,
        })
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        self.current.read().expect("settings lock poisoned").clone()
    }

    fn reload(&self) {
        let Some(path) = &self.path else { return };
        match Settings::load(path) {
            Ok(settings) => {
                *self.current.write().expect("settings lock poisoned") = Arc::new(settings);
            }
            Err(e) => {
                // Keep the previous snapshot; a broken edit must not take
                // down a trading session.
                error!("SettingsStore: reload failed, keeping last snapshot: {e:#}");
            }
        }
    }

    pub fn spawn_reload_task(self: &Arc<Self>, reload_secs: u64) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(reload_secs.max(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                store.reload();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.risk.max_positions, 5);
        assert_eq!(settings.risk.max_daily_loss, dec!(2000));
        assert_eq!(settings.risk.warning_threshold_pct, 0.75);
        assert_eq!(settings.risk.max_sector_exposure_pct, 40.0);
        assert_eq!(settings.workflow.initial_universe_size, 200);
        assert_eq!(settings.workflow.scan_frequency_minutes, 30);
        assert_eq!(settings.monitor.check_interval_seconds, 300);
        assert_eq!(settings.monitor.max_advisor_calls, 5);
        assert!(settings.filters.news.enabled);
        assert!(!settings.filters.news.required);
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let parsed: Settings = toml::from_str(
            r#"
            [risk]
            max_daily_loss = "2500"

            [filters.news]
            required = true
            fallback_score = 0.4
            "#,
        )
        .unwrap();

        assert_eq!(parsed.risk.max_daily_loss, dec!(2500));
        assert_eq!(parsed.risk.max_positions, 5); // default preserved
        assert!(parsed.filters.news.required);
        assert_eq!(parsed.filters.news.fallback_score, 0.4);
        assert!(!parsed.filters.pattern.required); // untouched section
    }

    #[test]
    fn exchange_profile_selects_thresholds() {
        let mut settings = Settings::default();
        settings.exchange.profile = "intl".to_string();
        settings.monitor.stop_loss_strong_pct = 3.0;
        settings.monitor.take_profit_strong_pct = 8.0;
        settings.monitor.trail_pct = 2.0;

        let thresholds = settings.monitor_thresholds();
        assert_eq!(thresholds.stop_loss_pct, 3.0);
        assert_eq!(thresholds.take_profit_pct, 8.0);
        assert_eq!(thresholds.trail_pct, 2.0);
    }

    #[test]
    fn session_spec_with_lunch_break() {
        let mut exchange = ExchangeSettings::default();
        exchange.lunch_start_utc = Some("04:00".to_string());
        exchange.lunch_end_utc = Some("05:00".to_string());
        let spec = exchange.session_spec().unwrap();
        assert!(spec.lunch.is_some());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/settings.toml")).unwrap();
        assert_eq!(settings.risk.max_positions, 5);
    }

    #[test]
    fn store_snapshot_is_stable() {
        let store = SettingsStore::new(Settings::default(), None);
        let snap = store.snapshot();
        assert_eq!(snap.workflow.execute_top_n, 3);
    }
}
