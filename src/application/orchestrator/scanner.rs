//! Universe scan: broker assets -> tradable filter -> rate-limit sample ->
//! batched latest bars -> volume sort -> price band -> top N candidates.

use crate::config::Settings;
use crate::domain::clock::Clock;
use crate::domain::ports::{BarSnapshot, BrokerAdapter};
use crate::domain::trading::scoring::ScanResult;
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::{
    SqliteScanResultRepository, SqliteSecurityRepository, SqliteTimeRepository,
};
use anyhow::{Context, Result};
use futures_util::future::join_all;
use rand::seq::index::sample;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const BAR_BATCH: usize = 100;

pub struct UniverseScanner {
    broker: Arc<dyn BrokerAdapter>,
    securities: Arc<SqliteSecurityRepository>,
    scan_results: Arc<SqliteScanResultRepository>,
    times: Arc<SqliteTimeRepository>,
    clock: Arc<dyn Clock>,
}

impl UniverseScanner {
    pub fn new(broker: Arc<dyn BrokerAdapter>, db: &Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            broker,
            securities: Arc::new(SqliteSecurityRepository::new(db.pool.clone())),
            scan_results: Arc::new(SqliteScanResultRepository::new(db.pool.clone())),
            times: Arc::new(SqliteTimeRepository::new(db.pool.clone())),
            clock,
        }
    }

    /// Run one scan for the cycle and persist the candidate rows. A broker
    /// outage propagates as an error; the runner turns that into a cycle in
    /// `error`.
    pub async fn scan(&self, cycle_id: Uuid, settings: &Settings) -> Result<Vec<ScanResult>> {
        let assets = self
            .broker
            .list_assets()
            .await
            .context("Universe scan failed: broker assets unavailable")?;

        let mut symbols: Vec<String> = assets
            .into_iter()
            .filter(|a| a.tradable && a.fractionable && a.shortable)
            .map(|a| a.symbol)
            .collect();
        info!("UniverseScanner: {} tradable symbols", symbols.len());

        // Sample down before the market-data pass to stay inside the
        // request-per-minute ceiling.
        let cap = settings.workflow.universe_sample_cap;
        if symbols.len() > cap {
            let mut rng = rand::rng();
            let picked = sample(&mut rng, symbols.len(), cap);
            symbols = picked.into_iter().map(|i| symbols[i].clone()).collect();
            info!("UniverseScanner: sampled down to {} symbols", cap);
        }

        let batches = join_all(
            symbols
                .chunks(BAR_BATCH)
                .map(|chunk| self.broker.latest_bars(chunk)),
        )
        .await;
        let mut bars: Vec<BarSnapshot> = Vec::with_capacity(symbols.len());
        for batch in batches {
            match batch {
                Ok(batch) => bars.extend(batch),
                Err(e) => {
                    // One bad batch costs its symbols, not the scan.
                    warn!("UniverseScanner: bar batch failed: {e}");
                }
            }
        }
        if bars.is_empty() {
            anyhow::bail!("Universe scan produced no bars");
        }

        bars.sort_by(|a, b| b.volume.cmp(&a.volume));

        let min_price = settings.workflow.min_price;
        let max_price = settings.workflow.max_price;
        let scan_ts = self.clock.now();
        let phase = self.clock.phase();
        let in_market = self.clock.in_market_hours();

        let mut results = Vec::new();
        for bar in bars
            .into_iter()
            .filter(|b| b.close >= min_price && b.close <= max_price)
            .take(settings.workflow.initial_universe_size)
        {
            let security_id = self.securities.get_or_create(&bar.symbol).await?;
            let mut result =
                ScanResult::new(cycle_id, security_id, &bar.symbol, scan_ts, bar.close, bar.volume);

            result.gap_pct = gap_pct(&bar);
            result.rel_volume = rel_volume(&bar);
            result.scores.momentum = momentum_score(result.gap_pct);
            result.scores.volume = volume_score(result.rel_volume);
            result.finalize_composite();

            let time_id = self.times.get_or_create(scan_ts, phase, in_market).await?;
            self.scan_results.insert(&result, time_id).await?;
            results.push(result);
        }

        info!(
            "UniverseScanner: {} candidates persisted for cycle {}",
            results.len(),
            cycle_id
        );
        Ok(results)
    }
}

fn gap_pct(bar: &BarSnapshot) -> f64 {
    match bar.prev_close {
        Some(prev) if !prev.is_zero() => ((bar.open - prev) / prev)
            .to_f64()
            .unwrap_or(0.0)
            * 100.0,
        _ => 0.0,
    }
}

fn rel_volume(bar: &BarSnapshot) -> f64 {
    match bar.avg_volume {
        Some(avg) if !avg.is_zero() => (bar.volume / avg).to_f64().unwrap_or(1.0),
        _ => 1.0,
    }
}

/// Gap of +10% or better saturates the momentum component; gaps down score
/// zero for this long-biased scan.
pub(crate) fn momentum_score(gap_pct: f64) -> f64 {
    (gap_pct / 10.0).clamp(0.0, 1.0)
}

/// Relative volume of 3x or better saturates the volume component.
pub(crate) fn volume_score(rel_volume: f64) -> f64 {
    (rel_volume / 3.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::{FixedClock, SessionSpec};
    use crate::domain::ports::AssetInfo;
    use crate::domain::trading::cycle::{CycleMode, TradingCycle};
    use crate::infrastructure::mock::MockBroker;
    use crate::infrastructure::persistence::repositories::SqliteCycleRepository;
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn asset(symbol: &str, tradable: bool) -> AssetInfo {
        AssetInfo {
            symbol: symbol.to_string(),
            exchange: "NASDAQ".to_string(),
            tradable,
            fractionable: true,
            shortable: true,
        }
    }

    fn bar(symbol: &str, close: Decimal, volume: Decimal) -> BarSnapshot {
        BarSnapshot {
            symbol: symbol.to_string(),
            open: close,
            close,
            prev_close: Some(close * dec!(0.95)),
            volume,
            avg_volume: Some(volume / dec!(2)),
            ts: Utc::now(),
        }
    }

    fn market_clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::at(
            Utc.with_ymd_and_hms(2025, 3, 10, 15, 0, 0).unwrap(),
            SessionSpec::us_equities(),
        ))
    }

    async fn seed_cycle(db: &Database) -> Uuid {
        let cycles = SqliteCycleRepository::new(db.pool.clone());
        let cycle = TradingCycle::new(
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            CycleMode::Paper,
            serde_json::Value::Null,
        );
        cycles.create(&cycle).await.unwrap();
        cycle.id
    }

    #[tokio::test]
    async fn scan_filters_sorts_and_persists() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let broker = Arc::new(MockBroker::new());
        broker.set_assets(vec![
            asset("AAPL", true),
            asset("MSFT", true),
            asset("HALT", false), // not tradable
            asset("PENY", true),
        ]);
        broker.set_bars(vec![
            bar("AAPL", dec!(150), dec!(2000000)),
            bar("MSFT", dec!(300), dec!(5000000)),
            bar("PENY", dec!(0.40), dec!(9000000)), // below the price band
        ]);

        let cycle_id = seed_cycle(&db).await;
        let scanner = UniverseScanner::new(broker, &db, market_clock());
        let results = scanner.scan(cycle_id, &Settings::default()).await.unwrap();

        let symbols: Vec<&str> = results.iter().map(|r| r.symbol.as_str()).collect();
        // Volume order, penny stock and non-tradable excluded.
        assert_eq!(symbols, vec!["MSFT", "AAPL"]);
        assert!(results[0].rel_volume > 1.9);
        assert!(results[0].gap_pct > 5.0);
    }

    #[tokio::test]
    async fn broker_outage_fails_the_scan() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let broker = Arc::new(MockBroker::new());
        broker.set_broker_down(true);
        let cycle_id = seed_cycle(&db).await;

        let scanner = UniverseScanner::new(broker, &db, market_clock());
        assert!(scanner.scan(cycle_id, &Settings::default()).await.is_err());
    }

    #[test]
    fn component_score_clamps() {
        assert_eq!(momentum_score(10.0), 1.0);
        assert_eq!(momentum_score(5.0), 0.5);
        assert_eq!(momentum_score(-4.0), 0.0);
        assert_eq!(volume_score(3.0), 1.0);
        assert_eq!(volume_score(1.5), 0.5);
        assert_eq!(volume_score(0.0), 0.0);
    }
}
