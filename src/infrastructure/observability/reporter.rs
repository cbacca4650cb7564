//! Push-based metrics reporter: refreshes the gauges from the store and
//! writes a `METRICS_JSON:` line to stdout on an interval. No HTTP server,
//! no inbound connections; a log collector picks the lines up.

use crate::infrastructure::observability::Metrics;
use crate::infrastructure::persistence::repositories::{
    SqliteCycleRepository, SqlitePositionRepository,
};
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tokio::time::{Duration, interval};
use tracing::{error, info};
use uuid::Uuid;

pub struct MetricsReporter {
    metrics: Metrics,
    positions: Arc<SqlitePositionRepository>,
    cycles: Arc<SqliteCycleRepository>,
    cycle_id: Uuid,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(
        metrics: Metrics,
        positions: Arc<SqlitePositionRepository>,
        cycles: Arc<SqliteCycleRepository>,
        cycle_id: Uuid,
        interval_secs: u64,
    ) -> Self {
        Self {
            metrics,
            positions,
            cycles,
            cycle_id,
            interval_secs,
        }
    }

    pub async fn run(self) {
        info!(
            "MetricsReporter started (interval: {}s)",
            self.interval_secs
        );
        let mut tick = interval(Duration::from_secs(self.interval_secs.max(1)));
        tick.tick().await;

        loop {
            tick.tick().await;
            if let Err(e) = self.report_once().await {
                error!("MetricsReporter: report failed: {e:#}");
            }
        }
    }

    async fn report_once(&self) -> anyhow::Result<()> {
        let open = self.positions.list_open(Some(self.cycle_id)).await?;
        let (realized, unrealized) = self.positions.aggregate_pnl(self.cycle_id).await?;
        let cycle = self.cycles.get(self.cycle_id).await?;

        self.metrics.positions_open.set(open.len() as f64);
        self.metrics
            .daily_pnl_usd
            .set((realized + unrealized).to_f64().unwrap_or(0.0));

        let snapshot = serde_json::json!({
            "cycle": cycle.id.to_string(),
            "state": cycle.state.as_str(),
            "positions_open": open.len(),
            "trades_executed": cycle.trades_executed,
            "realized_pnl": realized.to_f64(),
            "unrealized_pnl": unrealized.to_f64(),
        });
        println!("METRICS_JSON:{snapshot}");
        Ok(())
    }
}
