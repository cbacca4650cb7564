//! Prometheus metrics for the trading platform.
//!
//! All metrics use the `catalyst_` prefix. Export is push-based: the
//! reporter task encodes the registry to the log on an interval.

use prometheus::{
    CounterVec, Gauge, Opts, Registry, TextEncoder,
    core::{AtomicF64, GenericGauge},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    /// Trading cycles started
    pub cycles_total: CounterVec,
    /// Orders by purpose and terminal status
    pub orders_total: CounterVec,
    /// Open positions right now
    pub positions_open: GenericGauge<AtomicF64>,
    /// Realized + unrealized P&L of the active cycle in USD
    pub daily_pnl_usd: GenericGauge<AtomicF64>,
    /// Emergency stops triggered
    pub emergency_stops_total: CounterVec,
    /// Watchdog issues by kind and decision
    pub watchdog_issues_total: CounterVec,
    /// Advisor consultations
    pub advisor_calls_total: CounterVec,
    /// Candidates surviving each pipeline stage
    pub stage_candidates: GenericGauge<AtomicF64>,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let cycles_total = CounterVec::new(
            Opts::new("catalyst_cycles_total", "Trading cycles by final state"),
            &["state"],
        )?;
        registry.register(Box::new(cycles_total.clone()))?;

        let orders_total = CounterVec::new(
            Opts::new("catalyst_orders_total", "Orders by purpose and status"),
            &["purpose", "status"],
        )?;
        registry.register(Box::new(orders_total.clone()))?;

        let positions_open = Gauge::with_opts(Opts::new(
            "catalyst_positions_open",
            "Open positions right now",
        ))?;
        registry.register(Box::new(positions_open.clone()))?;

        let daily_pnl_usd = Gauge::with_opts(Opts::new(
            "catalyst_daily_pnl_usd",
            "Active cycle P&L (realized + unrealized) in USD",
        ))?;
        registry.register(Box::new(daily_pnl_usd.clone()))?;

        let emergency_stops_total = CounterVec::new(
            Opts::new("catalyst_emergency_stops_total", "Emergency stops by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(emergency_stops_total.clone()))?;

        let watchdog_issues_total = CounterVec::new(
            Opts::new(
                "catalyst_watchdog_issues_total",
                "Watchdog issues by kind and decision",
            ),
            &["kind", "decision"],
        )?;
        registry.register(Box::new(watchdog_issues_total.clone()))?;

        let advisor_calls_total = CounterVec::new(
            Opts::new("catalyst_advisor_calls_total", "Advisor calls by verdict"),
            &["verdict"],
        )?;
        registry.register(Box::new(advisor_calls_total.clone()))?;

        let stage_candidates = Gauge::with_opts(Opts::new(
            "catalyst_stage_candidates",
            "Candidates surviving the most recent pipeline stage",
        ))?;
        registry.register(Box::new(stage_candidates.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            cycles_total,
            orders_total,
            positions_open,
            daily_pnl_usd,
            emergency_stops_total,
            watchdog_issues_total,
            advisor_calls_total,
            stage_candidates,
        })
    }

    /// Prometheus text exposition of the whole registry.
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        Ok(encoder.encode_to_string(&self.registry.gather())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_encodes() {
        let metrics = Metrics::new().unwrap();
        metrics.positions_open.set(3.0);
        metrics
            .orders_total
            .with_label_values(&["entry", "filled"])
            .inc();

        let text = metrics.encode().unwrap();
        assert!(text.contains("catalyst_positions_open 3"));
        assert!(text.contains("catalyst_orders_total"));
    }
}
