//! Rolling per-symbol indicator state fed by the monitor's quote samples.
//! RSI and MACD come from the `ta` crate; session VWAP is accumulated from
//! the daily volume deltas between samples.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::sync::Mutex;
use ta::Next;
use ta::indicators::{MovingAverageConvergenceDivergence, RelativeStrengthIndex};

const RSI_PERIOD: usize = 14;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;

#[derive(Debug, Clone, Copy, Default)]
pub struct IndicatorSnapshot {
    pub rsi: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub vwap: Option<f64>,
    pub above_vwap: Option<bool>,
}

struct SymbolTracker {
    rsi: RelativeStrengthIndex,
    macd: MovingAverageConvergenceDivergence,
    samples: usize,
    cumulative_pv: f64,
    cumulative_volume: f64,
    last_session_volume: f64,
}

impl SymbolTracker {
    fn new() -> Self {
        Self {
            rsi: RelativeStrengthIndex::new(RSI_PERIOD).expect("valid RSI period"),
            macd: MovingAverageConvergenceDivergence::new(MACD_FAST, MACD_SLOW, MACD_SIGNAL)
                .expect("valid MACD periods"),
            samples: 0,
            cumulative_pv: 0.0,
            cumulative_volume: 0.0,
            last_session_volume: 0.0,
        }
    }

    fn observe(&mut self, price: f64, session_volume: f64) -> IndicatorSnapshot {
        self.samples += 1;
        let rsi = self.rsi.next(price);
        let macd = self.macd.next(price);

        // Volume traded since the previous sample, weighted at this price.
        // A session rollover (volume decreasing) restarts the accumulation.
        let delta = session_volume - self.last_session_volume;
        if delta < 0.0 {
            self.cumulative_pv = 0.0;
            self.cumulative_volume = 0.0;
        }
        let delta = delta.max(0.0);
        self.cumulative_pv += price * delta;
        self.cumulative_volume += delta;
        self.last_session_volume = session_volume;

        let vwap = if self.cumulative_volume > 0.0 {
            Some(self.cumulative_pv / self.cumulative_volume)
        } else {
            None
        };

        IndicatorSnapshot {
            // Indicators stay silent until warm; a half-warm RSI generates
            // false overbought exits.
            rsi: (self.samples >= RSI_PERIOD).then_some(rsi),
            macd_histogram: (self.samples >= MACD_SLOW).then_some(macd.histogram),
            vwap,
            above_vwap: vwap.map(|v| price > v),
        }
    }
}

#[derive(Default)]
pub struct IndicatorService {
    trackers: Mutex<HashMap<String, SymbolTracker>>,
}

impl IndicatorService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(
        &self,
        symbol: &str,
        price: Decimal,
        session_volume: Option<Decimal>,
    ) -> IndicatorSnapshot {
        let price = price.to_f64().unwrap_or(0.0);
        if price <= 0.0 {
            return IndicatorSnapshot::default();
        }
        let volume = session_volume.and_then(|v| v.to_f64()).unwrap_or(0.0);

        let mut trackers = self.trackers.lock().expect("indicator lock poisoned");
        trackers
            .entry(symbol.to_uppercase())
            .or_insert_with(SymbolTracker::new)
            .observe(price, volume)
    }

    /// Drop a symbol's state once its position closes.
    pub fn forget(&self, symbol: &str) {
        self.trackers
            .lock()
            .expect("indicator lock poisoned")
            .remove(&symbol.to_uppercase());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn indicators_warm_up_before_reporting() {
        let service = IndicatorService::new();
        let mut snapshot = IndicatorSnapshot::default();
        for i in 0..13 {
            snapshot = service.observe("AAPL", dec!(100) + Decimal::from(i), Some(dec!(1000)));
        }
        assert!(snapshot.rsi.is_none());

        snapshot = service.observe("AAPL", dec!(113), Some(dec!(1000)));
        assert!(snapshot.rsi.is_some());
        // Monotone rises push RSI toward the top of the range.
        assert!(snapshot.rsi.unwrap() > 70.0);
        assert!(snapshot.macd_histogram.is_none());

        for i in 0..12 {
            snapshot = service.observe("AAPL", dec!(114) + Decimal::from(i), Some(dec!(1000)));
        }
        assert!(snapshot.macd_histogram.is_some());
    }

    #[test]
    fn vwap_tracks_volume_weighted_price() {
        let service = IndicatorService::new();
        // 1000 shares at 100, then 1000 more at 110: VWAP 105.
        service.observe("MSFT", dec!(100), Some(dec!(1000)));
        let snapshot = service.observe("MSFT", dec!(110), Some(dec!(2000)));
        let vwap = snapshot.vwap.unwrap();
        assert!((vwap - 105.0).abs() < 1e-9);
        assert_eq!(snapshot.above_vwap, Some(true));

        let below = service.observe("MSFT", dec!(100), Some(dec!(2100)));
        assert_eq!(below.above_vwap, Some(false));
    }

    #[test]
    fn session_rollover_resets_vwap() {
        let service = IndicatorService::new();
        service.observe("NVDA", dec!(100), Some(dec!(5000)));
        // New session: cumulative volume goes down.
        let snapshot = service.observe("NVDA", dec!(200), Some(dec!(100)));
        // VWAP restarted; nothing accumulated yet this session after reset.
        assert!(snapshot.vwap.is_none() || snapshot.vwap.unwrap() >= 100.0);
    }

    #[test]
    fn forget_clears_state() {
        let service = IndicatorService::new();
        for _ in 0..20 {
            service.observe("TSLA", dec!(100), Some(dec!(1000)));
        }
        service.forget("TSLA");
        let snapshot = service.observe("TSLA", dec!(100), Some(dec!(1000)));
        assert!(snapshot.rsi.is_none());
    }
}
