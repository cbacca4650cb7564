//! Pure exit/hold signal evaluation for open positions.
//!
//! The position monitor feeds a snapshot of market state per position into
//! `evaluate`; the result is a deterministic verdict. No I/O happens here,
//! which is what keeps rule evaluation O(1) per position.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SignalStrength {
    Weak,
    Moderate,
    Strong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitSignalKind {
    StopLossHit,
    TakeProfitHit,
    TrailingStopHit,
    RsiOverbought,
    VolumeCollapse,
    MacdBearish,
    MarketClosing,
}

impl ExitSignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitSignalKind::StopLossHit => "stop_loss_hit",
            ExitSignalKind::TakeProfitHit => "take_profit_hit",
            ExitSignalKind::TrailingStopHit => "trailing_stop_hit",
            ExitSignalKind::RsiOverbought => "rsi_overbought",
            ExitSignalKind::VolumeCollapse => "volume_collapse",
            ExitSignalKind::MacdBearish => "macd_bearish",
            ExitSignalKind::MarketClosing => "market_closing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub kind: ExitSignalKind,
    pub strength: SignalStrength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldSignal {
    HealthyProfit,
    RsiHealthy,
    VolumeStrong,
    AboveVwap,
    MacdBullish,
}

impl HoldSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldSignal::HealthyProfit => "healthy_profit",
            HoldSignal::RsiHealthy => "rsi_healthy",
            HoldSignal::VolumeStrong => "volume_strong",
            HoldSignal::AboveVwap => "above_vwap",
            HoldSignal::MacdBullish => "macd_bullish",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
    Hold,
    Exit,
    Review,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Hold => "HOLD",
            Recommendation::Exit => "EXIT",
            Recommendation::Review => "REVIEW",
        }
    }
}

/// Exchange-dependent exit thresholds. Percentages are absolute numbers
/// (5.0 means 5%), ratios are fractions of entry volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorThresholds {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub trail_pct: f64,
    pub rsi_overbought_strong: f64,
    pub rsi_overbought_moderate: f64,
    pub volume_collapse_strong: f64,
    pub volume_collapse_moderate: f64,
    pub volume_strong_ratio: f64,
    pub healthy_profit_max_pct: f64,
    pub rsi_healthy_low: f64,
    pub rsi_healthy_high: f64,
}

impl MonitorThresholds {
    pub fn us_defaults() -> Self {
        Self {
            stop_loss_pct: 5.0,
            take_profit_pct: 10.0,
            trail_pct: 3.0,
            rsi_overbought_strong: 85.0,
            rsi_overbought_moderate: 75.0,
            volume_collapse_strong: 0.25,
            volume_collapse_moderate: 0.40,
            volume_strong_ratio: 1.2,
            healthy_profit_max_pct: 5.0,
            rsi_healthy_low: 40.0,
            rsi_healthy_high: 65.0,
        }
    }

    pub fn intl_defaults() -> Self {
        Self {
            stop_loss_pct: 3.0,
            take_profit_pct: 8.0,
            trail_pct: 2.0,
            ..Self::us_defaults()
        }
    }
}

/// One position's market state at evaluation time. Indicator fields are
/// optional because upstream services degrade independently.
#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub pnl_pct: f64,
    pub last_price: Decimal,
    pub high_watermark: Decimal,
    pub rsi: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub above_vwap: Option<bool>,
    pub in_closing_window: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SignalReport {
    pub hold_signals: Vec<HoldSignal>,
    pub exit_signals: Vec<ExitSignal>,
    pub recommendation: Recommendation,
}

impl Default for Recommendation {
    fn default() -> Self {
        Recommendation::Hold
    }
}

pub fn evaluate(snapshot: &PositionSnapshot, thresholds: &MonitorThresholds) -> SignalReport {
    let mut report = SignalReport::default();

    // Hold side.
    if snapshot.pnl_pct > 0.0 && snapshot.pnl_pct <= thresholds.healthy_profit_max_pct {
        report.hold_signals.push(HoldSignal::HealthyProfit);
    }
    if let Some(rsi) = snapshot.rsi
        && rsi >= thresholds.rsi_healthy_low
        && rsi <= thresholds.rsi_healthy_high
    {
        report.hold_signals.push(HoldSignal::RsiHealthy);
    }
    if let Some(ratio) = snapshot.volume_ratio
        && ratio >= thresholds.volume_strong_ratio
    {
        report.hold_signals.push(HoldSignal::VolumeStrong);
    }
    if snapshot.above_vwap == Some(true) {
        report.hold_signals.push(HoldSignal::AboveVwap);
    }
    if let Some(hist) = snapshot.macd_histogram
        && hist > 0.0
    {
        report.hold_signals.push(HoldSignal::MacdBullish);
    }

    // Exit side. Stop and target thresholds are inclusive.
    if snapshot.pnl_pct <= -thresholds.stop_loss_pct {
        report.exit_signals.push(ExitSignal {
            kind: ExitSignalKind::StopLossHit,
            strength: SignalStrength::Strong,
        });
    }
    if snapshot.pnl_pct >= thresholds.take_profit_pct {
        report.exit_signals.push(ExitSignal {
            kind: ExitSignalKind::TakeProfitHit,
            strength: SignalStrength::Strong,
        });
    }
    if snapshot.high_watermark > Decimal::ZERO {
        let drawdown = ((snapshot.high_watermark - snapshot.last_price)
            / snapshot.high_watermark)
            .to_f64()
            .unwrap_or(0.0);
        if drawdown * 100.0 >= thresholds.trail_pct {
            report.exit_signals.push(ExitSignal {
                kind: ExitSignalKind::TrailingStopHit,
                strength: SignalStrength::Strong,
            });
        }
    }
    if let Some(rsi) = snapshot.rsi {
        if rsi >= thresholds.rsi_overbought_strong {
            report.exit_signals.push(ExitSignal {
                kind: ExitSignalKind::RsiOverbought,
                strength: SignalStrength::Strong,
            });
        } else if rsi >= thresholds.rsi_overbought_moderate {
            report.exit_signals.push(ExitSignal {
                kind: ExitSignalKind::RsiOverbought,
                strength: SignalStrength::Moderate,
            });
        }
    }
    if let Some(ratio) = snapshot.volume_ratio {
        if ratio <= thresholds.volume_collapse_strong {
            report.exit_signals.push(ExitSignal {
                kind: ExitSignalKind::VolumeCollapse,
                strength: SignalStrength::Strong,
            });
        } else if ratio <= thresholds.volume_collapse_moderate {
            report.exit_signals.push(ExitSignal {
                kind: ExitSignalKind::VolumeCollapse,
                strength: SignalStrength::Moderate,
            });
        }
    }
    if let Some(hist) = snapshot.macd_histogram
        && hist < 0.0
    {
        report.exit_signals.push(ExitSignal {
            kind: ExitSignalKind::MacdBearish,
            strength: SignalStrength::Moderate,
        });
    }
    if snapshot.in_closing_window {
        report.exit_signals.push(ExitSignal {
            kind: ExitSignalKind::MarketClosing,
            strength: SignalStrength::Strong,
        });
    }

    report.recommendation = if report
        .exit_signals
        .iter()
        .any(|s| s.strength == SignalStrength::Strong)
    {
        Recommendation::Exit
    } else if report
        .exit_signals
        .iter()
        .any(|s| s.strength == SignalStrength::Moderate)
    {
        Recommendation::Review
    } else {
        Recommendation::Hold
    };

    report
}
