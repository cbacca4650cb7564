//! Catalyst/pattern/technical filter stages and the graceful-degradation
//! policy that decides what a missing signal means for a candidate.

use crate::config::StagePolicy;
use crate::domain::ports::NewsService;
use crate::domain::trading::scoring::{ScanResult, ScanStatus};
use crate::infrastructure::news::sentiment::SentimentAnalyzer;
use chrono::Duration;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::{info, warn};

/// Stage evaluation for one candidate: a usable score, or no usable signal
/// (service down, empty response).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageEval {
    Score(f64),
    NoSignal,
}

/// Survivors continue down the pipeline; rejected rows go back to the store
/// with their final status.
pub struct StageOutcome {
    pub survivors: Vec<ScanResult>,
    pub rejected: Vec<ScanResult>,
    pub degraded: usize,
}

/// The core graceful-degradation contract: an optional stage without signal
/// hands out the fallback score and lets the candidate through; a required
/// stage without signal drops it. Candidates below the threshold are
/// rejected either way.
pub fn apply_stage_policy(
    stage_name: &str,
    candidates: Vec<ScanResult>,
    evals: Vec<StageEval>,
    policy: &StagePolicy,
    mut set_score: impl FnMut(&mut ScanResult, f64),
) -> StageOutcome {
    debug_assert_eq!(candidates.len(), evals.len());
    let mut survivors = Vec::with_capacity(candidates.len());
    let mut rejected = Vec::new();
    let mut degraded = 0usize;

    for (mut candidate, eval) in candidates.into_iter().zip(evals) {
        let score = match eval {
            StageEval::Score(score) => score,
            StageEval::NoSignal if policy.required => {
                candidate.status = ScanStatus::Rejected;
                rejected.push(candidate);
                continue;
            }
            StageEval::NoSignal => {
                degraded += 1;
                policy.fallback_score
            }
        };

        set_score(&mut candidate, score);
        if score < policy.threshold {
            candidate.status = ScanStatus::Rejected;
            rejected.push(candidate);
            continue;
        }
        candidate.finalize_composite();
        survivors.push(candidate);
    }

    if degraded > 0 {
        warn!(
            "Stage {stage_name}: DEGRADED MODE - {degraded} candidates carried fallback score {}",
            policy.fallback_score
        );
    }
    info!(
        "Stage {stage_name}: {} survived, {} dropped",
        survivors.len(),
        rejected.len()
    );
    StageOutcome {
        survivors,
        rejected,
        degraded,
    }
}

/// News/catalyst stage: recent headline sentiment via the news port.
pub struct NewsStage {
    news: Arc<dyn NewsService>,
    analyzer: SentimentAnalyzer,
    lookback: Duration,
}

impl NewsStage {
    pub fn new(news: Arc<dyn NewsService>, lookback: Duration) -> Self {
        Self {
            news,
            analyzer: SentimentAnalyzer::new(),
            lookback,
        }
    }

    pub async fn evaluate(&self, candidate: &ScanResult) -> StageEval {
        let since = candidate.scan_ts - self.lookback;
        match self.news.headlines_for(&candidate.symbol, since).await {
            Ok(headlines) if headlines.is_empty() => StageEval::NoSignal,
            Ok(headlines) => {
                let mut best: f64 = -1.0;
                for headline in &headlines {
                    let sentiment = self.analyzer.analyze_headline(&headline.title, &headline.summary);
                    best = best.max(sentiment);
                }
                StageEval::Score(SentimentAnalyzer::to_stage_score(best))
            }
            Err(e) => {
                warn!(
                    "NewsStage: no signal for {} ({e:#})",
                    candidate.symbol
                );
                StageEval::NoSignal
            }
        }
    }
}

/// Pattern stage: deterministic day-trade setups from the scan metrics.
/// Always has signal; it needs nothing beyond the scan row.
pub struct PatternStage;

impl PatternStage {
    pub fn evaluate(&self, candidate: &ScanResult) -> (StageEval, Option<&'static str>) {
        let gap = candidate.gap_pct;
        let rel = candidate.rel_volume;

        let (score, label) = if gap >= 4.0 && rel >= 2.0 {
            (0.9, Some("gap_and_go"))
        } else if gap >= 2.0 && rel >= 1.5 {
            (0.7, Some("momentum_breakout"))
        } else if rel >= 2.5 {
            (0.6, Some("volume_surge"))
        } else if gap <= -3.0 && rel >= 2.0 {
            (0.5, Some("capitulation_reversal"))
        } else {
            (0.2, None)
        };
        (StageEval::Score(score), label)
    }
}

/// Technical stage: intraday strength from the latest bar. Richer indicator
/// work belongs to the position monitor; entry filtering only needs to know
/// whether buyers are in control.
pub struct TechnicalStage;

impl TechnicalStage {
    pub fn evaluate(&self, candidate: &ScanResult) -> StageEval {
        let Some(price) = candidate.price.to_f64() else {
            return StageEval::NoSignal;
        };
        if price <= 0.0 {
            return StageEval::NoSignal;
        }

        // Blend of gap persistence and participation. A fading gap (strong
        // open, weak tape) scores poorly even with headline volume.
        let gap_component = (candidate.gap_pct / 8.0).clamp(-1.0, 1.0);
        let participation = (candidate.rel_volume / 2.0).clamp(0.0, 1.5);
        let raw = 0.5 + 0.3 * gap_component + 0.2 * (participation - 0.5);
        StageEval::Score(raw.clamp(0.0, 1.0))
    }
}
