use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const CATALYST_WEIGHT: f64 = 0.30;
const TECHNICAL_WEIGHT: f64 = 0.30;
const MOMENTUM_WEIGHT: f64 = 0.20;
const VOLUME_WEIGHT: f64 = 0.20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStatus {
    Candidate,
    Selected,
    Rejected,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Candidate => "candidate",
            ScanStatus::Selected => "selected",
            ScanStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "candidate" => Some(ScanStatus::Candidate),
            "selected" => Some(ScanStatus::Selected),
            "rejected" => Some(ScanStatus::Rejected),
            _ => None,
        }
    }
}

/// Per-candidate component scores, all in [0, 1]. The pattern score is kept
/// on the row for analysis but does not enter the composite directly; the
/// pattern stage gates candidates instead.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ComponentScores {
    pub catalyst: f64,
    pub pattern: f64,
    pub technical: f64,
    pub momentum: f64,
    pub volume: f64,
}

impl ComponentScores {
    pub fn composite(&self) -> f64 {
        CATALYST_WEIGHT * self.catalyst
            + TECHNICAL_WEIGHT * self.technical
            + MOMENTUM_WEIGHT * self.momentum
            + VOLUME_WEIGHT * self.volume
    }
}

/// A scored scan row for one (cycle, security, scan_ts). Immutable once the
/// scan completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub id: Uuid,
    pub cycle_id: Uuid,
    pub security_id: i64,
    pub symbol: String,
    pub scan_ts: DateTime<Utc>,
    pub rank: i64,
    pub price: Decimal,
    pub volume: Decimal,
    pub gap_pct: f64,
    pub rel_volume: f64,
    pub float_shares: Option<i64>,
    pub scores: ComponentScores,
    pub composite_score: f64,
    pub status: ScanStatus,
    pub metadata: serde_json::Value,
}

impl ScanResult {
    pub fn new(
        cycle_id: Uuid,
        security_id: i64,
        symbol: &str,
        scan_ts: DateTime<Utc>,
        price: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cycle_id,
            security_id,
            symbol: symbol.to_uppercase(),
            scan_ts,
            rank: 0,
            price,
            volume,
            gap_pct: 0.0,
            rel_volume: 1.0,
            float_shares: None,
            scores: ComponentScores::default(),
            composite_score: 0.0,
            status: ScanStatus::Candidate,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn finalize_composite(&mut self) {
        self.composite_score = self.scores.composite();
    }
}

/// Sort candidates by composite descending; ties break toward higher
/// relative volume, then toward the cheaper symbol. Ranks are re-stamped
/// 1-based after the sort.
pub fn rank_candidates(candidates: &mut [ScanResult]) {
    candidates.sort_by(|a, b| {
        b.composite_score
            .partial_cmp(&a.composite_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.rel_volume
                    .partial_cmp(&a.rel_volume)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.price.cmp(&b.price))
    });
    for (idx, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank = (idx + 1) as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candidate(symbol: &str, price: Decimal) -> ScanResult {
        ScanResult::new(Uuid::new_v4(), 1, symbol, Utc::now(), price, dec!(1000000))
    }

    #[test]
    fn composite_weighting() {
        let scores = ComponentScores {
            catalyst: 1.0,
            pattern: 0.0,
            technical: 0.5,
            momentum: 0.5,
            volume: 0.25,
        };
        let expected = 0.30 * 1.0 + 0.30 * 0.5 + 0.20 * 0.5 + 0.20 * 0.25;
        assert!((scores.composite() - expected).abs() < 1e-12);
    }

    #[test]
    fn pattern_score_does_not_enter_composite() {
        let mut a = ComponentScores::default();
        let b = ComponentScores {
            pattern: 1.0,
            ..Default::default()
        };
        a.pattern = 0.0;
        assert_eq!(a.composite(), b.composite());
    }

    #[test]
    fn tie_breaks_by_rel_volume_then_price() {
        let mut a = candidate("AAA", dec!(20));
        let mut b = candidate("BBB", dec!(10));
        let mut c = candidate("CCC", dec!(10));
        for r in [&mut a, &mut b, &mut c] {
            r.composite_score = 0.8;
        }
        a.rel_volume = 1.0;
        b.rel_volume = 2.0;
        c.rel_volume = 1.0;

        let mut all = vec![a, b, c];
        rank_candidates(&mut all);

        assert_eq!(all[0].symbol, "BBB"); // highest rel volume
        assert_eq!(all[1].symbol, "CCC"); // same rel volume as AAA, lower price
        assert_eq!(all[2].symbol, "AAA");
        assert_eq!(all[0].rank, 1);
        assert_eq!(all[2].rank, 3);
    }
}
