use crate::domain::trading::scoring::{ComponentScores, ScanResult, ScanStatus};
use crate::infrastructure::persistence::repositories::{
    get_decimal, get_json, get_ts, get_uuid, json_text,
};
use anyhow::{Result, anyhow};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub struct SqliteScanResultRepository {
    pool: SqlitePool,
}

impl SqliteScanResultRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a scan row against the (security, time) fact grain. A repeat
    /// observation of the same grain is ignored, never duplicated.
    pub async fn insert(&self, result: &ScanResult, time_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_results
                (id, cycle_id, security_id, time_id, scan_ts, rank, price, volume,
                 gap_pct, rel_volume, float_shares,
                 catalyst_score, pattern_score, technical_score,
                 momentum_score, volume_score, composite_score, status, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(security_id, time_id) DO NOTHING
            "#,
        )
        .bind(result.id.to_string())
        .bind(result.cycle_id.to_string())
        .bind(result.security_id)
        .bind(time_id)
        .bind(result.scan_ts.to_rfc3339())
        .bind(result.rank)
        .bind(result.price.to_string())
        .bind(result.volume.to_string())
        .bind(result.gap_pct)
        .bind(result.rel_volume)
        .bind(result.float_shares)
        .bind(result.scores.catalyst)
        .bind(result.scores.pattern)
        .bind(result.scores.technical)
        .bind(result.scores.momentum)
        .bind(result.scores.volume)
        .bind(result.composite_score)
        .bind(result.status.as_str())
        .bind(json_text(&result.metadata))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_scores(&self, result: &ScanResult) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scan_results SET
                rank = ?, gap_pct = ?, rel_volume = ?,
                catalyst_score = ?, pattern_score = ?, technical_score = ?,
                momentum_score = ?, volume_score = ?, composite_score = ?, status = ?
            WHERE id = ?
            "#,
        )
        .bind(result.rank)
        .bind(result.gap_pct)
        .bind(result.rel_volume)
        .bind(result.scores.catalyst)
        .bind(result.scores.pattern)
        .bind(result.scores.technical)
        .bind(result.scores.momentum)
        .bind(result.scores.volume)
        .bind(result.composite_score)
        .bind(result.status.as_str())
        .bind(result.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_for_cycle(&self, cycle_id: Uuid) -> Result<Vec<ScanResult>> {
        let rows = sqlx::query(
            "SELECT s.*, sec.symbol AS symbol FROM scan_results s \
             JOIN securities sec ON sec.id = s.security_id \
             WHERE s.cycle_id = ? ORDER BY s.rank ASC",
        )
        .bind(cycle_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_scan_result).collect()
    }
}

fn map_scan_result(row: &SqliteRow) -> Result<ScanResult> {
    let status_raw: String = row.try_get("status")?;
    Ok(ScanResult {
        id: get_uuid(row, "id")?,
        cycle_id: get_uuid(row, "cycle_id")?,
        security_id: row.try_get("security_id")?,
        symbol: row.try_get("symbol")?,
        scan_ts: get_ts(row, "scan_ts")?,
        rank: row.try_get("rank")?,
        price: get_decimal(row, "price")?,
        volume: get_decimal(row, "volume")?,
        gap_pct: row.try_get("gap_pct")?,
        rel_volume: row.try_get("rel_volume")?,
        float_shares: row.try_get("float_shares")?,
        scores: ComponentScores {
            catalyst: row.try_get("catalyst_score")?,
            pattern: row.try_get("pattern_score")?,
            technical: row.try_get("technical_score")?,
            momentum: row.try_get("momentum_score")?,
            volume: row.try_get("volume_score")?,
        },
        composite_score: row.try_get("composite_score")?,
        status: ScanStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("Unknown scan status: {status_raw}"))?,
        metadata: get_json(row, "metadata")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::MarketPhase;
    use crate::domain::trading::cycle::{CycleMode, TradingCycle};
    use crate::infrastructure::persistence::database::Database;
    use crate::infrastructure::persistence::repositories::{
        SqliteCycleRepository, SqliteSecurityRepository, SqliteTimeRepository,
    };
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn fact_grain_is_unique() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let cycles = SqliteCycleRepository::new(db.pool.clone());
        let securities = SqliteSecurityRepository::new(db.pool.clone());
        let times = SqliteTimeRepository::new(db.pool.clone());
        let repo = SqliteScanResultRepository::new(db.pool.clone());

        let cycle = TradingCycle::new(
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            CycleMode::Paper,
            serde_json::Value::Null,
        );
        cycles.create(&cycle).await.unwrap();
        let security_id = securities.get_or_create("AAPL").await.unwrap();
        let ts = Utc::now();
        let time_id = times.get_or_create(ts, MarketPhase::Open, true).await.unwrap();

        let mut result = ScanResult::new(cycle.id, security_id, "AAPL", ts, dec!(150), dec!(2000000));
        result.scores.catalyst = 0.75;
        result.finalize_composite();
        repo.insert(&result, time_id).await.unwrap();

        // Same grain again: ignored.
        let duplicate = ScanResult::new(cycle.id, security_id, "AAPL", ts, dec!(151), dec!(1));
        repo.insert(&duplicate, time_id).await.unwrap();

        let all = repo.list_for_cycle(cycle.id).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].price, dec!(150));
        assert_eq!(all[0].scores.catalyst, 0.75);
    }
}
