use crate::domain::clock::MarketPhase;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use sqlx::{Row, SqlitePool};

pub struct SqliteTimeRepository {
    pool: SqlitePool,
}

impl SqliteTimeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Return the surrogate id for a timestamp, inserting the dimension row
    /// on first observation. Concurrent callers are resolved by the unique
    /// `ts` constraint and the read-back.
    pub async fn get_or_create(
        &self,
        ts: DateTime<Utc>,
        phase: MarketPhase,
        market_hours: bool,
    ) -> Result<i64> {
        let key = ts.to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO time_dimension
                (ts, date, time, hour, minute, dow, market_hours, market_phase)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(ts) DO NOTHING
            "#,
        )
        .bind(&key)
        .bind(ts.date_naive().to_string())
        .bind(ts.time().format("%H:%M:%S").to_string())
        .bind(ts.hour() as i64)
        .bind(ts.minute() as i64)
        .bind(ts.weekday().num_days_from_monday() as i64)
        .bind(market_hours as i64)
        .bind(phase.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to insert time dimension row")?;

        let row = sqlx::query("SELECT id FROM time_dimension WHERE ts = ?")
            .bind(&key)
            .fetch_one(&self.pool)
            .await
            .context("Failed to read back time id")?;

        Ok(row.try_get("id")?)
    }
}
