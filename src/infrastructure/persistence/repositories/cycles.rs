use crate::domain::trading::cycle::{CycleMode, CycleState, TradingCycle};
use crate::infrastructure::persistence::repositories::{get_decimal, get_json, get_uuid, get_ts, json_text, opt_ts};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub struct SqliteCycleRepository {
    pool: SqlitePool,
}

impl SqliteCycleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new cycle. The unique date index enforces one cycle per date;
    /// a second insert for the same date is an error, not an upsert.
    pub async fn create(&self, cycle: &TradingCycle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trading_cycles
                (id, date, state, mode, configuration, started_at, stopped_at,
                 trades_executed, trades_won, trades_lost, daily_pnl, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(cycle.id.to_string())
        .bind(cycle.date.to_string())
        .bind(cycle.state.as_str())
        .bind(cycle.mode.as_str())
        .bind(json_text(&cycle.configuration))
        .bind(cycle.started_at.map(|t| t.to_rfc3339()))
        .bind(cycle.stopped_at.map(|t| t.to_rfc3339()))
        .bind(cycle.trades_executed)
        .bind(cycle.trades_won)
        .bind(cycle.trades_lost)
        .bind(cycle.daily_pnl.to_string())
        .bind(cycle.created_at.to_rfc3339())
        .bind(cycle.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to insert trading cycle (one open cycle per date)")?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<TradingCycle> {
        let row = sqlx::query("SELECT * FROM trading_cycles WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow!("Trading cycle not found: {id}"))?;
        map_cycle(&row)
    }

    pub async fn find_by_date(&self, date: NaiveDate) -> Result<Option<TradingCycle>> {
        let row = sqlx::query("SELECT * FROM trading_cycles WHERE date = ?")
            .bind(date.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_cycle(&r)).transpose()
    }

    pub async fn set_state(&self, id: Uuid, state: CycleState, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trading_cycles
            SET state = ?,
                started_at = COALESCE(started_at, ?),
                stopped_at = CASE WHEN ? THEN ? ELSE stopped_at END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(now.to_rfc3339())
        .bind(state.is_terminal())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomic emergency-stop flip. Returns true for the caller that actually
    /// transitioned the row; repeated invocations coalesce on false.
    pub async fn try_stop(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE trading_cycles
            SET state = 'stopped', stopped_at = ?, updated_at = ?
            WHERE id = ? AND state NOT IN ('stopped', 'closed', 'error')
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn record_trade_executed(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE trading_cycles SET trades_executed = trades_executed + 1, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fold a closed trade into the day's aggregates.
    pub async fn record_trade_closed(&self, id: Uuid, won: bool, pnl_delta: Decimal) -> Result<()> {
        let cycle = self.get(id).await?;
        sqlx::query(
            r#"
            UPDATE trading_cycles
            SET trades_won = trades_won + ?,
                trades_lost = trades_lost + ?,
                daily_pnl = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(if won { 1 } else { 0 })
        .bind(if won { 0 } else { 1 })
        .bind((cycle.daily_pnl + pnl_delta).to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cycles that have gone quiet: non-terminal and untouched since the
    /// cutoff. Input to the watchdog's stale-cycle check.
    pub async fn stale_cycles(&self, cutoff: DateTime<Utc>) -> Result<Vec<TradingCycle>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM trading_cycles
            WHERE state NOT IN ('closed', 'stopped', 'error') AND updated_at < ?
            "#,
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_cycle).collect()
    }
}

fn map_cycle(row: &SqliteRow) -> Result<TradingCycle> {
    let state_raw: String = row.try_get("state")?;
    let mode_raw: String = row.try_get("mode")?;
    let date_raw: String = row.try_get("date")?;
    Ok(TradingCycle {
        id: get_uuid(row, "id")?,
        date: date_raw
            .parse::<NaiveDate>()
            .with_context(|| format!("Bad cycle date: {date_raw}"))?,
        state: CycleState::parse(&state_raw)
            .ok_or_else(|| anyhow!("Unknown cycle state: {state_raw}"))?,
        mode: CycleMode::parse(&mode_raw)
            .ok_or_else(|| anyhow!("Unknown cycle mode: {mode_raw}"))?,
        configuration: get_json(row, "configuration")?,
        started_at: opt_ts(row, "started_at")?,
        stopped_at: opt_ts(row, "stopped_at")?,
        trades_executed: row.try_get("trades_executed")?,
        trades_won: row.try_get("trades_won")?,
        trades_lost: row.try_get("trades_lost")?,
        daily_pnl: get_decimal(row, "daily_pnl")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}
