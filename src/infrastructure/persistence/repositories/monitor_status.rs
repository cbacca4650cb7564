use crate::domain::monitoring::signals::Recommendation;
use crate::domain::monitoring::status::{MonitorRunState, MonitorStatus};
use crate::infrastructure::persistence::repositories::{get_ts, get_uuid, opt_decimal};
use anyhow::{Result, anyhow};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub struct SqliteMonitorStatusRepository {
    pool: SqlitePool,
}

impl SqliteMonitorStatusRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, status: &MonitorStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO position_monitor_status
                (position_id, symbol, status, last_price, high_watermark, pnl_pct,
                 rsi, macd_histogram, vwap_position, hold_signals, exit_signals,
                 recommendation, advisor_calls, estimated_cost, last_checkin, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(position_id) DO UPDATE SET
                status = excluded.status,
                last_price = excluded.last_price,
                high_watermark = excluded.high_watermark,
                pnl_pct = excluded.pnl_pct,
                rsi = excluded.rsi,
                macd_histogram = excluded.macd_histogram,
                vwap_position = excluded.vwap_position,
                hold_signals = excluded.hold_signals,
                exit_signals = excluded.exit_signals,
                recommendation = excluded.recommendation,
                advisor_calls = excluded.advisor_calls,
                estimated_cost = excluded.estimated_cost,
                last_checkin = excluded.last_checkin,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(status.position_id.to_string())
        .bind(&status.symbol)
        .bind(status.state.as_str())
        .bind(status.last_price.map(|p| p.to_string()))
        .bind(status.high_watermark.map(|p| p.to_string()))
        .bind(status.pnl_pct)
        .bind(status.rsi)
        .bind(status.macd_histogram)
        .bind(status.vwap_position.as_deref())
        .bind(serde_json::to_string(&status.hold_signals)?)
        .bind(serde_json::to_string(&status.exit_signals)?)
        .bind(status.recommendation.as_str())
        .bind(status.advisor_calls)
        .bind(status.estimated_cost)
        .bind(status.last_checkin.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, position_id: Uuid) -> Result<Option<MonitorStatus>> {
        let row = sqlx::query("SELECT * FROM position_monitor_status WHERE position_id = ?")
            .bind(position_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_status(&r)).transpose()
    }

    pub async fn set_state(&self, position_id: Uuid, state: MonitorRunState) -> Result<()> {
        sqlx::query(
            "UPDATE position_monitor_status SET status = ?, updated_at = ? WHERE position_id = ?",
        )
        .bind(state.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(position_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn map_status(row: &SqliteRow) -> Result<MonitorStatus> {
    let state_raw: String = row.try_get("status")?;
    let rec_raw: String = row.try_get("recommendation")?;
    let hold_raw: String = row.try_get("hold_signals")?;
    let exit_raw: String = row.try_get("exit_signals")?;
    let recommendation = match rec_raw.as_str() {
        "HOLD" => Recommendation::Hold,
        "EXIT" => Recommendation::Exit,
        "REVIEW" => Recommendation::Review,
        other => return Err(anyhow!("Unknown recommendation: {other}")),
    };
    Ok(MonitorStatus {
        position_id: get_uuid(row, "position_id")?,
        symbol: row.try_get("symbol")?,
        state: MonitorRunState::parse(&state_raw)
            .ok_or_else(|| anyhow!("Unknown monitor state: {state_raw}"))?,
        last_price: opt_decimal(row, "last_price")?,
        high_watermark: opt_decimal(row, "high_watermark")?,
        pnl_pct: row.try_get("pnl_pct")?,
        rsi: row.try_get("rsi")?,
        macd_histogram: row.try_get("macd_histogram")?,
        vwap_position: row.try_get("vwap_position")?,
        hold_signals: serde_json::from_str(&hold_raw)?,
        exit_signals: serde_json::from_str(&exit_raw)?,
        recommendation,
        advisor_calls: row.try_get("advisor_calls")?,
        estimated_cost: row.try_get("estimated_cost")?,
        last_checkin: get_ts(row, "last_checkin")?,
    })
}
