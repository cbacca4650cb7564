use crate::domain::audit::RiskEvent;
use crate::domain::ports::AlertSeverity;
use crate::infrastructure::persistence::repositories::{get_json, get_ts, get_uuid, json_text, opt_uuid};
use anyhow::{Result, anyhow};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub struct SqliteRiskEventRepository {
    pool: SqlitePool,
}

impl SqliteRiskEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, event: &RiskEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO risk_events
                (id, cycle_id, position_id, event_type, severity, message, details, resolved, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.cycle_id.map(|u| u.to_string()))
        .bind(event.position_id.map(|u| u.to_string()))
        .bind(&event.event_type)
        .bind(event.severity.as_str())
        .bind(&event.message)
        .bind(json_text(&event.details))
        .bind(event.resolved as i64)
        .bind(event.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_for_cycle(&self, cycle_id: Uuid) -> Result<Vec<RiskEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM risk_events WHERE cycle_id = ? ORDER BY created_at ASC",
        )
        .bind(cycle_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_event).collect()
    }

    pub async fn resolve(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE risk_events SET resolved = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn map_event(row: &SqliteRow) -> Result<RiskEvent> {
    let severity_raw: String = row.try_get("severity")?;
    let severity = match severity_raw.as_str() {
        "INFO" => AlertSeverity::Info,
        "WARNING" => AlertSeverity::Warning,
        "CRITICAL" => AlertSeverity::Critical,
        other => return Err(anyhow!("Unknown severity: {other}")),
    };
    let resolved: i64 = row.try_get("resolved")?;
    Ok(RiskEvent {
        id: get_uuid(row, "id")?,
        cycle_id: opt_uuid(row, "cycle_id")?,
        position_id: opt_uuid(row, "position_id")?,
        event_type: row.try_get("event_type")?,
        severity,
        message: row.try_get("message")?,
        details: get_json(row, "details")?,
        resolved: resolved != 0,
        created_at: get_ts(row, "created_at")?,
    })
}
