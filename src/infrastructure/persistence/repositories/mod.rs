pub mod cycles;
pub mod monitor_status;
pub mod orders;
pub mod positions;
pub mod risk_events;
pub mod scan_results;
pub mod securities;
pub mod time_dimension;
pub mod watchdog;

pub use cycles::SqliteCycleRepository;
pub use monitor_status::SqliteMonitorStatusRepository;
pub use orders::SqliteOrderRepository;
pub use positions::SqlitePositionRepository;
pub use risk_events::SqliteRiskEventRepository;
pub use scan_results::SqliteScanResultRepository;
pub use securities::SqliteSecurityRepository;
pub use time_dimension::SqliteTimeRepository;
pub use watchdog::SqliteWatchdogRepository;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::str::FromStr;
use uuid::Uuid;

// Row-mapping helpers shared by the repositories. Money and ids are stored
// as TEXT; timestamps as RFC3339 TEXT.

pub(crate) fn get_decimal(row: &SqliteRow, col: &str) -> Result<Decimal> {
    let raw: String = row.try_get(col)?;
    Decimal::from_str(&raw).with_context(|| format!("Bad decimal in column {col}: {raw}"))
}

pub(crate) fn opt_decimal(row: &SqliteRow, col: &str) -> Result<Option<Decimal>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|s| {
        Decimal::from_str(&s).with_context(|| format!("Bad decimal in column {col}: {s}"))
    })
    .transpose()
}

pub(crate) fn get_uuid(row: &SqliteRow, col: &str) -> Result<Uuid> {
    let raw: String = row.try_get(col)?;
    Uuid::from_str(&raw).with_context(|| format!("Bad uuid in column {col}: {raw}"))
}

pub(crate) fn opt_uuid(row: &SqliteRow, col: &str) -> Result<Option<Uuid>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|s| Uuid::from_str(&s).with_context(|| format!("Bad uuid in column {col}: {s}")))
        .transpose()
}

pub(crate) fn get_ts(row: &SqliteRow, col: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get(col)?;
    parse_ts(&raw).with_context(|| format!("Bad timestamp in column {col}: {raw}"))
}

pub(crate) fn opt_ts(row: &SqliteRow, col: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|s| parse_ts(&s).with_context(|| format!("Bad timestamp in column {col}: {s}")))
        .transpose()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

pub(crate) fn get_json(row: &SqliteRow, col: &str) -> Result<serde_json::Value> {
    let raw: Option<String> = row.try_get(col)?;
    Ok(match raw {
        Some(s) if !s.is_empty() => serde_json::from_str(&s)
            .with_context(|| format!("Bad JSON in column {col}"))?,
        _ => serde_json::Value::Null,
    })
}

pub(crate) fn json_text(value: &serde_json::Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(value.to_string())
    }
}
