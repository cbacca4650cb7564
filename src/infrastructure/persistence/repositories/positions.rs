use crate::domain::trading::types::{Position, PositionSide, PositionStatus};
use crate::infrastructure::persistence::repositories::{
    get_decimal, get_json, get_ts, get_uuid, json_text, opt_decimal, opt_ts,
};
use anyhow::{Result, anyhow};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub struct SqlitePositionRepository {
    pool: SqlitePool,
}

impl SqlitePositionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions
                (id, cycle_id, security_id, symbol, side, qty,
                 entry_price, entry_time, exit_price, exit_time, current_price,
                 stop_loss, take_profit, risk_amount,
                 realized_pnl, realized_pnl_pct, unrealized_pnl, unrealized_pnl_pct,
                 status, pattern, catalyst, high_watermark, entry_volume,
                 created_at, updated_at, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(position.id.to_string())
        .bind(position.cycle_id.to_string())
        .bind(position.security_id)
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.qty.to_string())
        .bind(position.entry_price.map(|p| p.to_string()))
        .bind(position.entry_time.map(|t| t.to_rfc3339()))
        .bind(position.exit_price.map(|p| p.to_string()))
        .bind(position.exit_time.map(|t| t.to_rfc3339()))
        .bind(position.current_price.map(|p| p.to_string()))
        .bind(position.stop_loss.to_string())
        .bind(position.take_profit.to_string())
        .bind(position.risk_amount.to_string())
        .bind(position.realized_pnl.to_string())
        .bind(position.realized_pnl_pct.map(|p| p.to_string()))
        .bind(position.unrealized_pnl.to_string())
        .bind(position.unrealized_pnl_pct.map(|p| p.to_string()))
        .bind(position.status.as_str())
        .bind(position.pattern.as_deref())
        .bind(position.catalyst.as_deref())
        .bind(position.high_watermark.map(|p| p.to_string()))
        .bind(position.entry_volume.map(|p| p.to_string()))
        .bind(position.created_at.to_rfc3339())
        .bind(position.updated_at.to_rfc3339())
        .bind(json_text(&position.metadata))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Optimistic full-row update: the write only lands if the row still has
    /// the `updated_at` the caller read, which linearizes concurrent writers
    /// per position. Returns false on a lost race.
    pub async fn update(&self, position: &Position, expected_updated_at: chrono::DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE positions SET
                qty = ?, entry_price = ?, entry_time = ?, exit_price = ?, exit_time = ?,
                current_price = ?, stop_loss = ?, take_profit = ?, risk_amount = ?,
                realized_pnl = ?, realized_pnl_pct = ?, unrealized_pnl = ?, unrealized_pnl_pct = ?,
                status = ?, pattern = ?, catalyst = ?, high_watermark = ?, entry_volume = ?,
                updated_at = ?, metadata = ?
            WHERE id = ? AND updated_at = ?
            "#,
        )
        .bind(position.qty.to_string())
        .bind(position.entry_price.map(|p| p.to_string()))
        .bind(position.entry_time.map(|t| t.to_rfc3339()))
        .bind(position.exit_price.map(|p| p.to_string()))
        .bind(position.exit_time.map(|t| t.to_rfc3339()))
        .bind(position.current_price.map(|p| p.to_string()))
        .bind(position.stop_loss.to_string())
        .bind(position.take_profit.to_string())
        .bind(position.risk_amount.to_string())
        .bind(position.realized_pnl.to_string())
        .bind(position.realized_pnl_pct.map(|p| p.to_string()))
        .bind(position.unrealized_pnl.to_string())
        .bind(position.unrealized_pnl_pct.map(|p| p.to_string()))
        .bind(position.status.as_str())
        .bind(position.pattern.as_deref())
        .bind(position.catalyst.as_deref())
        .bind(position.high_watermark.map(|p| p.to_string()))
        .bind(position.entry_volume.map(|p| p.to_string()))
        .bind(position.updated_at.to_rfc3339())
        .bind(json_text(&position.metadata))
        .bind(position.id.to_string())
        .bind(expected_updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, id: Uuid) -> Result<Position> {
        let row = sqlx::query("SELECT * FROM positions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow!("Position not found: {id}"))?;
        map_position(&row)
    }

    pub async fn list_open(&self, cycle_id: Option<Uuid>) -> Result<Vec<Position>> {
        let rows = match cycle_id {
            Some(id) => {
                sqlx::query(
                    "SELECT * FROM positions WHERE status = 'open' AND cycle_id = ? ORDER BY created_at ASC",
                )
                .bind(id.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM positions WHERE status = 'open' ORDER BY created_at ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(map_position).collect()
    }

    /// Pending and open positions: everything broker truth could know about.
    pub async fn list_live(&self, cycle_id: Option<Uuid>) -> Result<Vec<Position>> {
        let rows = match cycle_id {
            Some(id) => {
                sqlx::query(
                    "SELECT * FROM positions WHERE status IN ('open', 'pending') AND cycle_id = ? ORDER BY created_at ASC",
                )
                .bind(id.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM positions WHERE status IN ('open', 'pending') ORDER BY created_at ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(map_position).collect()
    }

    pub async fn count_open(&self, cycle_id: Uuid) -> Result<usize> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM positions WHERE cycle_id = ? AND status IN ('open', 'pending')",
        )
        .bind(cycle_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as usize)
    }

    /// A live (pending or open) position in this security, if any. Used for
    /// the dedupe validation rule.
    pub async fn live_for_security(
        &self,
        cycle_id: Uuid,
        security_id: i64,
    ) -> Result<Option<Position>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM positions
            WHERE cycle_id = ? AND security_id = ? AND status IN ('open', 'pending')
            "#,
        )
        .bind(cycle_id.to_string())
        .bind(security_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| map_position(&r)).transpose()
    }

    /// Risk budget already committed to live positions.
    pub async fn used_risk_budget(&self, cycle_id: Uuid) -> Result<Decimal> {
        let rows = sqlx::query(
            "SELECT risk_amount FROM positions WHERE cycle_id = ? AND status IN ('open', 'pending')",
        )
        .bind(cycle_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let mut total = Decimal::ZERO;
        for row in &rows {
            total += get_decimal(row, "risk_amount")?;
        }
        Ok(total)
    }

    /// Realized plus unrealized P&L across the cycle's positions. The risk
    /// monitor compares this against the daily loss limit.
    pub async fn aggregate_pnl(&self, cycle_id: Uuid) -> Result<(Decimal, Decimal)> {
        let rows = sqlx::query(
            "SELECT realized_pnl, unrealized_pnl FROM positions WHERE cycle_id = ?",
        )
        .bind(cycle_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let mut realized = Decimal::ZERO;
        let mut unrealized = Decimal::ZERO;
        for row in &rows {
            realized += get_decimal(row, "realized_pnl")?;
            unrealized += get_decimal(row, "unrealized_pnl")?;
        }
        Ok((realized, unrealized))
    }

    /// Market value of live positions per sector code, for exposure checks.
    pub async fn sector_exposure(&self, cycle_id: Uuid) -> Result<Vec<(String, Decimal)>> {
        let rows = sqlx::query(
            r#"
            SELECT COALESCE(sec.code, 'unknown') AS sector, p.qty, p.current_price, p.entry_price
            FROM positions p
            JOIN securities s ON s.id = p.security_id
            LEFT JOIN sectors sec ON sec.id = s.sector_id
            WHERE p.cycle_id = ? AND p.status IN ('open', 'pending')
            "#,
        )
        .bind(cycle_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut per_sector: std::collections::HashMap<String, Decimal> =
            std::collections::HashMap::new();
        for row in &rows {
            let sector: String = row.try_get("sector")?;
            let qty = get_decimal(row, "qty")?;
            let price = opt_decimal(row, "current_price")?
                .or(opt_decimal(row, "entry_price")?)
                .unwrap_or(Decimal::ZERO);
            *per_sector.entry(sector).or_insert(Decimal::ZERO) += qty * price;
        }
        Ok(per_sector.into_iter().collect())
    }
}

fn map_position(row: &SqliteRow) -> Result<Position> {
    let side_raw: String = row.try_get("side")?;
    let status_raw: String = row.try_get("status")?;
    Ok(Position {
        id: get_uuid(row, "id")?,
        cycle_id: get_uuid(row, "cycle_id")?,
        security_id: row.try_get("security_id")?,
        symbol: row.try_get("symbol")?,
        side: PositionSide::parse(&side_raw)
            .ok_or_else(|| anyhow!("Unknown position side: {side_raw}"))?,
        qty: get_decimal(row, "qty")?,
        entry_price: opt_decimal(row, "entry_price")?,
        entry_time: opt_ts(row, "entry_time")?,
        exit_price: opt_decimal(row, "exit_price")?,
        exit_time: opt_ts(row, "exit_time")?,
        current_price: opt_decimal(row, "current_price")?,
        stop_loss: get_decimal(row, "stop_loss")?,
        take_profit: get_decimal(row, "take_profit")?,
        risk_amount: get_decimal(row, "risk_amount")?,
        realized_pnl: get_decimal(row, "realized_pnl")?,
        realized_pnl_pct: opt_decimal(row, "realized_pnl_pct")?,
        unrealized_pnl: get_decimal(row, "unrealized_pnl")?,
        unrealized_pnl_pct: opt_decimal(row, "unrealized_pnl_pct")?,
        status: PositionStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("Unknown position status: {status_raw}"))?,
        pattern: row.try_get("pattern")?,
        catalyst: row.try_get("catalyst")?,
        high_watermark: opt_decimal(row, "high_watermark")?,
        entry_volume: opt_decimal(row, "entry_volume")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
        metadata: get_json(row, "metadata")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::cycle::{CycleMode, TradingCycle};
    use crate::infrastructure::persistence::database::Database;
    use crate::infrastructure::persistence::repositories::{
        SqliteCycleRepository, SqliteSecurityRepository,
    };
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    async fn seed_cycle(db: &Database) -> Uuid {
        let cycles = SqliteCycleRepository::new(db.pool.clone());
        let cycle = TradingCycle::new(
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            CycleMode::Paper,
            serde_json::Value::Null,
        );
        cycles.create(&cycle).await.unwrap();
        cycle.id
    }

    async fn seed_position(db: &Database, cycle_id: Uuid, symbol: &str) -> Position {
        let securities = SqliteSecurityRepository::new(db.pool.clone());
        let positions = SqlitePositionRepository::new(db.pool.clone());
        let security_id = securities.get_or_create(symbol).await.unwrap();
        let position = Position::new(
            cycle_id,
            security_id,
            symbol,
            PositionSide::Long,
            dec!(10),
            dec!(145),
            dec!(165),
            dec!(50),
            Utc::now(),
        );
        positions.insert(&position).await.unwrap();
        position
    }

    #[tokio::test]
    async fn round_trip_and_live_lookup() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let repo = SqlitePositionRepository::new(db.pool.clone());
        let cycle_id = seed_cycle(&db).await;
        let position = seed_position(&db, cycle_id, "AAPL").await;

        let loaded = repo.get(position.id).await.unwrap();
        assert_eq!(loaded.status, PositionStatus::Pending);
        assert_eq!(loaded.stop_loss, dec!(145));

        let live = repo
            .live_for_security(cycle_id, position.security_id)
            .await
            .unwrap();
        assert!(live.is_some());
        assert_eq!(repo.count_open(cycle_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn optimistic_update_detects_lost_race() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let repo = SqlitePositionRepository::new(db.pool.clone());
        let cycle_id = seed_cycle(&db).await;
        let position = seed_position(&db, cycle_id, "AAPL").await;

        let stamp = position.updated_at;

        let mut first = repo.get(position.id).await.unwrap();
        first.open_on_fill(dec!(150), Utc::now()).unwrap();
        assert!(repo.update(&first, stamp).await.unwrap());

        // A second writer holding the stale stamp loses.
        let mut second = position.clone();
        second.open_on_fill(dec!(151), Utc::now()).unwrap();
        assert!(!repo.update(&second, stamp).await.unwrap());

        let loaded = repo.get(position.id).await.unwrap();
        assert_eq!(loaded.entry_price, Some(dec!(150)));
    }

    #[tokio::test]
    async fn risk_budget_and_pnl_aggregation() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let repo = SqlitePositionRepository::new(db.pool.clone());
        let cycle_id = seed_cycle(&db).await;
        let a = seed_position(&db, cycle_id, "AAPL").await;
        let _b = seed_position(&db, cycle_id, "MSFT").await;

        assert_eq!(repo.used_risk_budget(cycle_id).await.unwrap(), dec!(100));

        let mut open = repo.get(a.id).await.unwrap();
        let stamp = open.updated_at;
        open.open_on_fill(dec!(150), Utc::now()).unwrap();
        open.mark_price(dec!(148), Utc::now());
        repo.update(&open, stamp).await.unwrap();

        let (realized, unrealized) = repo.aggregate_pnl(cycle_id).await.unwrap();
        assert_eq!(realized, dec!(0));
        assert_eq!(unrealized, dec!(-20));
    }
}
