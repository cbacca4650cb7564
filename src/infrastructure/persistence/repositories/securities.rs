use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};

pub struct SqliteSecurityRepository {
    pool: SqlitePool,
}

impl SqliteSecurityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Return the surrogate id for a symbol, inserting the dimension row on
    /// first reference. Safe under concurrent callers: the insert races are
    /// resolved by the unique symbol constraint and the read-back.
    pub async fn get_or_create(&self, symbol: &str) -> Result<i64> {
        let symbol = symbol.to_uppercase();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO securities (symbol, active, created_at, updated_at)
            VALUES (?, 1, ?, ?)
            ON CONFLICT(symbol) DO NOTHING
            "#,
        )
        .bind(&symbol)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to insert security")?;

        let row = sqlx::query("SELECT id FROM securities WHERE symbol = ?")
            .bind(&symbol)
            .fetch_one(&self.pool)
            .await
            .context("Failed to read back security id")?;

        Ok(row.try_get("id")?)
    }

    pub async fn set_sector(&self, symbol: &str, sector_code: &str, sector_name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sectors (code, name) VALUES (?, ?)
            ON CONFLICT(code) DO NOTHING
            "#,
        )
        .bind(sector_code)
        .bind(sector_name)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            UPDATE securities
            SET sector_id = (SELECT id FROM sectors WHERE code = ?), updated_at = ?
            WHERE symbol = ?
            "#,
        )
        .bind(sector_code)
        .bind(Utc::now().to_rfc3339())
        .bind(symbol.to_uppercase())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Sector code for a security, if one was ever assigned.
    pub async fn sector_of(&self, security_id: i64) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT sec.code AS code
            FROM securities s
            JOIN sectors sec ON sec.id = s.sector_id
            WHERE s.id = ?
            "#,
        )
        .bind(security_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(r) => Some(r.try_get("code")?),
            None => None,
        })
    }

    pub async fn update_metadata(
        &self,
        symbol: &str,
        name: Option<&str>,
        exchange: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE securities
            SET name = COALESCE(?, name), exchange = COALESCE(?, exchange), updated_at = ?
            WHERE symbol = ?
            "#,
        )
        .bind(name)
        .bind(exchange)
        .bind(Utc::now().to_rfc3339())
        .bind(symbol.to_uppercase())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
