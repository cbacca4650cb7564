use crate::domain::trading::types::{
    Order, OrderClass, OrderPurpose, OrderSide, OrderStatus, OrderType, TimeInForce,
};
use crate::infrastructure::persistence::repositories::{
    get_decimal, get_json, get_ts, get_uuid, json_text, opt_decimal, opt_ts, opt_uuid,
};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool, Sqlite, Transaction};
use uuid::Uuid;

pub struct SqliteOrderRepository {
    pool: SqlitePool,
}

impl SqliteOrderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert(&self, order: &Order) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_in(&mut tx, order).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Insert inside a caller-held transaction. The engine uses this to land
    /// an entry update and both bracket children atomically, so partial
    /// bracket state never exists in the store.
    pub async fn insert_in(tx: &mut Transaction<'_, Sqlite>, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders
                (id, cycle_id, security_id, symbol, position_id, parent_order_id,
                 order_class, purpose, side, order_type, time_in_force,
                 qty, limit_price, stop_price, broker_order_id, status,
                 filled_qty, filled_avg_price,
                 created_at, submitted_at, accepted_at, filled_at, cancelled_at,
                 expired_at, updated_at, reason, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(order.id.to_string())
        .bind(order.cycle_id.to_string())
        .bind(order.security_id)
        .bind(&order.symbol)
        .bind(order.position_id.map(|u| u.to_string()))
        .bind(order.parent_order_id.map(|u| u.to_string()))
        .bind(order.class.as_str())
        .bind(order.purpose.as_str())
        .bind(order.side.as_str())
        .bind(order.order_type.as_str())
        .bind(order.time_in_force.as_str())
        .bind(order.qty.to_string())
        .bind(order.limit_price.map(|p| p.to_string()))
        .bind(order.stop_price.map(|p| p.to_string()))
        .bind(order.broker_order_id.as_deref())
        .bind(order.status.as_str())
        .bind(order.filled_qty.to_string())
        .bind(order.filled_avg_price.map(|p| p.to_string()))
        .bind(order.created_at.to_rfc3339())
        .bind(order.submitted_at.map(|t| t.to_rfc3339()))
        .bind(order.accepted_at.map(|t| t.to_rfc3339()))
        .bind(order.filled_at.map(|t| t.to_rfc3339()))
        .bind(order.cancelled_at.map(|t| t.to_rfc3339()))
        .bind(order.expired_at.map(|t| t.to_rfc3339()))
        .bind(order.updated_at.to_rfc3339())
        .bind(order.reason.as_deref())
        .bind(json_text(&order.metadata))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn update(&self, order: &Order) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::update_in(&mut tx, order).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_in(tx: &mut Transaction<'_, Sqlite>, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders SET
                position_id = ?, broker_order_id = ?, status = ?,
                filled_qty = ?, filled_avg_price = ?,
                submitted_at = ?, accepted_at = ?, filled_at = ?,
                cancelled_at = ?, expired_at = ?, updated_at = ?,
                reason = ?, metadata = ?
            WHERE id = ?
            "#,
        )
        .bind(order.position_id.map(|u| u.to_string()))
        .bind(order.broker_order_id.as_deref())
        .bind(order.status.as_str())
        .bind(order.filled_qty.to_string())
        .bind(order.filled_avg_price.map(|p| p.to_string()))
        .bind(order.submitted_at.map(|t| t.to_rfc3339()))
        .bind(order.accepted_at.map(|t| t.to_rfc3339()))
        .bind(order.filled_at.map(|t| t.to_rfc3339()))
        .bind(order.cancelled_at.map(|t| t.to_rfc3339()))
        .bind(order.expired_at.map(|t| t.to_rfc3339()))
        .bind(order.updated_at.to_rfc3339())
        .bind(order.reason.as_deref())
        .bind(json_text(&order.metadata))
        .bind(order.id.to_string())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Order> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow!("Order not found: {id}"))?;
        map_order(&row)
    }

    pub async fn find_by_broker_id(&self, broker_order_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE broker_order_id = ?")
            .bind(broker_order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_order(&r)).transpose()
    }

    pub async fn list_for_position(&self, position_id: Uuid) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            "SELECT * FROM orders WHERE position_id = ? ORDER BY created_at ASC",
        )
        .bind(position_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_order).collect()
    }

    /// The OCO sibling of a bracket leg: same parent, other purpose.
    pub async fn sibling_leg(&self, leg: &Order) -> Result<Option<Order>> {
        let Some(parent_id) = leg.parent_order_id else {
            return Ok(None);
        };
        let row = sqlx::query(
            "SELECT * FROM orders WHERE parent_order_id = ? AND id != ?",
        )
        .bind(parent_id.to_string())
        .bind(leg.id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| map_order(&r)).transpose()
    }

    /// Whether the cycle already carries a live entry order for a security.
    /// Backstops the per-symbol submission serialization.
    pub async fn live_entry_exists(&self, cycle_id: Uuid, security_id: i64) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM orders
            WHERE cycle_id = ? AND security_id = ? AND purpose = 'entry'
              AND status NOT IN ('rejected', 'cancelled', 'expired', 'not_found')
            "#,
        )
        .bind(cycle_id.to_string())
        .bind(security_id)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }

    /// Non-terminal orders submitted within the window, oldest first. The
    /// watchdog syncs these against broker truth.
    pub async fn list_non_terminal_since(&self, since: DateTime<Utc>) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM orders
            WHERE status NOT IN ('filled', 'cancelled', 'rejected', 'expired', 'not_found')
              AND submitted_at IS NOT NULL AND submitted_at >= ?
            ORDER BY submitted_at ASC
            "#,
        )
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_order).collect()
    }

    /// Orders stuck in a non-terminal state past the cutoff.
    pub async fn stuck_orders(&self, submitted_before: DateTime<Utc>) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM orders
            WHERE status IN ('submitted', 'submitted_unknown', 'accepted', 'partial_fill')
              AND submitted_at IS NOT NULL AND submitted_at < ?
            ORDER BY submitted_at ASC
            "#,
        )
        .bind(submitted_before.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_order).collect()
    }
}

fn map_order(row: &SqliteRow) -> Result<Order> {
    let class_raw: String = row.try_get("order_class")?;
    let purpose_raw: String = row.try_get("purpose")?;
    let side_raw: String = row.try_get("side")?;
    let type_raw: String = row.try_get("order_type")?;
    let tif_raw: String = row.try_get("time_in_force")?;
    let status_raw: String = row.try_get("status")?;

    Ok(Order {
        id: get_uuid(row, "id")?,
        cycle_id: get_uuid(row, "cycle_id")?,
        security_id: row.try_get("security_id")?,
        symbol: row.try_get("symbol")?,
        position_id: opt_uuid(row, "position_id")?,
        parent_order_id: opt_uuid(row, "parent_order_id")?,
        class: OrderClass::parse(&class_raw)
            .ok_or_else(|| anyhow!("Unknown order class: {class_raw}"))?,
        purpose: OrderPurpose::parse(&purpose_raw)
            .ok_or_else(|| anyhow!("Unknown order purpose: {purpose_raw}"))?,
        side: OrderSide::parse(&side_raw)
            .ok_or_else(|| anyhow!("Unknown order side: {side_raw}"))?,
        order_type: OrderType::parse(&type_raw)
            .ok_or_else(|| anyhow!("Unknown order type: {type_raw}"))?,
        time_in_force: TimeInForce::parse(&tif_raw)
            .ok_or_else(|| anyhow!("Unknown time in force: {tif_raw}"))?,
        qty: get_decimal(row, "qty")?,
        limit_price: opt_decimal(row, "limit_price")?,
        stop_price: opt_decimal(row, "stop_price")?,
        broker_order_id: row.try_get("broker_order_id")?,
        status: OrderStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("Unknown order status: {status_raw}"))?,
        filled_qty: get_decimal(row, "filled_qty")?,
        filled_avg_price: opt_decimal(row, "filled_avg_price")?,
        created_at: get_ts(row, "created_at")?,
        submitted_at: opt_ts(row, "submitted_at")?,
        accepted_at: opt_ts(row, "accepted_at")?,
        filled_at: opt_ts(row, "filled_at")?,
        cancelled_at: opt_ts(row, "cancelled_at")?,
        expired_at: opt_ts(row, "expired_at")?,
        updated_at: get_ts(row, "updated_at")?,
        reason: row.try_get("reason")?,
        metadata: get_json(row, "metadata")?,
    })
}
