//! Order/position lifecycle engine: bracket submission, fill processing,
//! OCO maintenance, closes. Broker truth wins every disagreement; the local
//! store exists so reconciliation can always find a row.

use crate::application::alerts::AlertMailbox;
use crate::domain::errors::BrokerError;
use crate::domain::ports::{AlertSeverity, BrokerAdapter, EntrySpec};
use crate::domain::audit::RiskEvent;
use crate::domain::trading::types::{
    Order, OrderPurpose, OrderStatus, OrderType, Position, PositionSide, PositionStatus,
    TimeInForce,
};
use crate::infrastructure::observability::Metrics;
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::{
    SqliteCycleRepository, SqliteOrderRepository, SqlitePositionRepository,
    SqliteRiskEventRepository, SqliteSecurityRepository,
};
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::KeyedLocks;

/// A candidate the risk engine has already approved.
#[derive(Debug, Clone)]
pub struct TradeCandidate {
    pub symbol: String,
    pub side: PositionSide,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub risk_amount: Decimal,
    pub pattern: Option<String>,
    pub catalyst: Option<String>,
    pub entry_volume: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct OpenedPosition {
    pub position_id: Uuid,
    pub entry_order_id: Uuid,
    pub stop_loss_order_id: Uuid,
    pub take_profit_order_id: Uuid,
}

#[derive(Debug, Default)]
pub struct CloseAllReport {
    pub attempted: usize,
    pub submitted: usize,
    pub failures: Vec<(String, String)>,
}

pub struct OrderEngine {
    pub(super) broker: Arc<dyn BrokerAdapter>,
    pub(super) db: Database,
    pub(super) orders: Arc<SqliteOrderRepository>,
    pub(super) positions: Arc<SqlitePositionRepository>,
    pub(super) securities: Arc<SqliteSecurityRepository>,
    pub(super) cycles: Arc<SqliteCycleRepository>,
    pub(super) risk_events: Arc<SqliteRiskEventRepository>,
    pub(super) alerts: Arc<AlertMailbox>,
    pub(super) metrics: Metrics,
    pub(super) broker_deadline: Duration,
    symbol_locks: KeyedLocks<String>,
    position_locks: KeyedLocks<Uuid>,
}

impl OrderEngine {
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        db: Database,
        alerts: Arc<AlertMailbox>,
        metrics: Metrics,
        broker_deadline: Duration,
    ) -> Self {
        Self {
            broker,
            orders: Arc::new(SqliteOrderRepository::new(db.pool.clone())),
            positions: Arc::new(SqlitePositionRepository::new(db.pool.clone())),
            securities: Arc::new(SqliteSecurityRepository::new(db.pool.clone())),
            cycles: Arc::new(SqliteCycleRepository::new(db.pool.clone())),
            risk_events: Arc::new(SqliteRiskEventRepository::new(db.pool.clone())),
            db,
            alerts,
            metrics,
            broker_deadline,
            symbol_locks: KeyedLocks::new(),
            position_locks: KeyedLocks::new(),
        }
    }

    pub fn positions_repo(&self) -> Arc<SqlitePositionRepository> {
        self.positions.clone()
    }

    pub fn orders_repo(&self) -> Arc<SqliteOrderRepository> {
        self.orders.clone()
    }

    /// Open a position with a bracket order. The position row is inserted
    /// BEFORE the broker call so callbacks and reconciliation always find a
    /// local row; the entry update plus both GTC children land in one
    /// transaction after a successful submit.
    pub async fn open_position(
        &self,
        cycle_id: Uuid,
        candidate: &TradeCandidate,
    ) -> Result<OpenedPosition> {
        let _symbol_guard = self.symbol_locks.lock(candidate.symbol.to_uppercase()).await;

        let security_id = self.securities.get_or_create(&candidate.symbol).await?;
        if self.orders.live_entry_exists(cycle_id, security_id).await? {
            bail!(
                "Live entry already exists for {} in this cycle",
                candidate.symbol
            );
        }

        let now = Utc::now();
        let mut position = Position::new(
            cycle_id,
            security_id,
            &candidate.symbol,
            candidate.side,
            candidate.qty,
            candidate.stop_loss,
            candidate.take_profit,
            candidate.risk_amount,
            now,
        );
        position.pattern = candidate.pattern.clone();
        position.catalyst = candidate.catalyst.clone();
        position.entry_volume = candidate.entry_volume;
        self.positions.insert(&position).await?;

        let mut entry = Order::entry(
            cycle_id,
            security_id,
            &candidate.symbol,
            position.id,
            candidate.side,
            OrderType::Limit,
            TimeInForce::Day,
            candidate.qty,
            Some(candidate.entry_price),
            now,
        );
        self.orders.insert(&entry).await?;

        let submit = timeout(
            self.broker_deadline,
            self.broker.submit_bracket(
                &candidate.symbol,
                candidate.qty,
                candidate.side.entry_order_side(),
                TimeInForce::Day,
                EntrySpec {
                    order_type: OrderType::Limit,
                    limit_price: Some(candidate.entry_price),
                },
                candidate.stop_loss,
                candidate.take_profit,
            ),
        )
        .await;

        let ids = match submit {
            Ok(Ok(ids)) => ids,
            Ok(Err(e)) => {
                return self
                    .handle_submit_failure(&mut entry, &mut position, e)
                    .await;
            }
            Err(_elapsed) => {
                // The request may or may not have reached the broker:
                // ambiguous. Never resubmit; reconciliation resolves it.
                let now = Utc::now();
                entry.transition(OrderStatus::SubmittedUnknown, now)?;
                entry.reason = Some("submit deadline exceeded".to_string());
                self.orders.update(&entry).await?;
                self.record_risk_event(
                    cycle_id,
                    Some(position.id),
                    "submit_ambiguous",
                    AlertSeverity::Warning,
                    format!("Bracket submit for {} timed out", candidate.symbol),
                )
                .await;
                bail!("Bracket submit for {} timed out", candidate.symbol);
            }
        };

        // Entry update + both bracket children in one transaction: partial
        // bracket state must never exist locally.
        let now = Utc::now();
        entry.assign_broker_id(&ids.entry_order_id)?;
        entry.transition(OrderStatus::Submitted, now)?;

        let (mut stop, mut target) =
            Order::bracket_children_for(&position, &entry, candidate.stop_loss, candidate.take_profit, now);
        stop.assign_broker_id(&ids.stop_loss_order_id)?;
        target.assign_broker_id(&ids.take_profit_order_id)?;

        let mut tx = self.db.pool.begin().await?;
        SqliteOrderRepository::update_in(&mut tx, &entry).await?;
        SqliteOrderRepository::insert_in(&mut tx, &stop).await?;
        SqliteOrderRepository::insert_in(&mut tx, &target).await?;
        tx.commit().await?;

        self.cycles.record_trade_executed(cycle_id).await?;
        self.metrics
            .orders_total
            .with_label_values(&["entry", "submitted"])
            .inc();
        info!(
            "OrderEngine: opened pending position {} {} x{} (entry {}, stop {}, target {})",
            candidate.symbol,
            candidate.side.as_str(),
            candidate.qty,
            candidate.entry_price,
            candidate.stop_loss,
            candidate.take_profit
        );

        Ok(OpenedPosition {
            position_id: position.id,
            entry_order_id: entry.id,
            stop_loss_order_id: stop.id,
            take_profit_order_id: target.id,
        })
    }

    async fn handle_submit_failure(
        &self,
        entry: &mut Order,
        position: &mut Position,
        e: BrokerError,
    ) -> Result<OpenedPosition> {
        let now = Utc::now();
        let ambiguous = matches!(
            e,
            BrokerError::Unavailable { .. } | BrokerError::Transient { .. }
        );
        if ambiguous {
            // The connection died mid-flight; the broker may have the order.
            entry.transition(OrderStatus::SubmittedUnknown, now)?;
            entry.reason = Some(e.to_string());
            self.orders.update(entry).await?;
        } else {
            // Definite rejection: the order never existed at the broker.
            entry.transition(OrderStatus::Rejected, now)?;
            entry.reason = Some(e.to_string());
            self.orders.update(entry).await?;

            self.with_position(position.id, |p| {
                p.transition(PositionStatus::Cancelled, Utc::now())
                    .map_err(|e| anyhow!(e))
            })
            .await?;
            self.metrics
                .orders_total
                .with_label_values(&["entry", "rejected"])
                .inc();
        }

        self.record_risk_event(
            entry.cycle_id,
            Some(position.id),
            "entry_rejected",
            AlertSeverity::Warning,
            format!("Bracket submit for {} failed: {e}", entry.symbol),
        )
        .await;
        self.alerts.post_warning(
            "OrderEngine",
            format!("Entry for {} failed: {e}", entry.symbol),
        );
        Err(anyhow!(e).context(format!("Bracket submit for {} failed", entry.symbol)))
    }

    /// Apply a fill report. `filled_qty`/`filled_avg_price` are cumulative,
    /// as brokers report them; replays and out-of-date callbacks are no-ops.
    pub async fn on_fill(
        &self,
        broker_order_id: &str,
        filled_qty: Decimal,
        filled_avg_price: Decimal,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        let mut order = self
            .orders
            .find_by_broker_id(broker_order_id)
            .await?
            .ok_or_else(|| anyhow!("No local order for broker id {broker_order_id}"))?;

        let position_id = order
            .position_id
            .ok_or_else(|| anyhow!("Order {} has no position", order.id))?;
        let _guard = self.position_locks.lock(position_id).await;

        // Reload under the lock; a racing callback may have advanced it.
        order = self.orders.get(order.id).await?;

        let increment = filled_qty - order.filled_qty;
        if increment <= Decimal::ZERO {
            return Ok(());
        }
        // Back out the price of just this increment from the cumulative
        // average, so partial exits realize P&L volume-weighted per event.
        let prior_notional =
            order.filled_avg_price.unwrap_or(Decimal::ZERO) * order.filled_qty;
        let increment_price = (filled_avg_price * filled_qty - prior_notional) / increment;

        // A fill can beat the activation callback for a bracket leg; bring
        // the row up to accepted before applying it.
        if order.status == OrderStatus::Created {
            order.transition(OrderStatus::Submitted, ts)?;
        }
        if order.status == OrderStatus::Submitted {
            order.transition(OrderStatus::Accepted, ts)?;
        }
        order.apply_fill(increment, increment_price, ts)?;
        self.orders.update(&order).await?;

        if order.status == OrderStatus::Filled {
            self.metrics
                .orders_total
                .with_label_values(&[order.purpose.as_str(), "filled"])
                .inc();
        }

        match order.purpose {
            OrderPurpose::Entry => self.apply_entry_fill(&order, ts).await,
            _ => self.apply_exit_fill(&order, increment, increment_price, ts).await,
        }
    }

    async fn apply_entry_fill(&self, order: &Order, ts: DateTime<Utc>) -> Result<()> {
        if order.status != OrderStatus::Filled {
            // Position opens on the full entry fill.
            return Ok(());
        }
        let entry_price = order
            .filled_avg_price
            .ok_or_else(|| anyhow!("Filled entry without avg price"))?;
        let position_id = order.position_id.expect("checked by caller");

        let position = self
            .with_position(position_id, |p| {
                if p.status == PositionStatus::Open {
                    return Ok(());
                }
                p.open_on_fill(entry_price, ts).map_err(|e| anyhow!(e))
            })
            .await?;

        // The GTC children go live at the broker once the entry fills.
        for mut child in self.orders.list_for_position(position_id).await? {
            if child.purpose.is_bracket_leg() && child.status == OrderStatus::Created {
                child.transition(OrderStatus::Submitted, ts)?;
                child.transition(OrderStatus::Accepted, ts)?;
                self.orders.update(&child).await?;
            }
        }

        info!(
            "OrderEngine: position {} opened at {} (watermark seeded)",
            position.symbol, entry_price
        );
        Ok(())
    }

    async fn apply_exit_fill(
        &self,
        order: &Order,
        increment: Decimal,
        increment_price: Decimal,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        let position_id = order.position_id.expect("checked by caller");

        // Total exited across every exit-like order, minus this increment.
        let all_orders = self.orders.list_for_position(position_id).await?;
        let total_exited: Decimal = all_orders
            .iter()
            .filter(|o| o.purpose.is_exit_like())
            .map(|o| o.filled_qty)
            .sum();
        let exited_before = total_exited - increment;

        let position = self
            .with_position(position_id, |p| {
                p.apply_exit_fill(increment, increment_price, exited_before, ts)
                    .map_err(|e| anyhow!(e))
            })
            .await?;

        if position.status == PositionStatus::Closed {
            info!(
                "OrderEngine: position {} closed, realized P&L {}",
                position.symbol, position.realized_pnl
            );
            // OCO: the sibling leg must not stay live once the position is
            // flat.
            if order.purpose.is_bracket_leg() {
                if let Some(sibling) = self.orders.sibling_leg(order).await? {
                    self.cancel_order_everywhere(sibling).await?;
                }
            } else {
                self.cancel_open_brackets(position_id).await?;
            }

            let won = position.realized_pnl > Decimal::ZERO;
            self.cycles
                .record_trade_closed(position.cycle_id, won, position.realized_pnl)
                .await?;
        }
        Ok(())
    }

    /// Submit a market exit for the full position. The exit side is derived
    /// from the position side; bracket legs are cancelled once the exit
    /// submit is accepted.
    pub async fn close_position(&self, position_id: Uuid, reason: &str) -> Result<()> {
        let _guard = self.position_locks.lock(position_id).await;

        let position = self.positions.get(position_id).await?;
        if position.status != PositionStatus::Open {
            info!(
                "OrderEngine: close_position skipped, {} is {}",
                position.symbol,
                position.status.as_str()
            );
            return Ok(());
        }

        let mut exit = Order::exit_for(&position, reason, Utc::now());
        self.orders.insert(&exit).await?;

        let result = timeout(
            self.broker_deadline,
            self.broker.close_position(&position.symbol, Some(reason)),
        )
        .await;

        let now = Utc::now();
        match result {
            Ok(Ok(close)) => {
                if let Some(broker_id) = &close.broker_order_id {
                    exit.assign_broker_id(broker_id)?;
                }
                exit.transition(OrderStatus::Submitted, now)?;
                self.orders.update(&exit).await?;
                self.cancel_open_brackets(position_id).await?;
                info!(
                    "OrderEngine: exit submitted for {} ({})",
                    position.symbol, reason
                );
                Ok(())
            }
            Ok(Err(e)) => {
                exit.transition(OrderStatus::Rejected, now)?;
                exit.reason = Some(e.to_string());
                self.orders.update(&exit).await?;
                self.record_risk_event(
                    position.cycle_id,
                    Some(position_id),
                    "exit_failed",
                    AlertSeverity::Critical,
                    format!("Close for {} failed: {e}", position.symbol),
                )
                .await;
                Err(anyhow!(e).context(format!("Close for {} failed", position.symbol)))
            }
            Err(_elapsed) => {
                exit.transition(OrderStatus::SubmittedUnknown, now)?;
                exit.reason = Some("close deadline exceeded".to_string());
                self.orders.update(&exit).await?;
                bail!("Close for {} timed out", position.symbol)
            }
        }
    }

    /// Close every open position in the cycle, continuing on per-symbol
    /// failures. Used by the emergency stop, which needs the counts.
    pub async fn close_all(&self, cycle_id: Uuid, reason: &str) -> Result<CloseAllReport> {
        let open = self.positions.list_open(Some(cycle_id)).await?;
        let mut report = CloseAllReport {
            attempted: open.len(),
            ..Default::default()
        };

        for position in open {
            match self.close_position(position.id, reason).await {
                Ok(()) => report.submitted += 1,
                Err(e) => {
                    error!(
                        "OrderEngine: close_all failed for {}: {e:#}",
                        position.symbol
                    );
                    report.failures.push((position.symbol.clone(), e.to_string()));
                }
            }
        }

        warn!(
            "OrderEngine: close_all({reason}) attempted {} submitted {} failed {}",
            report.attempted,
            report.submitted,
            report.failures.len()
        );
        Ok(report)
    }

    /// Cancel a bracket leg (or any live order) at the broker and locally.
    /// A leg the broker already discarded is treated as cancelled.
    pub(super) async fn cancel_order_everywhere(&self, mut order: Order) -> Result<()> {
        if order.status.is_terminal() {
            return Ok(());
        }
        if let Some(broker_id) = order.broker_order_id.clone() {
            match self.broker.cancel_order(&broker_id).await {
                Ok(()) | Err(BrokerError::OrderNotFound { .. }) => {}
                Err(e) => {
                    warn!(
                        "OrderEngine: broker cancel failed for {} ({e}); leaving for watchdog",
                        order.symbol
                    );
                    return Ok(());
                }
            }
        }
        let now = Utc::now();
        // A created-but-never-submitted row cannot go straight to cancelled.
        if order.status == OrderStatus::Created {
            order.transition(OrderStatus::Submitted, now)?;
            order.transition(OrderStatus::Expired, now)?;
        } else {
            if order.status == OrderStatus::Submitted {
                order.transition(OrderStatus::Accepted, now)?;
            }
            order.transition(OrderStatus::Cancelled, now)?;
        }
        self.orders.update(&order).await?;
        Ok(())
    }

    pub(super) async fn cancel_open_brackets(&self, position_id: Uuid) -> Result<()> {
        let orders = self.orders.list_for_position(position_id).await?;
        for order in orders {
            if order.purpose.is_bracket_leg() && !order.status.is_terminal() {
                self.cancel_order_everywhere(order).await?;
            }
        }
        Ok(())
    }

    /// Mark-to-market under the position's lock; maintains the high
    /// watermark and unrealized P&L.
    pub async fn mark_position_price(
        &self,
        position_id: Uuid,
        price: Decimal,
    ) -> Result<Position> {
        let _guard = self.position_locks.lock(position_id).await;
        self.with_position(position_id, |p| {
            if p.status == PositionStatus::Open {
                p.mark_price(price, Utc::now());
            }
            Ok(())
        })
        .await
    }

    /// Load-mutate-store with optimistic concurrency; one retry on a lost
    /// race, then give up loudly.
    pub(super) async fn with_position<F>(&self, id: Uuid, mutate: F) -> Result<Position>
    where
        F: Fn(&mut Position) -> Result<()>,
    {
        for _attempt in 0..2 {
            let mut position = self.positions.get(id).await?;
            let stamp = position.updated_at;
            mutate(&mut position)?;
            if self.positions.update(&position, stamp).await? {
                return Ok(position);
            }
        }
        bail!("Position update contention for {id}")
    }

    pub(super) async fn record_risk_event(
        &self,
        cycle_id: Uuid,
        position_id: Option<Uuid>,
        event_type: &str,
        severity: AlertSeverity,
        message: String,
    ) {
        let event = RiskEvent::new(Some(cycle_id), position_id, event_type, severity, message);
        if let Err(e) = self.risk_events.insert(&event).await {
            error!("OrderEngine: failed to persist risk event: {e:#}");
        }
    }
}
