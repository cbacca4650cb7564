//! Reconciliation against broker truth. Detection is read-only; the fixes
//! are separate methods so the watchdog can gate them through its rules
//! table before anything mutates.

use crate::domain::errors::BrokerError;
use crate::domain::ports::AlertSeverity;
use crate::domain::trading::types::{OrderStatus, PositionStatus};
use anyhow::{Result, anyhow};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use super::order_engine::OrderEngine;

#[derive(Debug, Clone, PartialEq)]
pub enum PositionIssueKind {
    /// Open locally, absent at the broker.
    Phantom,
    /// Present at the broker, no live local row. Real money: never
    /// auto-created locally.
    Orphan,
    /// Same symbol on both sides, different quantity.
    QtyMismatch {
        local_qty: Decimal,
        broker_qty: Decimal,
        drift_pct: f64,
    },
}

#[derive(Debug, Clone)]
pub struct PositionIssue {
    pub kind: PositionIssueKind,
    pub severity: AlertSeverity,
    pub position_id: Option<Uuid>,
    pub symbol: String,
}

impl OrderEngine {
    /// Compare local live positions with broker truth. Detection only.
    pub async fn detect_position_issues(
        &self,
        cycle_id: Option<Uuid>,
    ) -> Result<Vec<PositionIssue>> {
        let local = self.positions.list_live(cycle_id).await?;
        let broker_positions = timeout(self.broker_deadline, self.broker.list_positions())
            .await
            .map_err(|_| anyhow!("list_positions deadline exceeded"))??;

        let mut broker_by_symbol: std::collections::HashMap<String, Decimal> = broker_positions
            .iter()
            .map(|p| (p.symbol.to_uppercase(), p.qty))
            .collect();

        let mut issues = Vec::new();
        for position in &local {
            match broker_by_symbol.remove(&position.symbol) {
                None => {
                    // A pending position may simply not have filled yet, and
                    // an exit leg filled at the broker (callback lost)
                    // explains the missing position: order sync converges
                    // that, not a phantom fix.
                    if position.status == PositionStatus::Open
                        && !self.has_exit_fill_in_flight(position.id).await?
                    {
                        issues.push(PositionIssue {
                            kind: PositionIssueKind::Phantom,
                            severity: AlertSeverity::Critical,
                            position_id: Some(position.id),
                            symbol: position.symbol.clone(),
                        });
                    }
                }
                Some(broker_qty) => {
                    if position.status == PositionStatus::Open && broker_qty != position.qty {
                        let drift_pct = ((position.qty - broker_qty).abs() / position.qty)
                            .to_f64()
                            .unwrap_or(1.0)
                            * 100.0;
                        let severity = if drift_pct >= 10.0 {
                            AlertSeverity::Critical
                        } else {
                            AlertSeverity::Warning
                        };
                        issues.push(PositionIssue {
                            kind: PositionIssueKind::QtyMismatch {
                                local_qty: position.qty,
                                broker_qty,
                                drift_pct,
                            },
                            severity,
                            position_id: Some(position.id),
                            symbol: position.symbol.clone(),
                        });
                    }
                }
            }
        }

        // Whatever remains at the broker has no local counterpart.
        for (symbol, _qty) in broker_by_symbol {
            issues.push(PositionIssue {
                kind: PositionIssueKind::Orphan,
                severity: AlertSeverity::Critical,
                position_id: None,
                symbol,
            });
        }
        Ok(issues)
    }

    /// Whether any live exit-like order of the position has fills at the
    /// broker. Broker lookup errors defer the phantom verdict to the next
    /// pass rather than risk a wrong auto-fix.
    async fn has_exit_fill_in_flight(&self, position_id: Uuid) -> Result<bool> {
        let orders = self.orders.list_for_position(position_id).await?;
        for order in orders
            .iter()
            .filter(|o| o.purpose.is_exit_like() && !o.status.is_terminal())
        {
            let Some(broker_id) = &order.broker_order_id else {
                continue;
            };
            match self.broker.get_order(broker_id).await {
                Ok(broker_order) if broker_order.filled_qty > Decimal::ZERO => return Ok(true),
                Ok(_) | Err(BrokerError::OrderNotFound { .. }) => {}
                Err(e) => {
                    warn!(
                        "OrderEngine: exit-leg lookup failed during phantom check ({e}); deferring"
                    );
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Close a phantom locally. No broker order is placed; there is nothing
    /// at the broker to close. Bracket rows are retired alongside.
    pub async fn fix_phantom(&self, position_id: Uuid) -> Result<()> {
        let position = self
            .with_position(position_id, |p| {
                if p.status != PositionStatus::Open {
                    return Ok(());
                }
                p.transition(PositionStatus::Closed, Utc::now())
                    .map_err(|e| anyhow!(e))?;
                p.exit_time = Some(Utc::now());
                p.metadata = serde_json::json!({ "close_reason": "phantom_reconciliation" });
                Ok(())
            })
            .await?;

        self.cancel_open_brackets(position_id).await?;
        info!(
            "OrderEngine: phantom {} closed locally (phantom_reconciliation)",
            position.symbol
        );
        Ok(())
    }

    /// Adopt the broker's quantity for a small drift. The caller has already
    /// confirmed the drift is under the auto-fix ceiling.
    pub async fn fix_qty_mismatch(&self, position_id: Uuid, broker_qty: Decimal) -> Result<()> {
        let position = self
            .with_position(position_id, |p| {
                p.qty = broker_qty;
                p.updated_at = Utc::now();
                Ok(())
            })
            .await?;
        info!(
            "OrderEngine: qty for {} updated to broker truth {}",
            position.symbol, broker_qty
        );
        Ok(())
    }

    /// Sync one local order with broker truth. The broker is authoritative:
    /// when reconciliation and a live callback race, the local row converges
    /// on whatever the broker reports. Returns true if the row changed.
    pub async fn sync_order_with_broker(&self, order_id: Uuid) -> Result<bool> {
        let order = self.orders.get(order_id).await?;
        if order.status.is_terminal() {
            return Ok(false);
        }
        let Some(broker_id) = order.broker_order_id.clone() else {
            return Ok(false);
        };

        let broker_order = match timeout(self.broker_deadline, self.broker.get_order(&broker_id))
            .await
            .map_err(|_| anyhow!("get_order deadline exceeded"))?
        {
            Ok(o) => o,
            Err(BrokerError::OrderNotFound { .. }) => {
                let mut order = self.orders.get(order_id).await?;
                let now = Utc::now();
                match order.status {
                    OrderStatus::SubmittedUnknown => {
                        order.transition(OrderStatus::NotFound, now)?
                    }
                    OrderStatus::Submitted => order.transition(OrderStatus::Expired, now)?,
                    _ => {
                        order.transition(OrderStatus::Cancelled, now)?;
                    }
                }
                order.reason = Some("not found at broker".to_string());
                self.orders.update(&order).await?;
                return Ok(true);
            }
            Err(e) => return Err(anyhow!(e).context("order status sync failed")),
        };

        match broker_order.status {
            OrderStatus::Filled | OrderStatus::PartialFill => {
                if broker_order.filled_qty > order.filled_qty {
                    let price = broker_order
                        .filled_avg_price
                        .unwrap_or(order.limit_price.unwrap_or(Decimal::ZERO));
                    let ts = broker_order.filled_at.unwrap_or_else(Utc::now);
                    self.on_fill(&broker_id, broker_order.filled_qty, price, ts)
                        .await?;
                    return Ok(true);
                }
                Ok(false)
            }
            OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired => {
                let mut order = self.orders.get(order_id).await?;
                let now = Utc::now();
                // Normalize intermediate steps the local machine requires.
                if order.status == OrderStatus::Created
                    || order.status == OrderStatus::SubmittedUnknown
                {
                    let via = if order.status == OrderStatus::Created {
                        OrderStatus::Submitted
                    } else {
                        OrderStatus::Accepted
                    };
                    order.transition(via, now)?;
                }
                if order.status == OrderStatus::Submitted
                    && broker_order.status == OrderStatus::Cancelled
                {
                    order.transition(OrderStatus::Accepted, now)?;
                }
                if order.status.can_transition_to(broker_order.status) {
                    order.transition(broker_order.status, now)?;
                    self.orders.update(&order).await?;
                    return Ok(true);
                }
                warn!(
                    "OrderEngine: cannot converge order {} ({} -> {})",
                    order.id,
                    order.status.as_str(),
                    broker_order.status.as_str()
                );
                Ok(false)
            }
            OrderStatus::Accepted => {
                let mut order = self.orders.get(order_id).await?;
                let now = Utc::now();
                let mut changed = false;
                if order.status == OrderStatus::Created {
                    order.transition(OrderStatus::Submitted, now)?;
                    changed = true;
                }
                if order.status == OrderStatus::Submitted
                    || order.status == OrderStatus::SubmittedUnknown
                {
                    order.transition(OrderStatus::Accepted, now)?;
                    changed = true;
                }
                if changed {
                    self.orders.update(&order).await?;
                }
                Ok(changed)
            }
            _ => Ok(false),
        }
    }

    /// Resolve an order stuck in `submitted_unknown` with no broker id: find
    /// it at the broker by (symbol, qty, side) within the submission window,
    /// or declare it not-found after the grace period.
    pub async fn resolve_unknown_order(
        &self,
        order_id: Uuid,
        grace: chrono::Duration,
    ) -> Result<()> {
        let mut order = self.orders.get(order_id).await?;
        if order.status != OrderStatus::SubmittedUnknown {
            return Ok(());
        }
        if order.broker_order_id.is_some() {
            self.sync_order_with_broker(order_id).await?;
            return Ok(());
        }

        let submitted_at = order.submitted_at.unwrap_or(order.created_at);
        let window_start = submitted_at - chrono::Duration::minutes(5);
        let broker_orders = timeout(
            self.broker_deadline,
            self.broker.list_orders(&[], Some(window_start)),
        )
        .await
        .map_err(|_| anyhow!("list_orders deadline exceeded"))??;

        let matched = broker_orders.into_iter().find(|b| {
            b.symbol.eq_ignore_ascii_case(&order.symbol)
                && b.qty == order.qty
                && b.side == order.side
        });

        match matched {
            Some(broker_order) => {
                info!(
                    "OrderEngine: adopted broker order {} for unknown submit {}",
                    broker_order.broker_order_id, order.id
                );
                order.assign_broker_id(&broker_order.broker_order_id)?;
                order.transition(OrderStatus::Accepted, Utc::now())?;
                self.orders.update(&order).await?;
                self.sync_order_with_broker(order_id).await?;
            }
            None if Utc::now() - submitted_at > grace => {
                order.transition(OrderStatus::NotFound, Utc::now())?;
                order.reason = Some("unknown submit never reached broker".to_string());
                self.orders.update(&order).await?;
                // An entry that never reached the broker leaves its position
                // stillborn.
                if let Some(position_id) = order.position_id
                    && order.purpose == crate::domain::trading::types::OrderPurpose::Entry
                {
                    self.with_position(position_id, |p| {
                        if p.status == PositionStatus::Pending {
                            p.transition(PositionStatus::Cancelled, Utc::now())
                                .map_err(|e| anyhow!(e))?;
                        }
                        Ok(())
                    })
                    .await?;
                }
            }
            None => {
                info!(
                    "OrderEngine: unknown submit {} still within grace, deferring",
                    order.id
                );
            }
        }
        Ok(())
    }
}
