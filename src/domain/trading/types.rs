use crate::domain::errors::EngineError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(OrderSide::Buy),
            "sell" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderClass {
    Simple,
    Bracket,
    Oco,
    Oto,
}

impl OrderClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderClass::Simple => "simple",
            OrderClass::Bracket => "bracket",
            OrderClass::Oco => "oco",
            OrderClass::Oto => "oto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simple" => Some(OrderClass::Simple),
            "bracket" => Some(OrderClass::Bracket),
            "oco" => Some(OrderClass::Oco),
            "oto" => Some(OrderClass::Oto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderPurpose {
    Entry,
    Exit,
    StopLoss,
    TakeProfit,
}

impl OrderPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderPurpose::Entry => "entry",
            OrderPurpose::Exit => "exit",
            OrderPurpose::StopLoss => "stop_loss",
            OrderPurpose::TakeProfit => "take_profit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(OrderPurpose::Entry),
            "exit" => Some(OrderPurpose::Exit),
            "stop_loss" => Some(OrderPurpose::StopLoss),
            "take_profit" => Some(OrderPurpose::TakeProfit),
            _ => None,
        }
    }

    /// Bracket legs are the only purposes that hang off a parent order.
    pub fn is_bracket_leg(&self) -> bool {
        matches!(self, OrderPurpose::StopLoss | OrderPurpose::TakeProfit)
    }

    /// Whether a fill of this order reduces the position.
    pub fn is_exit_like(&self) -> bool {
        matches!(
            self,
            OrderPurpose::Exit | OrderPurpose::StopLoss | OrderPurpose::TakeProfit
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop",
            OrderType::StopLimit => "stop_limit",
            OrderType::TrailingStop => "trailing_stop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "market" => Some(OrderType::Market),
            "limit" => Some(OrderType::Limit),
            "stop" => Some(OrderType::Stop),
            "stop_limit" => Some(OrderType::StopLimit),
            "trailing_stop" => Some(OrderType::TrailingStop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Day,
    Gtc,
    Ioc,
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Day => "day",
            TimeInForce::Gtc => "gtc",
            TimeInForce::Ioc => "ioc",
            TimeInForce::Fok => "fok",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(TimeInForce::Day),
            "gtc" => Some(TimeInForce::Gtc),
            "ioc" => Some(TimeInForce::Ioc),
            "fok" => Some(TimeInForce::Fok),
            _ => None,
        }
    }
}

/// Order lifecycle states. `SubmittedUnknown` marks an order whose submission
/// failed ambiguously (timeout after the request left the process); only
/// reconciliation against broker truth moves it out of that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Created,
    Submitted,
    SubmittedUnknown,
    Accepted,
    PartialFill,
    Filled,
    Cancelled,
    Rejected,
    Expired,
    NotFound,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Submitted => "submitted",
            OrderStatus::SubmittedUnknown => "submitted_unknown",
            OrderStatus::Accepted => "accepted",
            OrderStatus::PartialFill => "partial_fill",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
            OrderStatus::NotFound => "not_found",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(OrderStatus::Created),
            "submitted" => Some(OrderStatus::Submitted),
            "submitted_unknown" => Some(OrderStatus::SubmittedUnknown),
            "accepted" => Some(OrderStatus::Accepted),
            "partial_fill" => Some(OrderStatus::PartialFill),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "rejected" => Some(OrderStatus::Rejected),
            "expired" => Some(OrderStatus::Expired),
            "not_found" => Some(OrderStatus::NotFound),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::NotFound
        )
    }

    /// The order state machine. Transitions not listed here are invalid;
    /// statuses only move toward a terminal state.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match self {
            Created => matches!(next, Submitted | SubmittedUnknown | Rejected),
            Submitted => matches!(next, Accepted | Rejected | Expired),
            SubmittedUnknown => matches!(next, Accepted | Rejected | NotFound),
            Accepted => matches!(next, PartialFill | Filled | Cancelled | Expired),
            PartialFill => matches!(next, PartialFill | Filled | Cancelled),
            Filled | Cancelled | Rejected | Expired | NotFound => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "long" => Some(PositionSide::Long),
            "short" => Some(PositionSide::Short),
            _ => None,
        }
    }

    /// Side-mapping table: entry of long is a buy, entry of short is a sell.
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Exit of long is a sell, exit of short is a buy. Bracket legs are exits.
    pub fn exit_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The order side the mapping table requires for a given purpose.
pub fn expected_order_side(position_side: PositionSide, purpose: OrderPurpose) -> OrderSide {
    if purpose.is_exit_like() {
        position_side.exit_order_side()
    } else {
        position_side.entry_order_side()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Pending,
    Open,
    Closed,
    Cancelled,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "pending",
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
            PositionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PositionStatus::Pending),
            "open" => Some(PositionStatus::Open),
            "closed" => Some(PositionStatus::Closed),
            "cancelled" => Some(PositionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        match self {
            Pending => matches!(next, Open | Cancelled),
            Open => matches!(next, Closed),
            Closed | Cancelled => false,
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted order row. Positions never carry broker order ids; everything
/// the broker knows about an order lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub cycle_id: Uuid,
    pub security_id: i64,
    pub symbol: String,
    pub position_id: Option<Uuid>,
    pub parent_order_id: Option<Uuid>,
    pub class: OrderClass,
    pub purpose: OrderPurpose,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub qty: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub broker_order_id: Option<String>,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub filled_avg_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub metadata: serde_json::Value,
}

impl Order {
    /// Entry order for a new position. The side is derived from the position
    /// side; callers cannot produce an inverted mapping.
    #[allow(clippy::too_many_arguments)]
    pub fn entry(
        cycle_id: Uuid,
        security_id: i64,
        symbol: &str,
        position_id: Uuid,
        position_side: PositionSide,
        order_type: OrderType,
        time_in_force: TimeInForce,
        qty: Decimal,
        limit_price: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cycle_id,
            security_id,
            symbol: symbol.to_string(),
            position_id: Some(position_id),
            parent_order_id: None,
            class: OrderClass::Bracket,
            purpose: OrderPurpose::Entry,
            side: position_side.entry_order_side(),
            order_type,
            time_in_force,
            qty,
            limit_price,
            stop_price: None,
            broker_order_id: None,
            status: OrderStatus::Created,
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            created_at: now,
            submitted_at: None,
            accepted_at: None,
            filled_at: None,
            cancelled_at: None,
            expired_at: None,
            updated_at: now,
            reason: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Market exit order for an open position; side derived from position side.
    pub fn exit_for(position: &Position, reason: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            cycle_id: position.cycle_id,
            security_id: position.security_id,
            symbol: position.symbol.clone(),
            position_id: Some(position.id),
            parent_order_id: None,
            class: OrderClass::Simple,
            purpose: OrderPurpose::Exit,
            side: position.side.exit_order_side(),
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
            qty: position.qty,
            limit_price: None,
            stop_price: None,
            broker_order_id: None,
            status: OrderStatus::Created,
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            created_at: now,
            submitted_at: None,
            accepted_at: None,
            filled_at: None,
            cancelled_at: None,
            expired_at: None,
            updated_at: now,
            reason: Some(reason.to_string()),
            metadata: serde_json::Value::Null,
        }
    }

    /// The two bracket legs for an entry order. Both are GTC: DAY legs would
    /// expire overnight and orphan the position.
    pub fn bracket_children_for(
        position: &Position,
        entry: &Order,
        stop_loss_price: Decimal,
        take_profit_price: Decimal,
        now: DateTime<Utc>,
    ) -> (Order, Order) {
        let child = |purpose: OrderPurpose, order_type: OrderType| Order {
            id: Uuid::new_v4(),
            cycle_id: position.cycle_id,
            security_id: position.security_id,
            symbol: position.symbol.clone(),
            position_id: Some(position.id),
            parent_order_id: Some(entry.id),
            class: OrderClass::Bracket,
            purpose,
            side: position.side.exit_order_side(),
            order_type,
            time_in_force: TimeInForce::Gtc,
            qty: entry.qty,
            limit_price: None,
            stop_price: None,
            broker_order_id: None,
            status: OrderStatus::Created,
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            created_at: now,
            submitted_at: None,
            accepted_at: None,
            filled_at: None,
            cancelled_at: None,
            expired_at: None,
            updated_at: now,
            reason: None,
            metadata: serde_json::Value::Null,
        };

        let mut stop = child(OrderPurpose::StopLoss, OrderType::Stop);
        stop.stop_price = Some(stop_loss_price);

        let mut target = child(OrderPurpose::TakeProfit, OrderType::Limit);
        target.limit_price = Some(take_profit_price);

        (stop, target)
    }

    /// Validate an order row against the side-mapping table. Rows that violate
    /// it (inherited data) are surfaced, never silently corrected.
    pub fn validate_side_mapping(&self, position_side: PositionSide) -> Result<(), EngineError> {
        let expected = expected_order_side(position_side, self.purpose);
        if self.side != expected {
            return Err(EngineError::SideMappingViolation {
                position_side: position_side.as_str().to_string(),
                purpose: self.purpose.as_str().to_string(),
                side: self.side.as_str().to_string(),
            });
        }
        Ok(())
    }

    pub fn transition(&mut self, next: OrderStatus, now: DateTime<Utc>) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidOrderTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        match next {
            OrderStatus::Submitted | OrderStatus::SubmittedUnknown => self.submitted_at = Some(now),
            OrderStatus::Accepted => self.accepted_at = Some(now),
            OrderStatus::Filled => self.filled_at = Some(now),
            OrderStatus::Cancelled => self.cancelled_at = Some(now),
            OrderStatus::Expired => self.expired_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    /// Set the broker id exactly once.
    pub fn assign_broker_id(&mut self, broker_order_id: &str) -> Result<(), EngineError> {
        if self.broker_order_id.is_some() {
            return Err(EngineError::BrokerIdAlreadySet {
                order_id: self.id.to_string(),
            });
        }
        self.broker_order_id = Some(broker_order_id.to_string());
        Ok(())
    }

    /// Record a (possibly partial) fill: volume-weighted average price,
    /// monotone filled_qty, and the matching status transition.
    pub fn apply_fill(
        &mut self,
        fill_qty: Decimal,
        fill_price: Decimal,
        ts: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let new_filled = self.filled_qty + fill_qty;
        if new_filled > self.qty {
            return Err(EngineError::OverFill {
                filled: new_filled,
                qty: self.qty,
            });
        }

        let prior_notional = self.filled_avg_price.unwrap_or(Decimal::ZERO) * self.filled_qty;
        self.filled_avg_price = if new_filled.is_zero() {
            None
        } else {
            Some((prior_notional + fill_price * fill_qty) / new_filled)
        };
        self.filled_qty = new_filled;

        let next = if new_filled == self.qty {
            OrderStatus::Filled
        } else {
            OrderStatus::PartialFill
        };
        self.transition(next, ts)
    }
}

/// A persisted position row. A position is not an order: it has exactly one
/// entry order, zero or more exits, and up to two OCO-linked bracket legs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub cycle_id: Uuid,
    pub security_id: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub qty: Decimal,
    pub entry_price: Option<Decimal>,
    pub entry_time: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub current_price: Option<Decimal>,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub risk_amount: Decimal,
    pub realized_pnl: Decimal,
    pub realized_pnl_pct: Option<Decimal>,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_pct: Option<Decimal>,
    pub status: PositionStatus,
    pub pattern: Option<String>,
    pub catalyst: Option<String>,
    pub high_watermark: Option<Decimal>,
    pub entry_volume: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cycle_id: Uuid,
        security_id: i64,
        symbol: &str,
        side: PositionSide,
        qty: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        risk_amount: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cycle_id,
            security_id,
            symbol: symbol.to_uppercase(),
            side,
            qty,
            entry_price: None,
            entry_time: None,
            exit_price: None,
            exit_time: None,
            current_price: None,
            stop_loss,
            take_profit,
            risk_amount,
            realized_pnl: Decimal::ZERO,
            realized_pnl_pct: None,
            unrealized_pnl: Decimal::ZERO,
            unrealized_pnl_pct: None,
            status: PositionStatus::Pending,
            pattern: None,
            catalyst: None,
            high_watermark: None,
            entry_volume: None,
            created_at: now,
            updated_at: now,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn transition(
        &mut self,
        next: PositionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidPositionTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Entry fill: pending -> open, seed entry price and high watermark.
    pub fn open_on_fill(
        &mut self,
        entry_price: Decimal,
        ts: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.transition(PositionStatus::Open, ts)?;
        self.entry_price = Some(entry_price);
        self.entry_time = Some(ts);
        self.current_price = Some(entry_price);
        self.high_watermark = Some(entry_price);
        Ok(())
    }

    /// Exit fill: realize P&L incrementally, volume-weighted across fills.
    /// Closes the position once the full quantity has exited.
    pub fn apply_exit_fill(
        &mut self,
        fill_qty: Decimal,
        fill_price: Decimal,
        exited_so_far: Decimal,
        ts: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let entry = self.entry_price.unwrap_or(Decimal::ZERO);
        let increment = match self.side {
            PositionSide::Long => (fill_price - entry) * fill_qty,
            PositionSide::Short => (entry - fill_price) * fill_qty,
        };
        self.realized_pnl += increment;

        let total_exited = exited_so_far + fill_qty;
        let prior_notional = self.exit_price.unwrap_or(Decimal::ZERO) * exited_so_far;
        self.exit_price = if total_exited.is_zero() {
            None
        } else {
            Some((prior_notional + fill_price * fill_qty) / total_exited)
        };

        if total_exited >= self.qty {
            self.transition(PositionStatus::Closed, ts)?;
            self.exit_time = Some(ts);
            self.unrealized_pnl = Decimal::ZERO;
            self.unrealized_pnl_pct = Some(Decimal::ZERO);
            if !entry.is_zero() && !self.qty.is_zero() {
                self.realized_pnl_pct =
                    Some(self.realized_pnl / (entry * self.qty) * Decimal::from(100));
            }
        }
        self.updated_at = ts;
        Ok(())
    }

    /// Mark-to-market with the latest quote; maintains the high watermark.
    pub fn mark_price(&mut self, price: Decimal, now: DateTime<Utc>) {
        self.current_price = Some(price);
        self.high_watermark = Some(match self.high_watermark {
            Some(hwm) if hwm >= price => hwm,
            _ => price,
        });
        if let Some(entry) = self.entry_price
            && !entry.is_zero()
        {
            self.unrealized_pnl = match self.side {
                PositionSide::Long => (price - entry) * self.qty,
                PositionSide::Short => (entry - price) * self.qty,
            };
            self.unrealized_pnl_pct =
                Some(self.unrealized_pnl / (entry * self.qty) * Decimal::from(100));
        }
        self.updated_at = now;
    }
}
