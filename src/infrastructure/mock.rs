//! Scriptable in-memory broker used by tests and paper sessions. Quotes,
//! account state, fills and failures are injected by the test; the adapter
//! behaves like a tiny matching venue with manual fill control.

use crate::domain::errors::BrokerError;
use crate::domain::ports::{
    AccountSnapshot, AssetInfo, BarSnapshot, BracketIds, BrokerAdapter, BrokerOrder,
    BrokerPosition, CloseResult, EntrySpec, Quote,
};
use crate::domain::trading::types::{OrderSide, OrderStatus, TimeInForce};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;

/// Failure the next submit call should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Unavailable,
    InvalidPrice,
    InsufficientBuyingPower,
}

impl InjectedFailure {
    fn to_error(self, symbol: &str) -> BrokerError {
        match self {
            InjectedFailure::Unavailable => BrokerError::Unavailable {
                reason: "injected outage".to_string(),
            },
            InjectedFailure::InvalidPrice => BrokerError::InvalidPrice {
                symbol: symbol.to_string(),
                price: Decimal::ZERO,
            },
            InjectedFailure::InsufficientBuyingPower => BrokerError::InsufficientBuyingPower {
                need: Decimal::ZERO,
                available: Decimal::ZERO,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmittedBracket {
    pub symbol: String,
    pub qty: Decimal,
    pub side: OrderSide,
    pub time_in_force: TimeInForce,
    pub limit_price: Option<Decimal>,
    pub stop_loss_price: Decimal,
    pub take_profit_price: Decimal,
    pub ids: BracketIds,
}

#[derive(Default)]
struct MockState {
    quotes: HashMap<String, Decimal>,
    account: Option<AccountSnapshot>,
    assets: Vec<AssetInfo>,
    bars: Vec<BarSnapshot>,
    positions: HashMap<String, BrokerPosition>,
    orders: HashMap<String, BrokerOrder>,
    brackets: Vec<SubmittedBracket>,
    close_requests: Vec<String>,
    next_submit_failure: Option<InjectedFailure>,
    broker_down: bool,
    next_id: u64,
}

pub struct MockBroker {
    state: Mutex<MockState>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock broker lock poisoned")
    }

    fn outage() -> BrokerError {
        BrokerError::Unavailable {
            reason: "injected outage".to_string(),
        }
    }

    pub fn set_quote(&self, symbol: &str, price: Decimal) {
        self.lock().quotes.insert(symbol.to_uppercase(), price);
    }

    pub fn set_account(&self, account: AccountSnapshot) {
        self.lock().account = Some(account);
    }

    pub fn set_assets(&self, assets: Vec<AssetInfo>) {
        self.lock().assets = assets;
    }

    pub fn set_bars(&self, bars: Vec<BarSnapshot>) {
        self.lock().bars = bars;
    }

    pub fn set_broker_position(&self, position: BrokerPosition) {
        self.lock()
            .positions
            .insert(position.symbol.to_uppercase(), position);
    }

    pub fn remove_broker_position(&self, symbol: &str) {
        self.lock().positions.remove(&symbol.to_uppercase());
    }

    pub fn fail_next_submit(&self, failure: InjectedFailure) {
        self.lock().next_submit_failure = Some(failure);
    }

    pub fn set_broker_down(&self, down: bool) {
        self.lock().broker_down = down;
    }

    pub fn submitted_brackets(&self) -> Vec<SubmittedBracket> {
        self.lock().brackets.clone()
    }

    pub fn close_requests(&self) -> Vec<String> {
        self.lock().close_requests.clone()
    }

    pub fn order_status(&self, broker_order_id: &str) -> Option<OrderStatus> {
        self.lock().orders.get(broker_order_id).map(|o| o.status)
    }

    /// Drive a fill from the test. Also maintains the broker-side position
    /// book the way a venue would.
    pub fn fill_order(&self, broker_order_id: &str, fill_price: Decimal, ts: DateTime<Utc>) {
        let mut state = self.lock();
        let Some(order) = state.orders.get_mut(broker_order_id) else {
            return;
        };
        order.status = OrderStatus::Filled;
        order.filled_qty = order.qty;
        order.filled_avg_price = Some(fill_price);
        order.filled_at = Some(ts);
        order.updated_at = Some(ts);

        let symbol = order.symbol.clone();
        let qty = order.qty;
        let side = order.side;
        match side {
            OrderSide::Buy => {
                let entry = state.positions.entry(symbol.clone()).or_insert(BrokerPosition {
                    symbol,
                    qty: Decimal::ZERO,
                    avg_entry: fill_price,
                    market_value: Decimal::ZERO,
                    unrealized_pl: Decimal::ZERO,
                });
                entry.qty += qty;
                entry.market_value = entry.qty * fill_price;
            }
            OrderSide::Sell => {
                if let Some(existing) = state.positions.get_mut(&symbol) {
                    existing.qty -= qty;
                    if existing.qty <= Decimal::ZERO {
                        state.positions.remove(&symbol);
                    }
                }
            }
        }
    }

    pub fn cancel_broker_order(&self, broker_order_id: &str) {
        let mut state = self.lock();
        if let Some(order) = state.orders.get_mut(broker_order_id) {
            order.status = OrderStatus::Cancelled;
            order.updated_at = Some(Utc::now());
        }
    }

    fn mint_order(
        state: &mut MockState,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> BrokerOrder {
        state.next_id += 1;
        let order = BrokerOrder {
            broker_order_id: format!("mock-{}", state.next_id),
            client_order_id: None,
            symbol: symbol.to_uppercase(),
            side,
            qty,
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            status: OrderStatus::Accepted,
            submitted_at: Some(Utc::now()),
            filled_at: None,
            updated_at: Some(Utc::now()),
        };
        state
            .orders
            .insert(order.broker_order_id.clone(), order.clone());
        order
    }
}

#[async_trait]
impl BrokerAdapter for MockBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        if self.lock().broker_down {
            return Err(Self::outage());
        }
        Ok(())
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        let state = self.lock();
        if state.broker_down {
            return Err(Self::outage());
        }
        let last = state
            .quotes
            .get(&symbol.to_uppercase())
            .copied()
            .ok_or_else(|| BrokerError::Transient {
                reason: format!("no quote for {symbol}"),
            })?;
        Ok(Quote {
            symbol: symbol.to_uppercase(),
            bid: last,
            ask: last,
            last,
            ts: Utc::now(),
        })
    }

    async fn get_account(&self) -> Result<AccountSnapshot, BrokerError> {
        let state = self.lock();
        if state.broker_down {
            return Err(Self::outage());
        }
        Ok(state.account.clone().unwrap_or(AccountSnapshot {
            cash: Decimal::from(100_000),
            buying_power: Decimal::from(200_000),
            equity: Decimal::from(100_000),
            day_trade_count: 0,
        }))
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let state = self.lock();
        if state.broker_down {
            return Err(Self::outage());
        }
        Ok(state.positions.values().cloned().collect())
    }

    async fn list_orders(
        &self,
        statuses: &[OrderStatus],
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<BrokerOrder>, BrokerError> {
        let state = self.lock();
        if state.broker_down {
            return Err(Self::outage());
        }
        Ok(state
            .orders
            .values()
            .filter(|o| statuses.is_empty() || statuses.contains(&o.status))
            .cloned()
            .collect())
    }

    async fn list_assets(&self) -> Result<Vec<AssetInfo>, BrokerError> {
        let state = self.lock();
        if state.broker_down {
            return Err(Self::outage());
        }
        Ok(state.assets.clone())
    }

    async fn latest_bars(&self, symbols: &[String]) -> Result<Vec<BarSnapshot>, BrokerError> {
        let state = self.lock();
        if state.broker_down {
            return Err(Self::outage());
        }
        let wanted: Vec<String> = symbols.iter().map(|s| s.to_uppercase()).collect();
        Ok(state
            .bars
            .iter()
            .filter(|b| wanted.contains(&b.symbol))
            .cloned()
            .collect())
    }

    async fn submit_bracket(
        &self,
        symbol: &str,
        qty: Decimal,
        side: OrderSide,
        time_in_force: TimeInForce,
        entry: EntrySpec,
        stop_loss_price: Decimal,
        take_profit_price: Decimal,
    ) -> Result<BracketIds, BrokerError> {
        let mut state = self.lock();
        if state.broker_down {
            return Err(Self::outage());
        }
        if let Some(failure) = state.next_submit_failure.take() {
            return Err(failure.to_error(symbol));
        }

        let entry_order = Self::mint_order(&mut state, symbol, side, qty);
        let exit_side = match side {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        };
        let stop_order = Self::mint_order(&mut state, symbol, exit_side, qty);
        let target_order = Self::mint_order(&mut state, symbol, exit_side, qty);

        let ids = BracketIds {
            entry_order_id: entry_order.broker_order_id,
            stop_loss_order_id: stop_order.broker_order_id,
            take_profit_order_id: target_order.broker_order_id,
        };
        state.brackets.push(SubmittedBracket {
            symbol: symbol.to_uppercase(),
            qty,
            side,
            time_in_force,
            limit_price: entry.limit_price,
            stop_loss_price,
            take_profit_price,
            ids: ids.clone(),
        });
        Ok(ids)
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        match state.orders.get_mut(broker_order_id) {
            Some(order) => {
                if !order.status.is_terminal() {
                    order.status = OrderStatus::Cancelled;
                    order.updated_at = Some(Utc::now());
                }
                Ok(())
            }
            None => Err(BrokerError::OrderNotFound {
                broker_order_id: broker_order_id.to_string(),
            }),
        }
    }

    async fn close_position(
        &self,
        symbol: &str,
        _reason: Option<&str>,
    ) -> Result<CloseResult, BrokerError> {
        let mut state = self.lock();
        if state.broker_down {
            return Err(Self::outage());
        }
        let symbol = symbol.to_uppercase();
        state.close_requests.push(symbol.clone());

        let Some(position) = state.positions.remove(&symbol) else {
            // Already flat: idempotent success.
            return Ok(CloseResult {
                symbol,
                success: true,
                broker_order_id: None,
                error: None,
            });
        };
        let exit_side = if position.qty >= Decimal::ZERO {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let order = Self::mint_order(&mut state, &symbol, exit_side, position.qty.abs());
        Ok(CloseResult {
            symbol,
            success: true,
            broker_order_id: Some(order.broker_order_id),
            error: None,
        })
    }

    async fn close_all_positions(&self) -> Result<Vec<CloseResult>, BrokerError> {
        let symbols: Vec<String> = self.lock().positions.keys().cloned().collect();
        let mut results = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            results.push(self.close_position(&symbol, Some("close_all")).await?);
        }
        Ok(results)
    }

    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder, BrokerError> {
        let state = self.lock();
        state
            .orders
            .get(broker_order_id)
            .cloned()
            .ok_or_else(|| BrokerError::OrderNotFound {
                broker_order_id: broker_order_id.to_string(),
            })
    }
}
