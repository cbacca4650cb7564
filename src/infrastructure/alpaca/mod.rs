//! Alpaca REST adapter. The only module that knows Alpaca's wire encoding;
//! everything else sees the `BrokerAdapter` contract.

mod common;
mod execution;
mod market_data;

pub use common::round_to_tick;

use crate::domain::errors::BrokerError;
use crate::domain::ports::{
    AccountSnapshot, AssetInfo, BarSnapshot, BracketIds, BrokerAdapter, BrokerOrder,
    BrokerPosition, CloseResult, EntrySpec, Quote,
};
use crate::domain::trading::types::{OrderSide, OrderStatus, TimeInForce};
use crate::infrastructure::core::breaker::PollBreaker;
use crate::infrastructure::core::http::BrokerHttp;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;

/// Alpaca market-data batch limit for snapshot/bar requests.
pub const BAR_BATCH_SIZE: usize = 100;

pub struct AlpacaBroker {
    pub(crate) http: BrokerHttp,
    pub(crate) api_key: String,
    pub(crate) api_secret: String,
    pub(crate) base_url: String,
    pub(crate) data_url: String,
    pub(crate) tick_decimals: u32,
    pub(crate) poll_breaker: PollBreaker,
}

impl AlpacaBroker {
    pub fn new(
        api_key: String,
        api_secret: String,
        base_url: String,
        data_url: String,
        tick_decimals: u32,
        deadline: Duration,
    ) -> Self {
        Self {
            http: BrokerHttp::new(deadline),
            api_key,
            api_secret,
            base_url,
            data_url,
            tick_decimals,
            poll_breaker: PollBreaker::new("alpaca", 5, Duration::from_secs(30)),
        }
    }
}

#[async_trait]
impl BrokerAdapter for AlpacaBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        // A successful account read proves the credentials.
        self.fetch_account().await.map(|_| ())
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        self.poll_breaker.check()?;
        let result = self.fetch_quote(symbol).await;
        self.note_poll(&result);
        result
    }

    async fn get_account(&self) -> Result<AccountSnapshot, BrokerError> {
        self.poll_breaker.check()?;
        let result = self.fetch_account().await;
        self.note_poll(&result);
        result
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.poll_breaker.check()?;
        let result = self.fetch_positions().await;
        self.note_poll(&result);
        result
    }

    async fn list_orders(
        &self,
        statuses: &[OrderStatus],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<BrokerOrder>, BrokerError> {
        self.poll_breaker.check()?;
        let result = self.fetch_orders(statuses, since).await;
        self.note_poll(&result);
        result
    }

    async fn list_assets(&self) -> Result<Vec<AssetInfo>, BrokerError> {
        self.poll_breaker.check()?;
        let result = self.fetch_assets().await;
        self.note_poll(&result);
        result
    }

    async fn latest_bars(&self, symbols: &[String]) -> Result<Vec<BarSnapshot>, BrokerError> {
        self.poll_breaker.check()?;
        let result = self.fetch_latest_bars(symbols).await;
        self.note_poll(&result);
        result
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
        self.do_submit_bracket(
            symbol,
            qty,
            side,
            time_in_force,
            entry,
            stop_loss_price,
            take_profit_price,
        )
        .await
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        self.do_cancel_order(broker_order_id).await
    }

    async fn close_position(
        &self,
        symbol: &str,
        reason: Option<&str>,
    ) -> Result<CloseResult, BrokerError> {
        self.do_close_position(symbol, reason).await
    }

    async fn close_all_positions(&self) -> Result<Vec<CloseResult>, BrokerError> {
        self.do_close_all().await
    }

    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder, BrokerError> {
        self.poll_breaker.check()?;
        let result = self.fetch_order(broker_order_id).await;
        // An order that is genuinely absent is an answer, not an outage.
        match &result {
            Err(BrokerError::OrderNotFound { .. }) => self.poll_breaker.record_success(),
            _ => self.note_poll(&result),
        }
        result
    }
}

impl AlpacaBroker {
    fn note_poll<T>(&self, result: &Result<T, BrokerError>) {
        match result {
            Ok(_) => self.poll_breaker.record_success(),
            Err(BrokerError::InvalidPrice { .. })
            | Err(BrokerError::InsufficientBuyingPower { .. })
            | Err(BrokerError::OrderNotFound { .. }) => self.poll_breaker.record_success(),
            Err(_) => self.poll_breaker.record_failure(),
        }
    }
}
