use super::AlpacaBroker;
use super::common::{
    KEY_HEADER, SECRET_HEADER, map_http_error, map_order_status, map_transport_error,
    round_to_tick,
};
use crate::domain::errors::BrokerError;
use crate::domain::ports::{
    AccountSnapshot, BracketIds, BrokerOrder, BrokerPosition, CloseResult, EntrySpec,
};
use crate::domain::trading::types::{OrderSide, OrderStatus, OrderType, TimeInForce};
use crate::infrastructure::core::http::with_query;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct AlpacaAccount {
    cash: String,
    buying_power: String,
    equity: String,
    daytrade_count: i64,
}

#[derive(Debug, Deserialize)]
struct AlpacaPosition {
    symbol: String,
    qty: String,
    avg_entry_price: String,
    market_value: String,
    unrealized_pl: String,
}

#[derive(Debug, Serialize)]
struct BracketRequest {
    symbol: String,
    qty: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    time_in_force: String,
    order_class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<String>,
    take_profit: TakeProfitLeg,
    stop_loss: StopLossLeg,
}

#[derive(Debug, Serialize)]
struct TakeProfitLeg {
    limit_price: String,
}

#[derive(Debug, Serialize)]
struct StopLossLeg {
    stop_price: String,
}

#[derive(Debug, Deserialize)]
struct AlpacaOrder {
    id: String,
    client_order_id: Option<String>,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    status: String,
    qty: Option<String>,
    filled_qty: Option<String>,
    filled_avg_price: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
    filled_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    legs: Vec<AlpacaOrder>,
}

fn parse_decimal(raw: &Option<String>) -> Decimal {
    raw.as_deref()
        .and_then(|s| Decimal::from_str(s).ok())
        .unwrap_or(Decimal::ZERO)
}

fn map_broker_order(order: &AlpacaOrder) -> BrokerOrder {
    BrokerOrder {
        broker_order_id: order.id.clone(),
        client_order_id: order.client_order_id.clone(),
        symbol: order.symbol.clone(),
        side: OrderSide::parse(&order.side).unwrap_or(OrderSide::Buy),
        qty: parse_decimal(&order.qty),
        filled_qty: parse_decimal(&order.filled_qty),
        filled_avg_price: order
            .filled_avg_price
            .as_deref()
            .and_then(|s| Decimal::from_str(s).ok()),
        status: map_order_status(&order.status),
        submitted_at: order.submitted_at,
        filled_at: order.filled_at,
        updated_at: order.updated_at,
    }
}

impl AlpacaBroker {
    pub(super) async fn fetch_account(&self) -> Result<AccountSnapshot, BrokerError> {
        let url = format!("{}/v2/account", self.base_url);
        let resp = self
            .http
            .reads
            .get(&url)
            .header(KEY_HEADER, &self.api_key)
            .header(SECRET_HEADER, &self.api_secret)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        let body = resp.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_http_error(status, &body, "account"));
        }

        let account: AlpacaAccount =
            serde_json::from_str(&body).map_err(|e| BrokerError::Transient {
                reason: format!("Failed to decode account: {e}"),
            })?;

        Ok(AccountSnapshot {
            cash: Decimal::from_str(&account.cash).unwrap_or(Decimal::ZERO),
            buying_power: Decimal::from_str(&account.buying_power).unwrap_or(Decimal::ZERO),
            equity: Decimal::from_str(&account.equity).unwrap_or(Decimal::ZERO),
            day_trade_count: account.daytrade_count.max(0) as u64,
        })
    }

    pub(super) async fn fetch_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let url = format!("{}/v2/positions", self.base_url);
        let resp = self
            .http
            .reads
            .get(&url)
            .header(KEY_HEADER, &self.api_key)
            .header(SECRET_HEADER, &self.api_secret)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        let body = resp.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_http_error(status, &body, "positions"));
        }

        let positions: Vec<AlpacaPosition> =
            serde_json::from_str(&body).map_err(|e| BrokerError::Transient {
                reason: format!("Failed to decode positions: {e}"),
            })?;

        Ok(positions
            .into_iter()
            .map(|p| BrokerPosition {
                symbol: p.symbol,
                qty: Decimal::from_str(&p.qty).unwrap_or(Decimal::ZERO),
                avg_entry: Decimal::from_str(&p.avg_entry_price).unwrap_or(Decimal::ZERO),
                market_value: Decimal::from_str(&p.market_value).unwrap_or(Decimal::ZERO),
                unrealized_pl: Decimal::from_str(&p.unrealized_pl).unwrap_or(Decimal::ZERO),
            })
            .collect())
    }

    pub(super) async fn fetch_orders(
        &self,
        statuses: &[OrderStatus],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<BrokerOrder>, BrokerError> {
        // Alpaca filters on open/closed/all; the finer filter happens here.
        let bucket = if statuses.iter().all(|s| s.is_terminal()) {
            "closed"
        } else {
            "all"
        };
        let mut params: Vec<(String, String)> = vec![
            ("status".to_string(), bucket.to_string()),
            ("limit".to_string(), "500".to_string()),
        ];
        if let Some(since) = since {
            params.push(("after".to_string(), since.to_rfc3339()));
        }
        let url = with_query(&format!("{}/v2/orders", self.base_url), &params);

        let resp = self
            .http
            .reads
            .get(&url)
            .header(KEY_HEADER, &self.api_key)
            .header(SECRET_HEADER, &self.api_secret)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        let body = resp.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_http_error(status, &body, "orders"));
        }

        let orders: Vec<AlpacaOrder> =
            serde_json::from_str(&body).map_err(|e| BrokerError::Transient {
                reason: format!("Failed to decode orders: {e}"),
            })?;

        let wanted: Vec<BrokerOrder> = orders
            .iter()
            .map(map_broker_order)
            .filter(|o| statuses.is_empty() || statuses.contains(&o.status))
            .collect();
        Ok(wanted)
    }

    pub(super) async fn fetch_order(&self, broker_order_id: &str) -> Result<BrokerOrder, BrokerError> {
        let url = format!("{}/v2/orders/{}", self.base_url, broker_order_id);
        let resp = self
            .http
            .reads
            .get(&url)
            .header(KEY_HEADER, &self.api_key)
            .header(SECRET_HEADER, &self.api_secret)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        let body = resp.text().await.map_err(map_transport_error)?;
        if status.as_u16() == 404 {
            return Err(BrokerError::OrderNotFound {
                broker_order_id: broker_order_id.to_string(),
            });
        }
        if !status.is_success() {
            return Err(map_http_error(status, &body, broker_order_id));
        }

        let order: AlpacaOrder =
            serde_json::from_str(&body).map_err(|e| BrokerError::Transient {
                reason: format!("Failed to decode order: {e}"),
            })?;
        Ok(map_broker_order(&order))
    }

    /// Submit an entry plus OCO-linked stop/target legs in one request.
    ///
    /// This broker ties the legs' time-in-force to the parent, so the whole
    /// bracket is submitted GTC whenever the legs must be GTC (always); a DAY
    /// bracket would expire its legs overnight and orphan the position.
    pub(super) async fn do_submit_bracket(
        &self,
        symbol: &str,
        qty: Decimal,
        side: OrderSide,
        time_in_force: TimeInForce,
        entry: EntrySpec,
        stop_loss_price: Decimal,
        take_profit_price: Decimal,
    ) -> Result<BracketIds, BrokerError> {
        if time_in_force != TimeInForce::Gtc {
            info!(
                "AlpacaBroker: entry requested {} but bracket legs require gtc; submitting gtc",
                time_in_force.as_str()
            );
        }

        let limit_price = entry
            .limit_price
            .map(|p| round_to_tick(p, self.tick_decimals));
        let request = BracketRequest {
            symbol: symbol.to_uppercase(),
            qty: qty.to_string(),
            side: side.as_str().to_string(),
            order_type: match entry.order_type {
                OrderType::Limit => "limit".to_string(),
                _ => "market".to_string(),
            },
            time_in_force: "gtc".to_string(),
            order_class: "bracket".to_string(),
            limit_price: limit_price.map(|p| p.to_string()),
            take_profit: TakeProfitLeg {
                limit_price: round_to_tick(take_profit_price, self.tick_decimals).to_string(),
            },
            stop_loss: StopLossLeg {
                stop_price: round_to_tick(stop_loss_price, self.tick_decimals).to_string(),
            },
        };

        // Plain client: a submit is never auto-retried.
        let url = format!("{}/v2/orders", self.base_url);
        let resp = self
            .http
            .submits
            .post(&url)
            .header(KEY_HEADER, &self.api_key)
            .header(SECRET_HEADER, &self.api_secret)
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        let body = resp.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_http_error(status, &body, symbol));
        }

        let order: AlpacaOrder =
            serde_json::from_str(&body).map_err(|e| BrokerError::Transient {
                reason: format!("Failed to decode bracket response: {e}"),
            })?;

        // Legs are classified by order type: the stop leg carries type=stop,
        // the target leg type=limit.
        let mut stop_id = None;
        let mut target_id = None;
        for leg in &order.legs {
            match leg.order_type.as_str() {
                "stop" | "stop_limit" => stop_id = Some(leg.id.clone()),
                "limit" => target_id = Some(leg.id.clone()),
                other => warn!("AlpacaBroker: unexpected bracket leg type {other}"),
            }
        }
        let (Some(stop_loss_order_id), Some(take_profit_order_id)) = (stop_id, target_id) else {
            return Err(BrokerError::Transient {
                reason: format!("Bracket response for {symbol} missing legs"),
            });
        };

        info!(
            "AlpacaBroker: bracket submitted for {} qty {} (entry {})",
            symbol, qty, order.id
        );

        Ok(BracketIds {
            entry_order_id: order.id,
            stop_loss_order_id,
            take_profit_order_id,
        })
    }

    pub(super) async fn do_cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let url = format!("{}/v2/orders/{}", self.base_url, broker_order_id);
        let resp = self
            .http
            .submits
            .delete(&url)
            .header(KEY_HEADER, &self.api_key)
            .header(SECRET_HEADER, &self.api_secret)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(BrokerError::OrderNotFound {
                broker_order_id: broker_order_id.to_string(),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body, broker_order_id));
        }
        Ok(())
    }

    pub(super) async fn do_close_position(
        &self,
        symbol: &str,
        reason: Option<&str>,
    ) -> Result<CloseResult, BrokerError> {
        let url = format!("{}/v2/positions/{}", self.base_url, symbol.to_uppercase());
        let resp = self
            .http
            .submits
            .delete(&url)
            .header(KEY_HEADER, &self.api_key)
            .header(SECRET_HEADER, &self.api_secret)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        let body = resp.text().await.map_err(map_transport_error)?;

        // Closing a position that is already gone is a success for an
        // idempotent close, not a failure.
        if status.as_u16() == 404 {
            return Ok(CloseResult {
                symbol: symbol.to_uppercase(),
                success: true,
                broker_order_id: None,
                error: None,
            });
        }
        if !status.is_success() {
            return Err(map_http_error(status, &body, symbol));
        }

        let order: Option<AlpacaOrder> = serde_json::from_str(&body).ok();
        info!(
            "AlpacaBroker: close submitted for {} (reason: {})",
            symbol,
            reason.unwrap_or("unspecified")
        );
        Ok(CloseResult {
            symbol: symbol.to_uppercase(),
            success: true,
            broker_order_id: order.map(|o| o.id),
            error: None,
        })
    }

    /// Bulk close with per-symbol outcomes. Idempotent: symbols already flat
    /// at the broker report success.
    pub(super) async fn do_close_all(&self) -> Result<Vec<CloseResult>, BrokerError> {
        let positions = self.fetch_positions().await?;
        let mut results = Vec::with_capacity(positions.len());
        for position in positions {
            match self.do_close_position(&position.symbol, Some("close_all")).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(
                        "AlpacaBroker: close_all failed for {}: {}",
                        position.symbol, e
                    );
                    results.push(CloseResult {
                        symbol: position.symbol,
                        success: false,
                        broker_order_id: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        Ok(results)
    }
}
