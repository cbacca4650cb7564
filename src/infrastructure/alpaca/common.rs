use crate::domain::errors::BrokerError;
use crate::domain::trading::types::OrderStatus;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;

pub(crate) const KEY_HEADER: &str = "APCA-API-KEY-ID";
pub(crate) const SECRET_HEADER: &str = "APCA-API-SECRET-KEY";

/// Round to the broker's minimum increment. Sub-penny limit prices are
/// rejected at the wire, so every outgoing price passes through here.
pub fn round_to_tick(price: Decimal, decimals: u32) -> Decimal {
    price.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Deserialize)]
pub(crate) struct AlpacaErrorBody {
    pub message: Option<String>,
}

/// Map an Alpaca HTTP response to the port's failure classes.
pub(crate) fn map_http_error(status: reqwest::StatusCode, body: &str, symbol: &str) -> BrokerError {
    let message = serde_json::from_str::<AlpacaErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| body.chars().take(200).collect());
    let lowered = message.to_lowercase();

    match status.as_u16() {
        401 | 403 if lowered.contains("buying power") => {
            BrokerError::InsufficientBuyingPower {
                need: Decimal::ZERO,
                available: Decimal::ZERO,
            }
        }
        401 | 403 => BrokerError::AuthFailed,
        404 => BrokerError::OrderNotFound {
            broker_order_id: symbol.to_string(),
        },
        422 if lowered.contains("sub-penny") || lowered.contains("price") => {
            BrokerError::InvalidPrice {
                symbol: symbol.to_string(),
                price: Decimal::ZERO,
            }
        }
        429 => BrokerError::RateLimited {
            retry_after_secs: 60,
        },
        500..=599 => BrokerError::Unavailable { reason: message },
        _ => BrokerError::Transient { reason: message },
    }
}

pub(crate) fn map_transport_error(err: impl std::fmt::Display) -> BrokerError {
    BrokerError::Unavailable {
        reason: err.to_string(),
    }
}

/// Alpaca order status tokens into the local state machine's vocabulary.
pub(crate) fn map_order_status(raw: &str) -> OrderStatus {
    match raw {
        "new" | "accepted" | "held" | "pending_new" | "accepted_for_bidding" => {
            OrderStatus::Accepted
        }
        "partially_filled" => OrderStatus::PartialFill,
        "filled" => OrderStatus::Filled,
        "canceled" | "pending_cancel" | "stopped" | "suspended" | "replaced"
        | "pending_replace" => OrderStatus::Cancelled,
        "rejected" => OrderStatus::Rejected,
        "expired" | "done_for_day" => OrderStatus::Expired,
        _ => OrderStatus::Accepted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    #[test]
    fn sub_penny_prices_round_to_the_tick() {
        let raw = Decimal::from_str("27.06999969482422").unwrap();
        assert_eq!(round_to_tick(raw, 2), dec!(27.07));
        assert_eq!(round_to_tick(dec!(150.005), 2), dec!(150.01));
        assert_eq!(round_to_tick(dec!(150.00), 2), dec!(150.00));
        // HKEX-style 3-decimal tick tier.
        assert_eq!(round_to_tick(dec!(1.2345), 3), dec!(1.235));
    }

    #[test]
    fn http_error_classes() {
        let status = reqwest::StatusCode::from_u16(422).unwrap();
        let err = map_http_error(status, r#"{"message":"sub-penny increment"}"#, "AAPL");
        assert!(matches!(err, BrokerError::InvalidPrice { .. }));

        let status = reqwest::StatusCode::from_u16(403).unwrap();
        let err = map_http_error(status, r#"{"message":"insufficient buying power"}"#, "AAPL");
        assert!(matches!(err, BrokerError::InsufficientBuyingPower { .. }));

        let status = reqwest::StatusCode::from_u16(403).unwrap();
        let err = map_http_error(status, r#"{"message":"forbidden"}"#, "AAPL");
        assert!(matches!(err, BrokerError::AuthFailed));

        let status = reqwest::StatusCode::from_u16(429).unwrap();
        let err = map_http_error(status, "{}", "AAPL");
        assert!(matches!(err, BrokerError::RateLimited { .. }));

        let status = reqwest::StatusCode::from_u16(503).unwrap();
        let err = map_http_error(status, "gateway timeout", "AAPL");
        assert!(matches!(err, BrokerError::Unavailable { .. }));
    }

    #[test]
    fn status_tokens() {
        assert_eq!(map_order_status("new"), OrderStatus::Accepted);
        assert_eq!(map_order_status("partially_filled"), OrderStatus::PartialFill);
        assert_eq!(map_order_status("filled"), OrderStatus::Filled);
        assert_eq!(map_order_status("canceled"), OrderStatus::Cancelled);
        assert_eq!(map_order_status("expired"), OrderStatus::Expired);
        assert_eq!(map_order_status("rejected"), OrderStatus::Rejected);
    }
}
