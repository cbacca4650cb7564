use super::common::{KEY_HEADER, SECRET_HEADER, map_http_error, map_transport_error};
use super::{AlpacaBroker, BAR_BATCH_SIZE};
use crate::domain::errors::BrokerError;
use crate::domain::ports::{AssetInfo, BarSnapshot, Quote};
use crate::infrastructure::core::http::with_query;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct AlpacaAsset {
    symbol: String,
    exchange: String,
    tradable: bool,
    #[serde(default)]
    fractionable: bool,
    #[serde(default)]
    shortable: bool,
    status: String,
}

#[derive(Debug, Deserialize)]
struct AlpacaQuoteEnvelope {
    quote: AlpacaQuote,
}

#[derive(Debug, Deserialize)]
struct AlpacaQuote {
    #[serde(rename = "bp")]
    bid: f64,
    #[serde(rename = "ap")]
    ask: f64,
    #[serde(rename = "t")]
    ts: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct AlpacaSnapshot {
    #[serde(rename = "latestTrade")]
    latest_trade: Option<AlpacaTrade>,
    #[serde(rename = "dailyBar")]
    daily_bar: Option<AlpacaBar>,
    #[serde(rename = "prevDailyBar")]
    prev_daily_bar: Option<AlpacaBar>,
}

#[derive(Debug, Deserialize)]
struct AlpacaTrade {
    #[serde(rename = "p")]
    price: f64,
}

#[derive(Debug, Deserialize)]
struct AlpacaBar {
    #[serde(rename = "o")]
    open: f64,
    #[serde(rename = "c")]
    close: f64,
    #[serde(rename = "v")]
    volume: f64,
    #[serde(rename = "t")]
    ts: DateTime<Utc>,
}

fn decimal_from(value: f64) -> Decimal {
    Decimal::from_str(&format!("{value}")).unwrap_or(Decimal::ZERO)
}

impl AlpacaBroker {
    pub(super) async fn fetch_assets(&self) -> Result<Vec<AssetInfo>, BrokerError> {
        let url = with_query(
            &format!("{}/v2/assets", self.base_url),
            &[("status", "active"), ("asset_class", "us_equity")],
        );
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
            return Err(map_http_error(status, &body, "assets"));
        }

        let assets: Vec<AlpacaAsset> = serde_json::from_str(&body).map_err(|e| {
            BrokerError::Transient {
                reason: format!("Failed to decode assets: {e}"),
            }
        })?;

        Ok(assets
            .into_iter()
            .filter(|a| a.status == "active")
            .map(|a| AssetInfo {
                symbol: a.symbol,
                exchange: a.exchange,
                tradable: a.tradable,
                fractionable: a.fractionable,
                shortable: a.shortable,
            })
            .collect())
    }

    pub(super) async fn fetch_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        let url = format!(
            "{}/v2/stocks/{}/quotes/latest",
            self.data_url,
            symbol.to_uppercase()
        );
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
            return Err(map_http_error(status, &body, symbol));
        }

        let envelope: AlpacaQuoteEnvelope =
            serde_json::from_str(&body).map_err(|e| BrokerError::Transient {
                reason: format!("Failed to decode quote for {symbol}: {e}"),
            })?;

        let bid = decimal_from(envelope.quote.bid);
        let ask = decimal_from(envelope.quote.ask);
        let last = if bid.is_zero() || ask.is_zero() {
            bid.max(ask)
        } else {
            (bid + ask) / Decimal::from(2)
        };

        Ok(Quote {
            symbol: symbol.to_uppercase(),
            bid,
            ask,
            last,
            ts: envelope.quote.ts,
        })
    }

    /// Latest daily bars for up to `BAR_BATCH_SIZE` symbols in one snapshot
    /// request. Symbols the feed has no data for are skipped with a log line.
    pub(super) async fn fetch_latest_bars(
        &self,
        symbols: &[String],
    ) -> Result<Vec<BarSnapshot>, BrokerError> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let batch: Vec<String> = symbols
            .iter()
            .take(BAR_BATCH_SIZE)
            .map(|s| s.to_uppercase())
            .collect();

        let url = with_query(
            &format!("{}/v2/stocks/snapshots", self.data_url),
            &[("symbols", batch.join(",").as_str())],
        );
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
            return Err(map_http_error(status, &body, "snapshots"));
        }

        let snapshots: HashMap<String, AlpacaSnapshot> =
            serde_json::from_str(&body).map_err(|e| BrokerError::Transient {
                reason: format!("Failed to decode snapshots: {e}"),
            })?;

        let mut bars = Vec::with_capacity(snapshots.len());
        for (symbol, snapshot) in snapshots {
            let Some(daily) = snapshot.daily_bar else {
                warn!("AlpacaBroker: no daily bar for {symbol}, skipping");
                continue;
            };
            let close = snapshot
                .latest_trade
                .map(|t| decimal_from(t.price))
                .filter(|p| !p.is_zero())
                .unwrap_or_else(|| decimal_from(daily.close));
            bars.push(BarSnapshot {
                symbol,
                open: decimal_from(daily.open),
                close,
                prev_close: snapshot.prev_daily_bar.as_ref().map(|b| decimal_from(b.close)),
                volume: decimal_from(daily.volume),
                avg_volume: snapshot.prev_daily_bar.map(|b| decimal_from(b.volume)),
                ts: daily.ts,
            });
        }
        Ok(bars)
    }
}
