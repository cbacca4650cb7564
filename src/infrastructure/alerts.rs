//! Outbound alert sinks. The delivery task in `application::alerts` owns the
//! mailbox; sinks only know how to put one alert somewhere.

use crate::domain::ports::{Alert, AlertSeverity, AlertSink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{error, info, warn};

/// Sink that routes alerts into the process log. Always configured; keeps the
/// platform observable when no webhook is set up.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Info => info!("[ALERT] {}: {}", alert.source, alert.message),
            AlertSeverity::Warning => warn!("[ALERT] {}: {}", alert.source, alert.message),
            AlertSeverity::Critical => error!("[ALERT] {}: {}", alert.source, alert.message),
        }
        Ok(())
    }
}

/// Sink that POSTs the alert as JSON to a webhook (chat bridge, pager, ...).
pub struct WebhookAlertSink {
    url: String,
    client: Client,
}

impl WebhookAlertSink {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        let payload = serde_json::json!({
            "severity": alert.severity.as_str(),
            "source": alert.source,
            "message": alert.message,
            "ts": alert.ts.to_rfc3339(),
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("Webhook send failed")?;
        resp.error_for_status().context("Webhook rejected alert")?;
        Ok(())
    }
}
