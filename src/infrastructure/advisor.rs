//! HTTP advisor client. The advisor is an optional external service (an LLM
//! or a heuristic endpoint) consulted on REVIEW verdicts; the budget lives
//! with the caller, and any failure here reads as "no opinion".

use crate::domain::ports::{Advisor, AdvisorAction, AdvisorContext, AdvisorVerdict};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

pub struct HttpAdvisor {
    url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct AdvisorResponse {
    action: String,
    #[serde(default)]
    reason: String,
}

impl HttpAdvisor {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: Client::builder()
                .timeout(Duration::from_secs(8))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }
}

#[async_trait]
impl Advisor for HttpAdvisor {
    async fn consult(&self, context: &AdvisorContext) -> Result<AdvisorVerdict> {
        let resp = self
            .client
            .post(&self.url)
            .json(context)
            .send()
            .await
            .context("Advisor request failed")?
            .error_for_status()
            .context("Advisor returned error status")?;

        let body: AdvisorResponse = resp.json().await.context("Bad advisor response")?;
        let action = match body.action.to_uppercase().as_str() {
            "EXIT" => AdvisorAction::Exit,
            _ => AdvisorAction::Hold,
        };
        Ok(AdvisorVerdict {
            action,
            reason: body.reason,
        })
    }
}
