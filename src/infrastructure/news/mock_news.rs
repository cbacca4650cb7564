use crate::domain::ports::{Headline, NewsService};
use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Scriptable news source for tests: per-symbol headlines, or a forced
/// outage to exercise the graceful-degradation path.
#[derive(Default)]
pub struct MockNewsService {
    headlines: Mutex<HashMap<String, Vec<Headline>>>,
    down: Mutex<bool>,
}

impl MockNewsService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_headline(&self, symbol: &str, title: &str, summary: &str) {
        let headline = Headline {
            title: title.to_string(),
            summary: summary.to_string(),
            source: "mock".to_string(),
            published_at: Utc::now(),
        };
        self.headlines
            .lock()
            .unwrap()
            .entry(symbol.to_uppercase())
            .or_default()
            .push(headline);
    }

    pub fn set_down(&self, down: bool) {
        *self.down.lock().unwrap() = down;
    }
}

#[async_trait]
impl NewsService for MockNewsService {
    async fn headlines_for(&self, symbol: &str, _since: DateTime<Utc>) -> Result<Vec<Headline>> {
        if *self.down.lock().unwrap() {
            bail!("news service unavailable (503)");
        }
        Ok(self
            .headlines
            .lock()
            .unwrap()
            .get(&symbol.to_uppercase())
            .cloned()
            .unwrap_or_default())
    }
}
