use crate::domain::ports::{Headline, NewsService};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rss::Channel;
use std::io::Cursor;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// RSS-backed news source. The feed is fetched at most once per
/// `cache_ttl`; per-symbol filtering happens against the cached channel so a
/// 200-candidate scan does not hammer the feed.
pub struct RssNewsService {
    url: String,
    client: Client,
    cache_ttl: Duration,
    cache: Mutex<Option<(Instant, Vec<Headline>)>>,
}

impl RssNewsService {
    pub fn new(url: &str, cache_ttl: Duration) -> Self {
        Self {
            url: url.to_string(),
            client: Client::new(),
            cache_ttl,
            cache: Mutex::new(None),
        }
    }

    async fn fetch_channel(&self) -> Result<Vec<Headline>> {
        let resp = self.client.get(&self.url).send().await?;
        let bytes = resp.bytes().await?;
        let channel = Channel::read_from(Cursor::new(bytes))?;

        let mut headlines = Vec::with_capacity(channel.items().len());
        for item in channel.items() {
            let published_at = item
                .pub_date()
                .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            headlines.push(Headline {
                title: item.title().unwrap_or("").to_string(),
                summary: item.description().unwrap_or("").to_string(),
                source: channel.title().to_string(),
                published_at,
            });
        }
        Ok(headlines)
    }

    async fn cached_headlines(&self) -> Result<Vec<Headline>> {
        {
            let cache = self.cache.lock().expect("rss cache lock poisoned");
            if let Some((fetched_at, headlines)) = cache.as_ref()
                && fetched_at.elapsed() < self.cache_ttl
            {
                return Ok(headlines.clone());
            }
        }

        debug!("RssNewsService: refreshing feed {}", self.url);
        let headlines = self.fetch_channel().await.inspect_err(|e| {
            error!("RssNewsService: feed fetch failed: {e:#}");
        })?;

        let mut cache = self.cache.lock().expect("rss cache lock poisoned");
        *cache = Some((Instant::now(), headlines.clone()));
        Ok(headlines)
    }
}

#[async_trait]
impl NewsService for RssNewsService {
    async fn headlines_for(&self, symbol: &str, since: DateTime<Utc>) -> Result<Vec<Headline>> {
        let all = self.cached_headlines().await?;
        let needle = symbol.to_uppercase();
        Ok(all
            .into_iter()
            .filter(|h| h.published_at >= since)
            .filter(|h| {
                let text = format!("{} {}", h.title, h.summary).to_uppercase();
                mentions_symbol(&text, &needle)
            })
            .collect())
    }
}

/// Word-boundary symbol match so "A" does not hit every article.
fn mentions_symbol(text: &str, symbol: &str) -> bool {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word == symbol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_matching_is_word_bounded() {
        assert!(mentions_symbol("AAPL BEATS ESTIMATES", "AAPL"));
        assert!(mentions_symbol("SHARES OF AAPL, MSFT RISE", "MSFT"));
        assert!(!mentions_symbol("AAPLE SAUCE FUTURES", "AAPL"));
        assert!(!mentions_symbol("A BROAD RALLY", "AAP"));
    }
}
