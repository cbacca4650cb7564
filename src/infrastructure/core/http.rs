use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use std::time::Duration;

/// The two HTTP clients the broker adapter needs: a retrying client for
/// idempotent reads, and a plain client for order submission. Submits must
/// never be auto-retried; an ambiguous failure is resolved by reconciliation,
/// not by a second request that could double an order.
pub struct BrokerHttp {
    pub reads: ClientWithMiddleware,
    pub submits: Client,
}

impl BrokerHttp {
    pub fn new(deadline: Duration) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let base = Client::builder()
            .pool_max_idle_per_host(5)
            .timeout(deadline)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());

        let reads = ClientBuilder::new(base.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            reads,
            submits: base,
        }
    }
}

/// Append query parameters to a URL. The middleware request builder does not
/// expose `.query()`, so the string is assembled by hand.
pub fn with_query<K, V>(base_url: &str, params: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    if params.is_empty() {
        return base_url.to_string();
    }
    let query: String = params
        .iter()
        .map(|(k, v)| format!("{}={}", encode(k.as_ref()), encode(v.as_ref())))
        .collect::<Vec<_>>()
        .join("&");
    let sep = if base_url.contains('?') { '&' } else { '?' };
    format!("{base_url}{sep}{query}")
}

fn encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => out.push(c),
            _ => {
                for byte in c.to_string().as_bytes() {
                    out.push_str(&format!("%{byte:02X}"));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_assembly() {
        assert_eq!(with_query::<&str, &str>("https://x/v2", &[]), "https://x/v2");
        assert_eq!(
            with_query("https://x/v2", &[("symbols", "AAPL,MSFT")]),
            "https://x/v2?symbols=AAPL%2CMSFT"
        );
        assert_eq!(
            with_query("https://x/v2?a=1", &[("b", "2")]),
            "https://x/v2?a=1&b=2"
        );
    }
}
