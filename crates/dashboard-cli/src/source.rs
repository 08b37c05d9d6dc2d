//! Generic JSON endpoint sources given on the command line.

use async_trait::async_trait;
use dashboard_core::{
    CallOptions, Fetched, HttpClient, NetworkStateStore, RefreshSource, ResilientSource,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Refresh interval when a source does not name one.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A parsed `name=url[@seconds]` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub name: String,
    pub url: String,
    pub interval: Duration,
}

/// Parse `name=url[@seconds]`.
///
/// A trailing `@` segment that is not a number stays part of the URL.
pub fn parse_source_spec(raw: &str) -> Result<SourceSpec, String> {
    let (name, rest) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=url[@seconds], got '{}'", raw))?;

    let name = name.trim();
    if name.is_empty() || name.contains(':') {
        return Err(format!("invalid source name '{}'", name));
    }

    let (url, interval) = match rest.rsplit_once('@') {
        Some((url, secs)) if !secs.is_empty() && secs.chars().all(|c| c.is_ascii_digit()) => {
            let secs: u64 = secs
                .parse()
                .map_err(|e| format!("invalid interval '{}': {}", secs, e))?;
            if secs == 0 {
                return Err("interval must be at least one second".to_string());
            }
            (url, Duration::from_secs(secs))
        }
        _ => (rest, DEFAULT_INTERVAL),
    };

    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(format!("source URL must be http(s), got '{}'", url));
    }

    Ok(SourceSpec {
        name: name.to_string(),
        url: url.to_string(),
        interval,
    })
}

/// Fetches one JSON document through the cache.
///
/// Retries belong to the shared [`HttpClient`]; the cache layer makes a
/// single attempt so one failed refresh is one network error.
pub struct JsonEndpoint {
    url: String,
    key: String,
    http: Arc<HttpClient>,
    resilient: ResilientSource,
    options: CallOptions,
}

impl JsonEndpoint {
    pub fn new(
        spec: &SourceSpec,
        http: Arc<HttpClient>,
        store: Arc<NetworkStateStore>,
        options: CallOptions,
    ) -> Self {
        let resilient = ResilientSource::new(spec.name.clone(), store);
        let key = resilient.cache_key("latest");
        let retry_delay = options.retry_delay;
        Self {
            url: spec.url.clone(),
            key,
            http,
            resilient,
            options: options.with_retries(0, retry_delay),
        }
    }
}

#[async_trait]
impl RefreshSource for JsonEndpoint {
    type Output = Fetched<Value>;

    fn name(&self) -> &str {
        self.resilient.name()
    }

    async fn refresh(&self) -> dashboard_core::Result<Fetched<Value>> {
        let fetched = self
            .resilient
            .call(&self.key, &self.options, || {
                self.http.get_json::<Value>(&self.url)
            })
            .await?;

        let now = self.resilient.store().now();
        info!(
            source = self.name(),
            origin = %fetched.origin,
            age = %fetched.age_display(now),
            "Refreshed"
        );
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashboard_core::{DataOrigin, RetryPolicy};
    use serde_json::json;

    #[test]
    fn test_parse_with_and_without_interval() {
        assert_eq!(
            parse_source_spec("weather=https://wx.example.com/now@600").unwrap(),
            SourceSpec {
                name: "weather".into(),
                url: "https://wx.example.com/now".into(),
                interval: Duration::from_secs(600),
            }
        );

        let spec = parse_source_spec("news=http://feed.example.com/top").unwrap();
        assert_eq!(spec.url, "http://feed.example.com/top");
        assert_eq!(spec.interval, DEFAULT_INTERVAL);
    }

    #[test]
    fn test_parse_keeps_userinfo_in_url() {
        let spec = parse_source_spec("cal=https://me@cal.example.com/feed").unwrap();
        assert_eq!(spec.url, "https://me@cal.example.com/feed");
        assert_eq!(spec.interval, DEFAULT_INTERVAL);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_source_spec("no-equals-sign").is_err());
        assert!(parse_source_spec("=https://example.com").is_err());
        assert!(parse_source_spec("a:b=https://example.com").is_err());
        assert!(parse_source_spec("wx=ftp://example.com").is_err());
        assert!(parse_source_spec("wx=https://example.com@0").is_err());
    }

    fn endpoint(store: Arc<NetworkStateStore>) -> JsonEndpoint {
        let spec = parse_source_spec("news=http://127.0.0.1:1/top").unwrap();
        let http = HttpClient::new(store.clone())
            .unwrap()
            .with_retry_policy(RetryPolicy::new().with_max_retries(0));
        let options = CallOptions::default().with_retries(0, Duration::from_millis(10));
        JsonEndpoint::new(&spec, Arc::new(http), store, options)
    }

    #[tokio::test]
    async fn test_fresh_cache_is_served_without_a_request() {
        let store = NetworkStateStore::new();
        store.cache_data("news:latest", json!({"headline": "cached"}));

        let fetched = endpoint(store).refresh().await.unwrap();
        assert_eq!(fetched.origin, DataOrigin::Cache);
        assert_eq!(fetched.data, json!({"headline": "cached"}));
    }

    #[tokio::test]
    async fn test_failed_refresh_counts_one_network_error() {
        let store = NetworkStateStore::new();
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        let http = HttpClient::with_client(store.clone(), client, Duration::from_secs(5))
            .with_retry_policy(
                RetryPolicy::new()
                    .with_max_retries(2)
                    .with_base_delay(Duration::from_millis(10))
                    .with_jitter(false),
            );
        let spec = parse_source_spec("news=http://127.0.0.1:1/top").unwrap();
        let options = CallOptions::default().with_retries(3, Duration::from_millis(10));
        let endpoint = JsonEndpoint::new(&spec, Arc::new(http), store.clone(), options);

        assert!(endpoint.refresh().await.is_err());
        assert_eq!(store.network_error_count(), 1);
        assert!(!store.is_offline());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_falls_back_to_stale_entry() {
        let store = NetworkStateStore::new();
        store.cache_data("news:latest", json!({"headline": "old"}));
        store.mark_data_stale("news:latest");

        let fetched = endpoint(store).refresh().await.unwrap();
        assert_eq!(fetched.origin, DataOrigin::StaleFallback);
        assert_eq!(fetched.data, json!({"headline": "old"}));
    }
}
