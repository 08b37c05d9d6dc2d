//! HTTP transport shared by every data source.
//!
//! Wraps reqwest with:
//! - Transport-level retries through the backoff engine
//! - Network error bookkeeping on the shared store (one increment per failed
//!   logical request, never per attempt)
//! - Automatic return to online when a request succeeds while offline

use reqwest::{header, Client, Method, Response};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::retry::{retry_with_backoff, RetryPolicy};
use crate::config::{NetworkConfig, RetryDefaults};
use crate::error::{DashboardError, Result};
use crate::state::NetworkStateStore;

/// HTTP client bound to a network state store.
pub struct HttpClient {
    client: Client,
    store: Arc<NetworkStateStore>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl HttpClient {
    /// Create a new HTTP client with default configuration.
    pub fn new(store: Arc<NetworkStateStore>) -> Result<Self> {
        Self::with_timeout(store, NetworkConfig::REQUEST_TIMEOUT)
    }

    /// Create a new HTTP client with a custom per-request timeout.
    pub fn with_timeout(store: Arc<NetworkStateStore>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| DashboardError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;

        Ok(Self::with_client(store, client, timeout))
    }

    /// Wrap a preconfigured reqwest client. `timeout` is only reported in
    /// [`DashboardError::Timeout`].
    pub fn with_client(store: Arc<NetworkStateStore>, client: Client, timeout: Duration) -> Self {
        Self {
            client,
            store,
            retry: RetryPolicy::new()
                .with_max_retries(RetryDefaults::TRANSPORT_RETRIES)
                .with_base_delay(RetryDefaults::TRANSPORT_BASE_DELAY)
                .with_max_delay(RetryDefaults::MAX_DELAY),
            timeout,
        }
    }

    /// Replace the transport retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Get a reference to the underlying reqwest client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn store(&self) -> &Arc<NetworkStateStore> {
        &self.store
    }

    /// GET a URL, failing on non-2xx responses.
    pub async fn get(&self, url: &str) -> Result<Response> {
        self.request(Method::GET, url, &[]).await
    }

    /// GET a URL and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .request(Method::GET, url, &[(header::ACCEPT, "application/json")])
            .await?;

        response.json::<T>().await.map_err(|e| {
            if e.is_decode() {
                DashboardError::Json {
                    message: format!("Invalid JSON from {}: {}", url, e),
                    source: None,
                }
            } else {
                self.transport_error("GET", url, e)
            }
        })
    }

    /// HEAD a URL, failing on non-2xx responses.
    pub async fn head(&self, url: &str) -> Result<Response> {
        self.request(Method::HEAD, url, &[]).await
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(header::HeaderName, &str)],
    ) -> Result<Response> {
        let (result, stats) = retry_with_backoff(
            &self.retry,
            || self.send_once(method.clone(), url, headers),
            DashboardError::is_retryable,
        )
        .await;

        match &result {
            Ok(_) => {
                if stats.attempts > 1 {
                    debug!("{} {} succeeded after {} attempts", method, url, stats.attempts);
                }
                self.record_success();
            }
            Err(e) if e.is_network_error() => {
                warn!("{} {} failed: {}", method, url, e);
                self.store.increment_network_errors();
            }
            Err(e) => debug!("{} {} failed: {}", method, url, e),
        }
        result
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        headers: &[(header::HeaderName, &str)],
    ) -> Result<Response> {
        let mut request = self.client.request(method.clone(), url);
        for (name, value) in headers {
            request = request.header(name.clone(), *value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(method.as_str(), url, e))?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(DashboardError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            })
        }
    }

    fn transport_error(&self, method: &str, url: &str, err: reqwest::Error) -> DashboardError {
        if err.is_timeout() {
            DashboardError::Timeout(self.timeout)
        } else {
            DashboardError::Network {
                message: format!("{} {} failed: {}", method, url, err),
                cause: std::error::Error::source(&err).map(|s| s.to_string()),
            }
        }
    }

    /// A response proves the network is back.
    fn record_success(&self) {
        if self.store.is_offline() {
            debug!("Request succeeded while offline, going back online");
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                store.set_online().await;
            });
        }
    }
}
