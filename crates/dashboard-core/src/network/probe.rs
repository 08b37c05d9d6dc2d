//! Active reachability probes.

use async_trait::async_trait;
use reqwest::{redirect, Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::config::{DashboardConfig, NetworkConfig};
use crate::error::{DashboardError, Result};

/// One-shot reachability check.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// `Ok(true)` when the network is reachable. An `Err` means the check
    /// itself broke; callers treat that as offline.
    async fn is_online(&self) -> Result<bool>;
}

/// Probes a list of small well-known endpoints with HEAD requests.
///
/// The first endpoint that answers decides; any 2xx, 3xx or 403 response
/// counts as reachable since captive portals and CDNs answer those too.
pub struct HttpProbe {
    client: Client,
    urls: Vec<String>,
}

impl HttpProbe {
    pub fn new(urls: Vec<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(NetworkConfig::USER_AGENT)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| DashboardError::Network {
                message: format!("Failed to create probe client: {}", e),
                cause: None,
            })?;

        Ok(Self { client, urls })
    }

    pub fn from_config(config: &DashboardConfig) -> Result<Self> {
        Self::new(config.probe_urls.clone(), config.probe_timeout)
    }

    fn reachable(status: StatusCode) -> bool {
        status.is_success() || status.is_redirection() || status == StatusCode::FORBIDDEN
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn is_online(&self) -> Result<bool> {
        if self.urls.is_empty() {
            return Err(DashboardError::Config {
                message: "No connectivity probe URLs configured".into(),
            });
        }

        for url in &self.urls {
            match self.client.head(url).send().await {
                Ok(response) if Self::reachable(response.status()) => {
                    debug!(url = url.as_str(), status = %response.status(), "Probe reached");
                    return Ok(true);
                }
                Ok(response) => {
                    debug!(url = url.as_str(), status = %response.status(), "Probe answered unexpectedly");
                }
                Err(e) => debug!(url = url.as_str(), "Probe failed: {}", e),
            }
        }
        Ok(false)
    }
}
