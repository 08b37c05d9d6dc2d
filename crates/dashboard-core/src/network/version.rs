//! Deployed-build change detection.
//!
//! A kiosk runs for weeks without a restart. The version watcher polls a known
//! resource with a metadata-only request and reports when its fingerprint
//! (ETag, else Last-Modified) moves, so the host can reload onto the new build.

use async_trait::async_trait;
use reqwest::{header, Client};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::error::{DashboardError, Result};

/// Produces the current fingerprint of the deployed build.
#[async_trait]
pub trait FingerprintSource: Send + Sync {
    /// `Ok(None)` when the resource carries no usable fingerprint.
    async fn fingerprint(&self) -> Result<Option<String>>;
}

/// HEAD request against a static resource, bypassing caches.
pub struct HttpFingerprint {
    client: Client,
    url: String,
}

impl HttpFingerprint {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(NetworkConfig::REQUEST_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| DashboardError::Network {
                message: format!("Failed to create version client: {}", e),
                cause: None,
            })?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl FingerprintSource for HttpFingerprint {
    async fn fingerprint(&self) -> Result<Option<String>> {
        let response = self
            .client
            .head(&self.url)
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DashboardError::Http {
                status: response.status().as_u16(),
                url: self.url.clone(),
            });
        }

        let headers = response.headers();
        let tag = headers
            .get(header::ETAG)
            .or_else(|| headers.get(header::LAST_MODIFIED))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(tag)
    }
}

/// Result of one version check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheck {
    /// First fingerprint seen; recorded as the baseline.
    Seeded(String),
    Unchanged,
    /// The build changed since the last check.
    Changed { previous: String, current: String },
    /// The resource answered without a fingerprint.
    NoFingerprint,
}

/// Polls a [`FingerprintSource`] and reports build changes.
pub struct VersionWatcher {
    source: Arc<dyn FingerprintSource>,
    interval: Duration,
    last_seen: Mutex<Option<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VersionWatcher {
    pub fn new(source: Arc<dyn FingerprintSource>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            source,
            interval,
            last_seen: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub fn last_seen(&self) -> Option<String> {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Fetch the fingerprint once and compare it to the last one seen.
    pub async fn check(&self) -> Result<VersionCheck> {
        let Some(current) = self.source.fingerprint().await? else {
            debug!("No ETag/Last-Modified header present on version resource");
            return Ok(VersionCheck::NoFingerprint);
        };

        let mut last_seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = match last_seen.as_deref() {
            None => VersionCheck::Seeded(current.clone()),
            Some(previous) if previous == current => VersionCheck::Unchanged,
            Some(previous) => VersionCheck::Changed {
                previous: previous.to_string(),
                current: current.clone(),
            },
        };
        *last_seen = Some(current);
        Ok(outcome)
    }

    /// Check now and then on the interval; `on_stale_build(previous, current)`
    /// runs whenever the fingerprint changes. Check failures are logged and
    /// otherwise ignored.
    pub fn start<F>(self: &Arc<Self>, on_stale_build: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!("Cannot start version watcher: {}", e);
                return;
            }
        };

        let this = Arc::clone(self);
        let task = handle.spawn(async move {
            loop {
                match this.check().await {
                    Ok(VersionCheck::Changed { previous, current }) => {
                        warn!(%previous, %current, "App version change detected");
                        on_stale_build(&previous, &current);
                    }
                    Ok(VersionCheck::Seeded(tag)) => info!(%tag, "Recorded app version baseline"),
                    Ok(_) => debug!("App version unchanged"),
                    Err(e) => debug!("Version probe failed: {}", e),
                }
                tokio::time::sleep(this.interval).await;
            }
        });

        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}
