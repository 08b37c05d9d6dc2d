//! Cache-first, retry-wrapped calls for a single data source.
//!
//! A [`ResilientSource`] serves a fresh cached payload without touching the
//! network, otherwise runs the operation through the retry engine. When every
//! attempt fails it falls back to whatever is cached, however old, and only
//! errors when there is nothing to show at all.
//!
//! The wrapper never touches the store's network error counter; that is the
//! transport's job (see [`crate::network::HttpClient`]).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::to_chrono;
use crate::config::{CacheConfig, DashboardConfig, RetryDefaults};
use crate::error::{DashboardError, Result};
use crate::network::retry::{retry_with_backoff, RetryPolicy};
use crate::state::{CacheEntry, NetworkStateStore};

/// Per-call knobs.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Retries after the first attempt.
    pub retry_attempts: u32,
    /// Base backoff delay.
    pub retry_delay: Duration,
    /// Maximum age of a cached payload that is served without a call.
    pub cache_expiry: Duration,
    /// Skip the cache lookup and always call.
    pub force_refresh: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            retry_attempts: RetryDefaults::CALL_RETRIES,
            retry_delay: RetryDefaults::CALL_BASE_DELAY,
            cache_expiry: CacheConfig::DEFAULT_EXPIRY,
            force_refresh: false,
        }
    }
}

impl CallOptions {
    pub fn from_config(config: &DashboardConfig) -> Self {
        Self {
            retry_attempts: config.retry_attempts,
            retry_delay: config.retry_delay,
            cache_expiry: config.cache_expiry,
            force_refresh: false,
        }
    }

    pub fn with_force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    pub fn with_cache_expiry(mut self, expiry: Duration) -> Self {
        self.cache_expiry = expiry;
        self
    }

    pub fn with_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(self.retry_attempts)
            .with_base_delay(self.retry_delay)
    }
}

/// Where a returned payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOrigin {
    /// Fetched just now.
    Live,
    /// Served from a fresh cache entry.
    Cache,
    /// The fetch failed; this is the last known value, possibly expired.
    StaleFallback,
}

impl fmt::Display for DataOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DataOrigin::Live => "live",
            DataOrigin::Cache => "cached",
            DataOrigin::StaleFallback => "stale",
        };
        f.write_str(label)
    }
}

/// A payload along with its provenance.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub data: T,
    pub origin: DataOrigin,
    /// When the payload was originally fetched.
    pub cached_at: DateTime<Utc>,
}

impl<T> Fetched<T> {
    pub fn is_degraded(&self) -> bool {
        self.origin == DataOrigin::StaleFallback
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.cached_at).num_minutes()
    }

    /// Human-readable age such as "just now", "5m ago", "2h ago" or "3d ago".
    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        age_display(self.cached_at, now)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
        Fetched {
            data: f(self.data),
            origin: self.origin,
            cached_at: self.cached_at,
        }
    }
}

/// Format the age of something written at `at`, rounding hours and days to
/// the nearest unit.
pub fn age_display(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = (now - at).num_minutes();
    if minutes < 1 {
        // Clock skew lands here too
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}

/// A named data source whose results are cached in the shared store.
#[derive(Clone)]
pub struct ResilientSource {
    name: String,
    store: Arc<NetworkStateStore>,
}

impl ResilientSource {
    pub fn new(name: impl Into<String>, store: Arc<NetworkStateStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<NetworkStateStore> {
        &self.store
    }

    /// Cache key scoped to this source.
    pub fn cache_key(&self, suffix: &str) -> String {
        format!("{}:{}", self.name, suffix)
    }

    /// Drop every cached entry belonging to this source.
    pub fn clear_cache(&self) -> usize {
        self.store.clear_prefix(&format!("{}:", self.name))
    }

    /// Fetch through the cache, retrying and falling back as needed.
    pub async fn call<T, F, Fut>(
        &self,
        cache_key: &str,
        options: &CallOptions,
        operation: F,
    ) -> Result<Fetched<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !options.force_refresh {
            if let Some(fetched) = self.fresh_from_cache(cache_key, options.cache_expiry) {
                debug!(source = %self.name, key = cache_key, "Serving fresh cached data");
                return Ok(fetched);
            }
        }

        let (result, stats) =
            retry_with_backoff(&options.retry_policy(), operation, |_: &DashboardError| true)
                .await;

        match result {
            Ok(data) => {
                match serde_json::to_value(&data) {
                    Ok(value) => self.store.cache_data(cache_key, value),
                    Err(e) => warn!(source = %self.name, key = cache_key, "Not caching unserializable payload: {}", e),
                }
                Ok(Fetched {
                    data,
                    origin: DataOrigin::Live,
                    cached_at: self.store.now(),
                })
            }
            Err(e) => match self
                .store
                .stale_fallback(cache_key)
                .and_then(|entry| decode_entry(entry, DataOrigin::StaleFallback))
            {
                Some(fallback) => {
                    warn!(
                        source = %self.name,
                        key = cache_key,
                        attempts = stats.attempts,
                        "Fetch failed, serving cached data: {}",
                        e
                    );
                    Ok(fallback)
                }
                None => Err(e),
            },
        }
    }

    fn fresh_from_cache<T: DeserializeOwned>(
        &self,
        cache_key: &str,
        expiry: Duration,
    ) -> Option<Fetched<T>> {
        let entry = self.store.cached_entry(cache_key)?;
        if entry.age(self.store.now()) > to_chrono(expiry) {
            return None;
        }
        decode_entry(entry, DataOrigin::Cache)
    }
}

fn decode_entry<T: DeserializeOwned>(entry: CacheEntry, origin: DataOrigin) -> Option<Fetched<T>> {
    match serde_json::from_value(entry.data) {
        Ok(data) => Some(Fetched {
            data,
            origin,
            cached_at: entry.timestamp,
        }),
        Err(e) => {
            debug!("Ignoring cached payload that no longer decodes: {}", e);
            None
        }
    }
}

/// Race `future` against a deadline.
///
/// On expiry the future is dropped at its current suspension point and
/// [`DashboardError::Timeout`] is returned. Work it already spawned keeps
/// running; this is best-effort cancellation only.
pub async fn with_deadline<T>(
    deadline: Duration,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, future).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Operation exceeded deadline of {:?}", deadline);
            Err(DashboardError::Timeout(deadline))
        }
    }
}
