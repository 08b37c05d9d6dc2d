//! Centralized configuration for the dashboard core.
//!
//! Hardcoded defaults live on the unit structs below. [`DashboardConfig`]
//! overlays environment variables on top of them; a value that fails to parse
//! falls back to the default.

use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Cache freshness and staleness thresholds.
pub struct CacheConfig;

impl CacheConfig {
    /// A cached payload younger than this is served without a network call.
    pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(15 * 60);
    /// The store reports stale data when nothing was written for this long.
    pub const STALE_THRESHOLD: Duration = Duration::from_secs(15 * 60);
    /// Consecutive network errors that force the offline state.
    pub const NETWORK_ERROR_THRESHOLD: u32 = 3;
}

/// Retry defaults for resilient calls and transport requests.
pub struct RetryDefaults;

impl RetryDefaults {
    pub const CALL_RETRIES: u32 = 3;
    pub const CALL_BASE_DELAY: Duration = Duration::from_millis(1000);
    pub const TRANSPORT_RETRIES: u32 = 3;
    pub const TRANSPORT_BASE_DELAY: Duration = Duration::from_millis(1000);
    pub const MAX_DELAY: Duration = Duration::from_secs(10);
    pub const MAX_JITTER: Duration = Duration::from_millis(1000);
}

/// Connectivity probing defaults.
pub struct ConnectivityDefaults;

impl ConnectivityDefaults {
    pub const PROBE_URLS: &'static [&'static str] = &[
        "https://www.gstatic.com/generate_204",
        "https://cloudflare.com/cdn-cgi/trace",
    ];
    pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const HINT_DEBOUNCE: Duration = Duration::from_secs(1);
    pub const OFFLINE_RECHECK_INTERVAL: Duration = Duration::from_secs(30);
    pub const ONLINE_VERIFY_INTERVAL: Duration = Duration::from_secs(300);
    pub const VERSION_CHECK_INTERVAL: Duration = Duration::from_secs(60);
}

/// Network transport settings.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
    pub const USER_AGENT: &'static str = "dashboard-core/0.1";
}

/// Persisted state location.
pub struct StorageConfig;

impl StorageConfig {
    pub const APP_DIR_NAME: &'static str = "dashboard";
    /// Fixed storage key; the state file is `<key>.json`.
    pub const STATE_KEY: &'static str = "offline-state";
}

/// Refresh interval defaults for the sports game-state policy.
pub struct IntervalDefaults;

impl IntervalDefaults {
    pub const PRE_GAME: Duration = Duration::from_secs(15 * 60);
    pub const PRE_GAME_CLOSE: Duration = Duration::from_secs(30);
    pub const IN_GAME: Duration = Duration::from_secs(15);
    pub const POST_GAME: Duration = Duration::from_secs(60 * 60);
    /// How long before the scheduled start the pre-game-close cadence begins.
    pub const PRE_GAME_WINDOW: Duration = Duration::from_secs(15 * 60);
}

/// Runtime configuration assembled from defaults and the environment.
#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub cache_expiry: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub probe_urls: Vec<String>,
    pub probe_timeout: Duration,
    pub offline_recheck_interval: Duration,
    pub online_verify_interval: Duration,
    /// Resource polled for build changes; `None` disables version polling.
    pub version_url: Option<String>,
    pub version_check_interval: Duration,
    pub state_dir: Option<PathBuf>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            cache_expiry: CacheConfig::DEFAULT_EXPIRY,
            retry_attempts: RetryDefaults::CALL_RETRIES,
            retry_delay: RetryDefaults::CALL_BASE_DELAY,
            probe_urls: ConnectivityDefaults::PROBE_URLS
                .iter()
                .map(|u| u.to_string())
                .collect(),
            probe_timeout: ConnectivityDefaults::PROBE_TIMEOUT,
            offline_recheck_interval: ConnectivityDefaults::OFFLINE_RECHECK_INTERVAL,
            online_verify_interval: ConnectivityDefaults::ONLINE_VERIFY_INTERVAL,
            version_url: None,
            version_check_interval: ConnectivityDefaults::VERSION_CHECK_INTERVAL,
            state_dir: None,
        }
    }
}

impl DashboardConfig {
    /// Build the configuration from `DASHBOARD_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let secs = |key: &str, fallback: Duration| {
            parse_or(key, lookup(key), fallback.as_secs()).map_or(fallback, Duration::from_secs)
        };
        let millis = |key: &str, fallback: Duration| {
            parse_or(key, lookup(key), fallback.as_millis() as u64)
                .map_or(fallback, Duration::from_millis)
        };

        let probe_urls = lookup("DASHBOARD_PROBE_URLS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .filter(|u| valid_url("DASHBOARD_PROBE_URLS", u))
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|urls| !urls.is_empty())
            .unwrap_or(defaults.probe_urls);

        let version_url = lookup("DASHBOARD_VERSION_URL")
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty() && valid_url("DASHBOARD_VERSION_URL", u));

        Self {
            cache_expiry: secs("DASHBOARD_CACHE_EXPIRY_SECS", defaults.cache_expiry),
            retry_attempts: parse_or(
                "DASHBOARD_RETRY_ATTEMPTS",
                lookup("DASHBOARD_RETRY_ATTEMPTS"),
                defaults.retry_attempts,
            )
            .unwrap_or(defaults.retry_attempts),
            retry_delay: millis("DASHBOARD_RETRY_DELAY_MS", defaults.retry_delay),
            probe_urls,
            probe_timeout: millis("DASHBOARD_PROBE_TIMEOUT_MS", defaults.probe_timeout),
            offline_recheck_interval: secs(
                "DASHBOARD_OFFLINE_RECHECK_SECS",
                defaults.offline_recheck_interval,
            ),
            online_verify_interval: secs(
                "DASHBOARD_ONLINE_VERIFY_SECS",
                defaults.online_verify_interval,
            ),
            version_url,
            version_check_interval: secs(
                "DASHBOARD_VERSION_CHECK_SECS",
                defaults.version_check_interval,
            ),
            state_dir: lookup("DASHBOARD_STATE_DIR").map(PathBuf::from),
        }
    }

    /// Directory holding the persisted state file.
    ///
    /// Falls back to the platform data dir, then to `./.dashboard`.
    pub fn resolve_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|d| d.join(StorageConfig::APP_DIR_NAME))
                .unwrap_or_else(|| PathBuf::from(".dashboard"))
        })
    }
}

fn parse_or<T: std::str::FromStr + Copy>(key: &str, raw: Option<String>, fallback: T) -> Option<T> {
    match raw {
        None => Some(fallback),
        Some(value) => match value.trim().parse::<T>() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                warn!(key, value = %value, "Ignoring unparsable config value, using default");
                None
            }
        },
    }
}

fn valid_url(key: &str, raw: &str) -> bool {
    match url::Url::parse(raw) {
        Ok(_) => true,
        Err(e) => {
            warn!(key, url = raw, error = %e, "Ignoring invalid URL");
            false
        }
    }
}
