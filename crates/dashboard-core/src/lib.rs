//! Dashboard Core - offline resilience and caching for an always-on dashboard.
//!
//! This crate keeps a wall display useful when the network is not. It tracks
//! connectivity, caches every source's last good payload, retries failed
//! fetches with backoff, serves stale data instead of blanks, and pauses and
//! resumes refresh timers as connectivity comes and goes.
//!
//! # Example
//!
//! ```rust,ignore
//! use dashboard_core::{CallOptions, HttpClient, NetworkStateStore, ResilientSource};
//!
//! #[tokio::main]
//! async fn main() -> dashboard_core::Result<()> {
//!     let store = NetworkStateStore::new();
//!     let http = HttpClient::new(store.clone())?;
//!     let weather = ResilientSource::new("weather", store.clone());
//!
//!     let key = weather.cache_key("current");
//!     let current: dashboard_core::Fetched<serde_json::Value> = weather
//!         .call(&key, &CallOptions::default(), || http.get_json("https://example.com/wx"))
//!         .await?;
//!     println!("{} ({})", current.data, current.origin);
//!
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod network;
pub mod resilient;
pub mod schedule;
pub mod state;

// Re-export commonly used types
pub use clock::{Clock, DynClock, ManualClock, SystemClock};
pub use config::DashboardConfig;
pub use error::{DashboardError, Result};
pub use network::{
    Connectivity, ConnectivityMonitor, ConnectivityProbe, HttpClient, HttpProbe, PlatformSignal,
    RetryPolicy, VersionCheck, VersionWatcher,
};
pub use resilient::{
    age_display, with_deadline, CallOptions, DataOrigin, Fetched, ResilientSource,
};
pub use schedule::{
    FixedInterval, GameIntervals, IntervalPolicy, RefreshScheduler, RefreshSource, RefreshStatus,
    SchedulerState,
};
pub use state::{
    JsonFileStorage, NetworkEvent, NetworkSnapshot, NetworkStateStore, NetworkStatus,
    RecoveryOutcome, StateStorage,
};
