//! Network utilities: transport, retries and connectivity detection.
//!
//! This module provides:
//! - Retry logic with exponential backoff and jitter
//! - HTTP transport that keeps the network error counter
//! - Connectivity probing and monitoring
//! - Deployed-build change detection

mod client;
mod monitor;
mod probe;
pub mod retry;
mod version;

pub use client::HttpClient;
pub use monitor::{Connectivity, ConnectivityMonitor, PlatformSignal};
pub use probe::{ConnectivityProbe, HttpProbe};
pub use retry::{retry_with_backoff, RetryPolicy, RetryStats};
pub use version::{FingerprintSource, HttpFingerprint, VersionCheck, VersionWatcher};
