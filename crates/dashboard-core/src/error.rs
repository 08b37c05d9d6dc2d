//! Error types for the dashboard core.
//!
//! Every fallible operation in this crate returns [`DashboardError`]. The
//! classification helpers at the bottom decide which failures are retried and
//! which ones count against the shared network error counter.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the dashboard core.
#[derive(Debug, Error)]
pub enum DashboardError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("State storage error: {message}")]
    Storage { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Cache errors
    #[error("No data available for {key}")]
    NoData { key: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for dashboard operations.
pub type Result<T> = std::result::Result<T, DashboardError>;

impl From<std::io::Error> for DashboardError {
    fn from(err: std::io::Error) -> Self {
        DashboardError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for DashboardError {
    fn from(err: serde_json::Error) -> Self {
        DashboardError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for DashboardError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DashboardError::Timeout(Duration::from_secs(0))
        } else if let Some(status) = err.status() {
            DashboardError::Http {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            DashboardError::Network {
                message: err.to_string(),
                cause: std::error::Error::source(&err).map(|s| s.to_string()),
            }
        }
    }
}

impl DashboardError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        DashboardError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Shorthand for a network error without a separate cause.
    pub fn network(message: impl Into<String>) -> Self {
        DashboardError::Network {
            message: message.into(),
            cause: None,
        }
    }

    /// Check if this error should trigger a retry.
    ///
    /// Transport failures, timeouts, rate limiting and server-side HTTP errors
    /// are worth another attempt; client errors and decode failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            DashboardError::Network { .. } | DashboardError::Timeout(_) => true,
            DashboardError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Check if this error means the network itself is unreachable.
    ///
    /// Only these failures feed the shared network error counter; an HTTP
    /// status from a reachable server says nothing about connectivity.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            DashboardError::Network { .. } | DashboardError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DashboardError::NoData {
            key: "weather:current".into(),
        };
        assert_eq!(err.to_string(), "No data available for weather:current");

        let err = DashboardError::Http {
            status: 503,
            url: "https://example.com".into(),
        };
        assert_eq!(err.to_string(), "HTTP 503 from https://example.com");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(DashboardError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(DashboardError::network("connection reset").is_retryable());
        assert!(DashboardError::Http {
            status: 502,
            url: String::new()
        }
        .is_retryable());
        assert!(DashboardError::Http {
            status: 429,
            url: String::new()
        }
        .is_retryable());
        assert!(!DashboardError::Http {
            status: 404,
            url: String::new()
        }
        .is_retryable());
        assert!(!DashboardError::Other("bad payload".into()).is_retryable());
    }

    #[test]
    fn test_network_errors_exclude_http_status() {
        assert!(DashboardError::network("dns").is_network_error());
        assert!(DashboardError::Timeout(Duration::from_secs(1)).is_network_error());
        assert!(!DashboardError::Http {
            status: 500,
            url: String::new()
        }
        .is_network_error());
    }
}
