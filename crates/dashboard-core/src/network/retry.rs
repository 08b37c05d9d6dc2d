//! Retry logic with exponential backoff and jitter.
//!
//! `max_retries` counts retries on top of the first try, so an operation runs
//! at most `max_retries + 1` times. The delay before the retry that follows
//! attempt `n` (0-indexed) is `min(base * 2^n + jitter, max_delay)` with jitter
//! drawn uniformly from `[0, max_jitter)`.
//!
//! There is no cancellation token. A caller that needs a hard deadline wraps
//! the whole call in [`crate::resilient::with_deadline`].

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryDefaults;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each further one.
    pub base_delay: Duration,
    /// Upper bound for any single delay, jitter included.
    pub max_delay: Duration,
    /// Exclusive upper bound of the random jitter added to each delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: RetryDefaults::CALL_RETRIES,
            base_delay: RetryDefaults::CALL_BASE_DELAY,
            max_delay: RetryDefaults::MAX_DELAY,
            max_jitter: RetryDefaults::MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of retries after the first attempt.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable (default bound) or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.max_jitter = if jitter {
            RetryDefaults::MAX_JITTER
        } else {
            Duration::ZERO
        };
        self
    }

    /// Total number of tries this policy allows.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Calculate the delay that follows a failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            let bound = u64::try_from(self.max_jitter.as_nanos()).unwrap_or(u64::MAX);
            let mut rng = rand::rng();
            Duration::from_nanos(rng.random_range(0..bound))
        };
        self.delay_with_jitter(attempt, jitter)
    }

    /// Delay formula with an explicit jitter value.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        let factor = 1u128.checked_shl(attempt).unwrap_or(u128::MAX);
        let exponential = self.base_delay.as_nanos().saturating_mul(factor);
        let capped = exponential
            .saturating_add(jitter.as_nanos())
            .min(self.max_delay.as_nanos());
        Duration::from_nanos(u64::try_from(capped).unwrap_or(u64::MAX))
    }
}

/// Statistics about a retry operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Number of attempts made.
    pub attempts: u32,
    /// Every backoff delay slept, in order.
    pub delays: Vec<Duration>,
    /// Whether the operation ultimately succeeded.
    pub success: bool,
    /// Last error message if failed.
    pub last_error: Option<String>,
}

impl RetryStats {
    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }
}

/// Retry an async operation with exponential backoff.
///
/// `should_retry` is consulted before each retry only: never before the
/// first attempt and never once the attempts are exhausted. When it returns
/// false the error is returned at once, without a delay.
///
/// Returns the final result together with the [`RetryStats`].
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut stats = RetryStats::default();
    let mut attempt: u32 = 0;

    loop {
        stats.attempts = attempt + 1;
        debug!("Attempt {}/{}", attempt + 1, policy.total_attempts());

        match operation().await {
            Ok(value) => {
                stats.success = true;
                if attempt > 0 {
                    debug!("Operation succeeded after {} attempts", attempt + 1);
                }
                return (Ok(value), stats);
            }
            Err(e) => {
                stats.last_error = Some(e.to_string());

                if attempt >= policy.max_retries {
                    warn!(
                        "Max retries ({}) reached, giving up. Last error: {}",
                        policy.max_retries, e
                    );
                    return (Err(e), stats);
                }

                if !should_retry(&e) {
                    debug!("Error is not retryable: {}", e);
                    return (Err(e), stats);
                }

                let delay = policy.delay_for_attempt(attempt);
                stats.delays.push(delay);
                debug!(
                    "Attempt {} failed: {}. Waiting {:?} before next attempt",
                    attempt + 1,
                    e,
                    delay
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_calculation_no_jitter() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(60))
            .with_jitter(false);

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter(false);

        // 10 * 2^3 = 80s, capped at 30s
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(30));
        // Huge attempt numbers must not overflow
        assert_eq!(policy.delay_for_attempt(500), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_is_additive_and_capped() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000));

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(100), "{:?}", delay);
            assert!(delay <= Duration::from_millis(1000), "{:?}", delay);
        }

        assert_eq!(
            policy.delay_with_jitter(1, Duration::from_millis(300)),
            Duration::from_millis(500)
        );
        assert_eq!(
            policy.delay_with_jitter(2, Duration::from_millis(900)),
            Duration::from_millis(1000)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_first_try() {
        let policy = RetryPolicy::new().with_max_retries(3);

        let (result, stats) =
            retry_with_backoff(&policy, || async { Ok::<_, String>(42) }, |_: &String| true)
                .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(stats.attempts, 1);
        assert!(stats.delays.is_empty());
        assert!(stats.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let policy = RetryPolicy::new()
            .with_max_retries(2)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000))
            .with_jitter(false);

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let (result, stats) = retry_with_backoff(
            &policy,
            || {
                let counter = counter_clone.clone();
                async move {
                    let count = counter.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err("temporary failure".to_string())
                    } else {
                        Ok("payload")
                    }
                }
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(result.unwrap(), "payload");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(stats.attempts, 3);
        assert_eq!(
            stats.delays,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert!(stats.delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(stats
            .delays
            .iter()
            .all(|d| *d <= Duration::from_millis(1000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_returns_last_error() {
        let policy = RetryPolicy::new()
            .with_max_retries(2)
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(false);

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let (result, stats) = retry_with_backoff(
            &policy,
            || {
                let counter = counter_clone.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>(format!("failure {}", n))
                }
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(result.unwrap_err(), "failure 2");
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.delays.len(), 2);
        assert!(!stats.success);
        assert_eq!(stats.last_error, Some("failure 2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_non_retryable_error() {
        let policy = RetryPolicy::new().with_max_retries(3);

        let (result, stats) = retry_with_backoff(
            &policy,
            || async { Err::<i32, _>("permanent failure".to_string()) },
            |e: &String| !e.contains("permanent"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(stats.attempts, 1);
        assert!(stats.delays.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_not_consulted_after_last_attempt() {
        let policy = RetryPolicy::new()
            .with_max_retries(1)
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(false);
        let consulted = AtomicU32::new(0);

        let (result, stats) = retry_with_backoff(
            &policy,
            || async { Err::<(), _>("down".to_string()) },
            |_: &String| {
                consulted.fetch_add(1, Ordering::SeqCst);
                true
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(stats.attempts, 2);
        assert_eq!(consulted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_means_single_try() {
        let policy = RetryPolicy::new().with_max_retries(0);
        let counter = AtomicU32::new(0);

        let (result, _) = retry_with_backoff(
            &policy,
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("nope".to_string()) }
            },
            |_: &String| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
