//! Per-source refresh scheduler.
//!
//! State machine: `Stopped -> Running -> Paused -> Running -> Stopped`.
//!
//! - `start()` fetches immediately, then keeps fetching at the interval the
//!   policy returns after each fetch. Starting a running scheduler restarts it.
//! - An offline event pauses a running scheduler; an online event resumes a
//!   paused one with one immediate fetch. A scheduler stopped explicitly stays
//!   stopped.
//! - A recovery sequence triggers one out-of-band fetch without resetting the
//!   timer, unless a fetch started moments ago or is still in flight.
//! - Stopping or pausing cancels the timer only. A fetch already in flight
//!   runs to completion so its result still reaches the cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::interval::IntervalPolicy;
use crate::clock::to_chrono;
use crate::error::Result;
use crate::state::{NetworkEvent, NetworkStateStore, SubscriptionId};

/// A recovery fetch arriving this soon after another fetch started is
/// folded into it.
const RECOVERY_COALESCE_WINDOW: Duration = Duration::from_secs(2);

/// Something a scheduler can refresh.
#[async_trait]
pub trait RefreshSource: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    fn name(&self) -> &str;

    async fn refresh(&self) -> Result<Self::Output>;
}

/// Lifecycle state of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    /// Stopped because the network went away; resumes when it returns.
    Paused,
}

/// Status for display.
#[derive(Debug, Clone)]
pub struct RefreshStatus {
    pub state: SchedulerState,
    pub last_refresh: Option<DateTime<Utc>>,
    pub current_interval: Option<Duration>,
    pub next_refresh: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchTrigger {
    Scheduled,
    Recovery,
    Manual,
}

struct SchedulerInner<T> {
    state: SchedulerState,
    task: Option<JoinHandle<()>>,
    latest: Option<T>,
    last_refresh: Option<DateTime<Utc>>,
    last_fetch_started: Option<Instant>,
    current_interval: Option<Duration>,
    next_refresh: Option<DateTime<Utc>>,
    subscriptions: Option<(SubscriptionId, SubscriptionId)>,
}

/// Drives one [`RefreshSource`] on a timer and reacts to network events.
pub struct RefreshScheduler<S: RefreshSource> {
    source: Arc<S>,
    policy: Arc<dyn IntervalPolicy<S::Output>>,
    store: Arc<NetworkStateStore>,
    inner: Mutex<SchedulerInner<S::Output>>,
    fetch_gate: tokio::sync::Mutex<()>,
}

impl<S: RefreshSource> RefreshScheduler<S> {
    pub fn new(
        source: Arc<S>,
        policy: Arc<dyn IntervalPolicy<S::Output>>,
        store: Arc<NetworkStateStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            policy,
            store,
            inner: Mutex::new(SchedulerInner {
                state: SchedulerState::Stopped,
                task: None,
                latest: None,
                last_refresh: None,
                last_fetch_started: None,
                current_interval: None,
                next_refresh: None,
                subscriptions: None,
            }),
            fetch_gate: tokio::sync::Mutex::new(()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerInner<S::Output>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn state(&self) -> SchedulerState {
        self.lock().state
    }

    pub fn status(&self) -> RefreshStatus {
        let inner = self.lock();
        RefreshStatus {
            state: inner.state,
            last_refresh: inner.last_refresh,
            current_interval: inner.current_interval,
            next_refresh: inner.next_refresh,
        }
    }

    /// Run `f` against the output of the last successful refresh.
    pub fn with_latest<R>(&self, f: impl FnOnce(Option<&S::Output>) -> R) -> R {
        f(self.lock().latest.as_ref())
    }

    /// Begin fetching: once now, then on the policy's interval.
    ///
    /// A running scheduler is restarted. While the store is offline the
    /// scheduler goes straight to `Paused` without fetching.
    pub fn start(self: &Arc<Self>) {
        let offline = self.store.is_offline();
        let mut inner = self.lock();
        if let Some(task) = inner.task.take() {
            debug!(source = self.name(), "Restarting refresh scheduler");
            task.abort();
        }

        if offline {
            info!(source = self.name(), "Network offline, refresh scheduler paused");
            inner.state = SchedulerState::Paused;
            inner.next_refresh = None;
            return;
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!(source = self.name(), "Cannot start refresh scheduler: {}", e);
                inner.state = SchedulerState::Stopped;
                return;
            }
        };

        inner.state = SchedulerState::Running;
        inner.last_fetch_started = Some(Instant::now());
        let this = Arc::clone(self);
        inner.task = Some(handle.spawn(async move { this.run_loop().await }));
        debug!(source = self.name(), "Refresh scheduler started");
    }

    /// Stop fetching. Idempotent.
    pub fn stop(&self) {
        self.halt(SchedulerState::Stopped);
    }

    fn pause(&self) {
        if self.state() == SchedulerState::Running {
            info!(source = self.name(), "Pausing refresh while offline");
            self.halt(SchedulerState::Paused);
        }
    }

    fn resume(self: &Arc<Self>) {
        if self.state() == SchedulerState::Paused {
            info!(source = self.name(), "Resuming refresh");
            self.start();
        }
    }

    fn halt(&self, state: SchedulerState) {
        let mut inner = self.lock();
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        inner.state = state;
        inner.next_refresh = None;
    }

    /// Fetch now, outside the timer.
    pub async fn refresh_now(&self) -> Result<()> {
        self.fetch_once(FetchTrigger::Manual).await
    }

    /// Follow the store: pause and resume on connectivity changes and fetch
    /// during recovery.
    ///
    /// The store only holds weak references to the scheduler.
    pub fn attach(self: &Arc<Self>) {
        self.detach_subscriptions();

        let weak: Weak<Self> = Arc::downgrade(self);
        let listener = self.store.subscribe(move |event| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            match event {
                NetworkEvent::OfflineStateChanged { is_offline: true } => this.pause(),
                NetworkEvent::OfflineStateChanged { is_offline: false } => this.resume(),
                NetworkEvent::RecoveryStarted => {}
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let hook = self.store.add_recovery_hook(Arc::new(move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(this) => this.recovery_fetch().await,
                    None => Ok(()),
                }
            }
            .boxed()
        }));

        self.lock().subscriptions = Some((listener, hook));
    }

    /// Undo [`Self::attach`] and stop.
    pub fn detach(&self) {
        self.detach_subscriptions();
        self.stop();
    }

    fn detach_subscriptions(&self) {
        let subscriptions = self.lock().subscriptions.take();
        if let Some((listener, hook)) = subscriptions {
            self.store.unsubscribe(listener);
            self.store.remove_recovery_hook(hook);
        }
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            // Aborting the loop must not cancel the request it is waiting on
            let this = Arc::clone(&self);
            let fetch = tokio::spawn(async move {
                // Failures are logged inside; the timer keeps going
                let _ = this.fetch_once(FetchTrigger::Scheduled).await;
            });
            if let Err(e) = fetch.await {
                error!(source = self.name(), "Refresh task failed: {}", e);
            }
            let interval = self.schedule_next();
            tokio::time::sleep(interval).await;
        }
    }

    fn schedule_next(&self) -> Duration {
        let now = self.store.now();
        let mut inner = self.lock();
        let interval = self.policy.next_interval(inner.latest.as_ref(), now);
        inner.current_interval = Some(interval);
        inner.next_refresh = Some(now + to_chrono(interval));
        debug!(source = self.name(), ?interval, "Next refresh scheduled");
        interval
    }

    async fn recovery_fetch(&self) -> Result<()> {
        let (state, last_started) = {
            let inner = self.lock();
            (inner.state, inner.last_fetch_started)
        };
        if state != SchedulerState::Running {
            return Ok(());
        }
        if last_started.is_some_and(|at| at.elapsed() < RECOVERY_COALESCE_WINDOW) {
            debug!(source = self.name(), "Recovery fetch folded into recent fetch");
            return Ok(());
        }
        let Ok(_gate) = self.fetch_gate.try_lock() else {
            debug!(source = self.name(), "Recovery fetch folded into in-flight fetch");
            return Ok(());
        };

        match self.fetch_locked(FetchTrigger::Recovery).await {
            // Only a network failure says the recovery failed
            Err(e) if !e.is_network_error() => {
                warn!(source = self.name(), "Recovery refresh failed: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    async fn fetch_once(&self, trigger: FetchTrigger) -> Result<()> {
        let _gate = self.fetch_gate.lock().await;
        self.fetch_locked(trigger).await
    }

    async fn fetch_locked(&self, trigger: FetchTrigger) -> Result<()> {
        self.lock().last_fetch_started = Some(Instant::now());
        debug!(source = self.name(), ?trigger, "Refreshing");

        match self.source.refresh().await {
            Ok(output) => {
                let now = self.store.now();
                let mut inner = self.lock();
                inner.latest = Some(output);
                inner.last_refresh = Some(now);
                Ok(())
            }
            Err(e) => {
                warn!(source = self.name(), ?trigger, "Refresh failed: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DashboardError;
    use crate::schedule::interval::FixedInterval;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSource {
        calls: AtomicU32,
        delay: Duration,
        fail: bool,
    }

    impl CountingSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
                fail: false,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RefreshSource for CountingSource {
        type Output = u32;

        fn name(&self) -> &str {
            "counting"
        }

        async fn refresh(&self) -> Result<u32> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(DashboardError::Other("bad payload".into()));
            }
            Ok(n)
        }
    }

    fn scheduler(
        source: Arc<CountingSource>,
        store: Arc<NetworkStateStore>,
        every: Duration,
    ) -> Arc<RefreshScheduler<CountingSource>> {
        RefreshScheduler::new(source, Arc::new(FixedInterval(every)), store)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fetches_immediately_then_on_interval() {
        let source = CountingSource::new();
        let sched = scheduler(source.clone(), NetworkStateStore::new(), Duration::from_secs(60));

        sched.start();
        settle().await;
        assert_eq!(source.calls(), 1);
        assert_eq!(sched.state(), SchedulerState::Running);
        assert_eq!(sched.with_latest(|v| v.copied()), Some(1));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.calls(), 2);

        let status = sched.status();
        assert_eq!(status.current_interval, Some(Duration::from_secs(60)));
        assert!(status.last_refresh.is_some());
        assert!(status.next_refresh.is_some());

        sched.stop();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.calls(), 2);
        assert_eq!(sched.state(), SchedulerState::Stopped);
        assert!(sched.status().next_refresh.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_does_not_stack_timers() {
        let source = CountingSource::new();
        let sched = scheduler(source.clone(), NetworkStateStore::new(), Duration::from_secs(60));

        sched.start();
        settle().await;
        sched.start();
        settle().await;
        assert_eq!(source.calls(), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_offline_pauses() {
        let store = NetworkStateStore::new();
        store.set_offline();
        let source = CountingSource::new();
        let sched = scheduler(source.clone(), store, Duration::from_secs(60));

        sched.start();
        settle().await;

        assert_eq!(sched.state(), SchedulerState::Paused);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_survives_online_event() {
        let store = NetworkStateStore::new();
        let source = CountingSource::new();
        let sched = scheduler(source.clone(), store.clone(), Duration::from_secs(60));
        sched.attach();

        sched.start();
        settle().await;
        sched.stop();
        store.set_offline();
        store.set_online().await;
        settle().await;

        assert_eq!(sched.state(), SchedulerState::Stopped);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_fetch_is_out_of_band() {
        let store = NetworkStateStore::new();
        let source = CountingSource::new();
        let sched = scheduler(source.clone(), store.clone(), Duration::from_secs(60));
        sched.attach();
        sched.start();
        settle().await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        store.trigger_network_recovery().await;
        assert_eq!(source.calls(), 2);

        // The timer phase is unchanged: next tick still at t=60s
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_skips_in_flight_fetch() {
        let store = NetworkStateStore::new();
        let source = Arc::new(CountingSource {
            calls: AtomicU32::new(0),
            delay: Duration::from_secs(5),
            fail: false,
        });
        let sched = scheduler(source.clone(), store.clone(), Duration::from_secs(60));
        sched.attach();
        sched.start();
        settle().await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        // Past the coalesce window but the first fetch is still running
        let outcome = store.trigger_network_recovery().await;
        assert_eq!(outcome, crate::state::RecoveryOutcome::Completed);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_network_failure_does_not_fail_recovery() {
        let store = NetworkStateStore::new();
        let source = Arc::new(CountingSource {
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
            fail: true,
        });
        let sched = scheduler(source.clone(), store.clone(), Duration::from_secs(60));
        sched.attach();
        sched.start();
        settle().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let outcome = store.trigger_network_recovery().await;

        assert_eq!(outcome, crate::state::RecoveryOutcome::Completed);
        assert_eq!(source.calls(), 2);
        assert!(!store.is_offline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_in_flight_fetch_finish() {
        let source = Arc::new(CountingSource {
            calls: AtomicU32::new(0),
            delay: Duration::from_secs(5),
            fail: false,
        });
        let sched = scheduler(source.clone(), NetworkStateStore::new(), Duration::from_secs(60));

        sched.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        sched.stop();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(source.calls(), 1);
        assert_eq!(sched.with_latest(|v| v.copied()), Some(1));
        assert!(sched.status().last_refresh.is_some());
        assert_eq!(sched.state(), SchedulerState::Stopped);

        // The timer itself is gone
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_unsubscribes() {
        let store = NetworkStateStore::new();
        let sched = scheduler(CountingSource::new(), store.clone(), Duration::from_secs(60));

        sched.attach();
        sched.attach();
        assert_eq!(store.listener_count(), 1);

        sched.detach();
        assert_eq!(store.listener_count(), 0);
        assert_eq!(sched.state(), SchedulerState::Stopped);
    }
}
