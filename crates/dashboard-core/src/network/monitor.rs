//! Connectivity monitoring.
//!
//! The monitor owns the connectivity verdict that feeds the store. It probes
//! on a timer (faster while offline), and treats platform events as hints: a
//! hint only schedules a debounced re-probe, it never flips state on its own.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::probe::ConnectivityProbe;
use crate::config::{ConnectivityDefaults, DashboardConfig};
use crate::state::NetworkStateStore;

/// Outcome of one connectivity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_offline(&self) -> bool {
        *self == Connectivity::Offline
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connectivity::Online => f.write_str("online"),
            Connectivity::Offline => f.write_str("offline"),
        }
    }
}

/// Low-confidence platform events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformSignal {
    InterfaceUp,
    InterfaceDown,
    /// The display woke up or became visible again.
    Wake,
}

#[derive(Default)]
struct MonitorTasks {
    watch: Option<JoinHandle<()>>,
    hint: Option<JoinHandle<()>>,
}

/// Probes connectivity and forwards verdict changes to the store.
pub struct ConnectivityMonitor {
    probe: Arc<dyn ConnectivityProbe>,
    store: Arc<NetworkStateStore>,
    offline_recheck: Duration,
    online_verify: Duration,
    hint_debounce: Duration,
    tasks: Mutex<MonitorTasks>,
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn ConnectivityProbe>, store: Arc<NetworkStateStore>) -> Arc<Self> {
        Self::with_intervals(
            probe,
            store,
            ConnectivityDefaults::OFFLINE_RECHECK_INTERVAL,
            ConnectivityDefaults::ONLINE_VERIFY_INTERVAL,
        )
    }

    pub fn from_config(
        probe: Arc<dyn ConnectivityProbe>,
        store: Arc<NetworkStateStore>,
        config: &DashboardConfig,
    ) -> Arc<Self> {
        Self::with_intervals(
            probe,
            store,
            config.offline_recheck_interval,
            config.online_verify_interval,
        )
    }

    pub fn with_intervals(
        probe: Arc<dyn ConnectivityProbe>,
        store: Arc<NetworkStateStore>,
        offline_recheck: Duration,
        online_verify: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            probe,
            store,
            offline_recheck,
            online_verify,
            hint_debounce: ConnectivityDefaults::HINT_DEBOUNCE,
            tasks: Mutex::new(MonitorTasks::default()),
        })
    }

    fn tasks(&self) -> MutexGuard<'_, MonitorTasks> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Probe once and forward the verdict to the store if it changes state.
    ///
    /// A probe that errors counts as offline.
    pub async fn check_connectivity(&self) -> Connectivity {
        let verdict = match self.probe.is_online().await {
            Ok(true) => Connectivity::Online,
            Ok(false) => Connectivity::Offline,
            Err(e) => {
                warn!("Connectivity check failed, assuming offline: {}", e);
                Connectivity::Offline
            }
        };
        debug!(%verdict, "Connectivity check finished");

        let offline = self.store.is_offline();
        match verdict {
            Connectivity::Offline if !offline => {
                info!("Network lost, transitioning to offline state");
                self.store.set_offline();
            }
            Connectivity::Online if offline => {
                info!("Network restored, transitioning to online state");
                self.store.set_online().await;
            }
            _ => {}
        }
        verdict
    }

    /// Start the continuous watch loop.
    ///
    /// Probes immediately, then every `online_verify` interval while online
    /// and every `offline_recheck` interval while offline. `on_change` sees
    /// the first verdict and every change after it. Calling `start` again
    /// replaces the running loop.
    pub fn start<F>(self: &Arc<Self>, on_change: F)
    where
        F: Fn(Connectivity) + Send + Sync + 'static,
    {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!("Cannot start connectivity monitor: {}", e);
                return;
            }
        };

        info!("Starting continuous network monitoring");
        let this = Arc::clone(self);
        let task = handle.spawn(async move {
            let mut last = None;
            loop {
                let verdict = this.check_connectivity().await;
                if last != Some(verdict) {
                    on_change(verdict);
                    last = Some(verdict);
                }
                let wait = match verdict {
                    Connectivity::Online => this.online_verify,
                    Connectivity::Offline => this.offline_recheck,
                };
                tokio::time::sleep(wait).await;
            }
        });

        if let Some(previous) = self.tasks().watch.replace(task) {
            previous.abort();
        }
    }

    /// Schedule a debounced re-check in response to a platform event.
    ///
    /// Hints arriving while a check is already pending collapse into it.
    pub fn hint(self: &Arc<Self>, signal: PlatformSignal) {
        let mut tasks = self.tasks();
        if tasks.hint.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!(?signal, "Connectivity re-check already pending");
            return;
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!(?signal, "Cannot schedule connectivity re-check: {}", e);
                return;
            }
        };

        info!(?signal, "Platform network event, verifying connectivity");
        let this = Arc::clone(self);
        tasks.hint = Some(handle.spawn(async move {
            tokio::time::sleep(this.hint_debounce).await;
            this.check_connectivity().await;
        }));
    }

    pub fn is_running(&self) -> bool {
        self.tasks()
            .watch
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Abort the watch loop and any pending hint check.
    pub fn stop(&self) {
        let mut tasks = self.tasks();
        if let Some(task) = tasks.watch.take() {
            info!("Stopping network monitoring");
            task.abort();
        }
        if let Some(task) = tasks.hint.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DashboardError, Result};
    use crate::state::NetworkEvent;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct SwitchProbe {
        online: AtomicBool,
        broken: AtomicBool,
        calls: AtomicU32,
    }

    impl SwitchProbe {
        fn new(online: bool) -> Arc<Self> {
            Arc::new(Self {
                online: AtomicBool::new(online),
                broken: AtomicBool::new(false),
                calls: AtomicU32::new(0),
            })
        }

        fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConnectivityProbe for SwitchProbe {
        async fn is_online(&self) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.broken.load(Ordering::SeqCst) {
                return Err(DashboardError::network("probe exploded"));
            }
            Ok(self.online.load(Ordering::SeqCst))
        }
    }

    fn count_offline_events(store: &NetworkStateStore) -> Arc<AtomicU32> {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        store.subscribe(move |event| {
            if let NetworkEvent::OfflineStateChanged { .. } = event {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        count
    }

    #[tokio::test]
    async fn test_check_forwards_only_changes() {
        let store = NetworkStateStore::new();
        let events = count_offline_events(&store);
        let probe = SwitchProbe::new(false);
        let monitor = ConnectivityMonitor::new(probe.clone(), store.clone());

        assert_eq!(monitor.check_connectivity().await, Connectivity::Offline);
        assert_eq!(monitor.check_connectivity().await, Connectivity::Offline);
        assert!(store.is_offline());
        assert_eq!(events.load(Ordering::SeqCst), 1);

        probe.set_online(true);
        assert_eq!(monitor.check_connectivity().await, Connectivity::Online);
        assert_eq!(monitor.check_connectivity().await, Connectivity::Online);
        assert!(!store.is_offline());
        assert_eq!(events.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_probe_error_means_offline() {
        let store = NetworkStateStore::new();
        let probe = SwitchProbe::new(true);
        probe.broken.store(true, Ordering::SeqCst);
        let monitor = ConnectivityMonitor::new(probe, store.clone());

        assert_eq!(monitor.check_connectivity().await, Connectivity::Offline);
        assert!(store.is_offline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hints_are_debounced_and_collapsed() {
        let store = NetworkStateStore::new();
        let probe = SwitchProbe::new(false);
        let monitor = ConnectivityMonitor::new(probe.clone(), store.clone());

        monitor.hint(PlatformSignal::InterfaceDown);
        tokio::time::sleep(Duration::from_millis(300)).await;
        monitor.hint(PlatformSignal::InterfaceUp);
        monitor.hint(PlatformSignal::Wake);

        // Not trusted immediately
        assert_eq!(probe.calls(), 0);
        assert!(!store.is_offline());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(probe.calls(), 1);
        assert!(store.is_offline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_loop_cadence_and_callback() {
        let store = NetworkStateStore::new();
        let probe = SwitchProbe::new(true);
        let monitor = ConnectivityMonitor::with_intervals(
            probe.clone(),
            store.clone(),
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        monitor.start(move |verdict| sink.lock().unwrap().push(verdict));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(probe.calls(), 1);
        assert!(monitor.is_running());

        probe.set_online(false);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(probe.calls(), 2);
        assert!(store.is_offline());

        // Offline: re-check every 30s
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(probe.calls(), 4);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Connectivity::Online, Connectivity::Offline]
        );

        monitor.stop();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(probe.calls(), 4);
        assert!(!monitor.is_running());
    }
}
