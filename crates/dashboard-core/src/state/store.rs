//! The process-wide network state store.
//!
//! One [`NetworkStateStore`] is created at startup and shared as an `Arc`
//! between the connectivity monitor, the transport, the resilient sources and
//! the refresh schedulers. All mutable state sits behind a single mutex that
//! is never held across an `.await` or while listeners run.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::events::{Listener, NetworkEvent, RecoveryHook, Registry, SubscriptionId};
use super::persist::{PersistedCache, PersistedState, StateStorage};
use crate::clock::{to_chrono, DynClock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{DashboardError, Result};

/// A cached payload with its creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub data: Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_stale: bool,
}

impl CacheEntry {
    pub fn new(data: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            data,
            timestamp,
            is_stale: false,
        }
    }

    /// Time elapsed since the entry was written.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }
}

/// Overall health, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Offline,
    Stale,
    Nominal,
}

impl NetworkStatus {
    pub fn message(&self) -> &'static str {
        match self {
            NetworkStatus::Offline => "Offline - Using cached data",
            NetworkStatus::Stale => "Limited connectivity - Data may be outdated",
            NetworkStatus::Nominal => "Online - All systems operational",
        }
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Result of a recovery trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Every recovery hook finished successfully.
    Completed,
    /// Another recovery sequence was already running; nothing was done.
    AlreadyInProgress,
    /// At least one hook failed; the store went back offline.
    Failed,
}

/// Point-in-time view of the store for status display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSnapshot {
    pub is_offline: bool,
    pub is_recovering: bool,
    pub last_online_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub network_error_count: u32,
    /// Entries still served as fresh.
    pub cached_data_count: usize,
    /// All entries, stale ones included.
    pub total_entry_count: usize,
    pub has_stale_data: bool,
    pub status: NetworkStatus,
}

#[derive(Debug)]
struct StoreState {
    is_offline: bool,
    last_online_time: DateTime<Utc>,
    last_update_time: DateTime<Utc>,
    network_error_count: u32,
    cache: HashMap<String, CacheEntry>,
}

/// Shared connectivity verdict, error counter and data cache.
pub struct NetworkStateStore {
    me: Weak<NetworkStateStore>,
    clock: DynClock,
    storage: Option<Arc<dyn StateStorage>>,
    state: Mutex<StoreState>,
    /// Serializes snapshot-and-save so writes land in mutation order.
    write_lock: Mutex<()>,
    write_pending: AtomicBool,
    recovering: AtomicBool,
    listeners: Registry<Listener>,
    recovery_hooks: Registry<RecoveryHook>,
}

/// Builder for [`NetworkStateStore`].
#[derive(Default)]
pub struct NetworkStateStoreBuilder {
    clock: Option<DynClock>,
    storage: Option<Arc<dyn StateStorage>>,
}

impl NetworkStateStoreBuilder {
    pub fn clock(mut self, clock: DynClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Restore from and persist to `storage`.
    pub fn storage(mut self, storage: Arc<dyn StateStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Build the store, restoring any previously persisted state.
    ///
    /// A storage backend that fails to load is logged and the store starts
    /// empty.
    pub fn build(self) -> Arc<NetworkStateStore> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let now = clock.now();

        let store = Arc::new_cyclic(|me| NetworkStateStore {
            me: me.clone(),
            clock,
            storage: self.storage,
            state: Mutex::new(StoreState {
                is_offline: false,
                last_online_time: now,
                last_update_time: now,
                network_error_count: 0,
                cache: HashMap::new(),
            }),
            write_lock: Mutex::new(()),
            write_pending: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
            listeners: Registry::new(),
            recovery_hooks: Registry::new(),
        });

        if let Some(storage) = &store.storage {
            match storage.load() {
                Ok(Some(persisted)) => store.apply_persisted(persisted),
                Ok(None) => debug!("No persisted network state found"),
                Err(e) => warn!("Failed to load persisted network state, starting fresh: {}", e),
            }
        }

        store
    }
}

impl NetworkStateStore {
    pub fn builder() -> NetworkStateStoreBuilder {
        NetworkStateStoreBuilder::default()
    }

    /// A store on the system clock without persistence.
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn clock(&self) -> &DynClock {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================
    // Connectivity
    // ========================================

    pub fn is_offline(&self) -> bool {
        self.lock().is_offline
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    pub fn last_online_time(&self) -> DateTime<Utc> {
        self.lock().last_online_time
    }

    pub fn last_update_time(&self) -> DateTime<Utc> {
        self.lock().last_update_time
    }

    /// Enter the offline state.
    ///
    /// Broadcasts only when the flag actually flips, so listeners see one
    /// event per outage no matter how many failures led to it.
    pub fn set_offline(&self) {
        let changed = {
            let mut state = self.lock();
            let was_offline = state.is_offline;
            state.is_offline = true;
            !was_offline
        };
        self.recovering.store(false, Ordering::SeqCst);

        if changed {
            warn!("Network is offline, serving cached data");
            self.listeners
                .broadcast(&NetworkEvent::OfflineStateChanged { is_offline: true });
        }
    }

    /// Enter the online state and run a recovery sequence.
    ///
    /// Recovery is attempted on every call, even when already online; the
    /// reentrancy guard inside [`Self::trigger_network_recovery`] keeps it
    /// from running twice at once.
    pub async fn set_online(&self) -> RecoveryOutcome {
        let changed = {
            let mut state = self.lock();
            let was_offline = state.is_offline;
            state.is_offline = false;
            state.last_online_time = self.clock.now();
            was_offline
        };
        self.persist();

        if changed {
            info!("Network is back online");
            self.listeners
                .broadcast(&NetworkEvent::OfflineStateChanged { is_offline: false });
        }

        self.trigger_network_recovery().await
    }

    /// Run one recovery sequence unless one is already in flight.
    ///
    /// Broadcasts [`NetworkEvent::RecoveryStarted`], then awaits every
    /// registered recovery hook. The in-progress flag is cleared when this
    /// future completes or is dropped.
    pub async fn trigger_network_recovery(&self) -> RecoveryOutcome {
        if self
            .recovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Network recovery already in progress, skipping");
            return RecoveryOutcome::AlreadyInProgress;
        }
        let _guard = RecoveryGuard(&self.recovering);

        info!("Starting network recovery");
        self.listeners.broadcast(&NetworkEvent::RecoveryStarted);

        match self.run_recovery_hooks().await {
            Ok(()) => {
                {
                    let mut state = self.lock();
                    let now = self.clock.now();
                    state.last_update_time = state.last_update_time.max(now);
                    state.network_error_count = 0;
                }
                self.persist();
                info!("Network recovery completed");
                RecoveryOutcome::Completed
            }
            Err(e) => {
                error!("Network recovery failed: {}", e);
                self.set_offline();
                RecoveryOutcome::Failed
            }
        }
    }

    async fn run_recovery_hooks(&self) -> Result<()> {
        let hooks = self.recovery_hooks.snapshot();
        if hooks.is_empty() {
            return Ok(());
        }
        debug!(hooks = hooks.len(), "Awaiting recovery hooks");

        let results =
            join_all(hooks.iter().map(|hook| AssertUnwindSafe(hook()).catch_unwind())).await;

        let mut first_error = None;
        for result in results {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(_) => Err(DashboardError::Other("recovery hook panicked".into())),
            };
            if let Err(e) = outcome {
                warn!("Recovery hook failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ========================================
    // Cache
    // ========================================

    /// Write `data` under `key`, timestamped now.
    pub fn cache_data(&self, key: &str, data: Value) {
        let now = self.clock.now();
        self.cache_data_at(key, data, now);
    }

    /// Write `data` under `key` with an explicit timestamp.
    ///
    /// Counts as a success: the error counter goes back to zero.
    pub fn cache_data_at(&self, key: &str, data: Value, timestamp: DateTime<Utc>) {
        {
            let mut state = self.lock();
            state
                .cache
                .insert(key.to_string(), CacheEntry::new(data, timestamp));
            state.last_update_time = state.last_update_time.max(timestamp);
            state.network_error_count = 0;
        }
        debug!(key, "Cached data");
        self.persist();
    }

    /// The cached payload, unless missing or marked stale.
    pub fn get_cached_data(&self, key: &str) -> Option<Value> {
        self.cached_entry(key).map(|entry| entry.data)
    }

    /// The cached entry with its timestamp, unless missing or marked stale.
    pub fn cached_entry(&self, key: &str) -> Option<CacheEntry> {
        self.lock()
            .cache
            .get(key)
            .filter(|entry| !entry.is_stale)
            .cloned()
    }

    /// Any cached entry for `key`, stale or not.
    ///
    /// Only for degraded fallback after a failed fetch.
    pub fn stale_fallback(&self, key: &str) -> Option<CacheEntry> {
        self.lock().cache.get(key).cloned()
    }

    /// Flag an entry as stale without dropping it. Returns false if absent.
    pub fn mark_data_stale(&self, key: &str) -> bool {
        let marked = match self.lock().cache.get_mut(key) {
            Some(entry) => {
                entry.is_stale = true;
                true
            }
            None => false,
        };
        if marked {
            debug!(key, "Marked cached data stale");
            self.persist();
        }
        marked
    }

    pub fn clear_cache(&self) {
        self.lock().cache.clear();
        info!("Cleared data cache");
        self.persist();
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn clear_prefix(&self, prefix: &str) -> usize {
        let removed = {
            let mut state = self.lock();
            let before = state.cache.len();
            state.cache.retain(|key, _| !key.starts_with(prefix));
            before - state.cache.len()
        };
        if removed > 0 {
            debug!(prefix, removed, "Cleared cached entries");
            self.persist();
        }
        removed
    }

    /// Number of entries that are not marked stale.
    pub fn cached_data_count(&self) -> usize {
        self.lock()
            .cache
            .values()
            .filter(|entry| !entry.is_stale)
            .count()
    }

    /// Number of entries, stale ones included.
    pub fn total_entry_count(&self) -> usize {
        self.lock().cache.len()
    }

    /// Keys of non-stale entries with their timestamps.
    pub fn cached_entries(&self) -> BTreeMap<String, DateTime<Utc>> {
        self.lock()
            .cache
            .iter()
            .filter(|(_, entry)| !entry.is_stale)
            .map(|(key, entry)| (key.clone(), entry.timestamp))
            .collect()
    }

    // ========================================
    // Error counter
    // ========================================

    pub fn network_error_count(&self) -> u32 {
        self.lock().network_error_count
    }

    /// Count one network failure; at the threshold the store goes offline.
    ///
    /// Returns the new count.
    pub fn increment_network_errors(&self) -> u32 {
        let count = {
            let mut state = self.lock();
            state.network_error_count = state.network_error_count.saturating_add(1);
            state.network_error_count
        };
        warn!(count, "Network error recorded");
        self.persist();

        if count >= CacheConfig::NETWORK_ERROR_THRESHOLD {
            self.set_offline();
        }
        count
    }

    pub fn reset_network_errors(&self) {
        self.lock().network_error_count = 0;
        self.persist();
    }

    // ========================================
    // Derived values
    // ========================================

    /// True when nothing was written for longer than the stale threshold.
    pub fn has_stale_data(&self) -> bool {
        let last_update = self.lock().last_update_time;
        self.clock.now() - last_update > to_chrono(CacheConfig::STALE_THRESHOLD)
    }

    pub fn should_retry(&self) -> bool {
        self.network_error_count() < CacheConfig::NETWORK_ERROR_THRESHOLD
    }

    pub fn status(&self) -> NetworkStatus {
        if self.is_offline() {
            NetworkStatus::Offline
        } else if self.has_stale_data() {
            NetworkStatus::Stale
        } else {
            NetworkStatus::Nominal
        }
    }

    pub fn status_message(&self) -> &'static str {
        self.status().message()
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        let (is_offline, last_online_time, last_update_time, network_error_count, fresh, total) = {
            let state = self.lock();
            (
                state.is_offline,
                state.last_online_time,
                state.last_update_time,
                state.network_error_count,
                state.cache.values().filter(|entry| !entry.is_stale).count(),
                state.cache.len(),
            )
        };
        let has_stale_data =
            self.clock.now() - last_update_time > to_chrono(CacheConfig::STALE_THRESHOLD);
        let status = if is_offline {
            NetworkStatus::Offline
        } else if has_stale_data {
            NetworkStatus::Stale
        } else {
            NetworkStatus::Nominal
        };

        NetworkSnapshot {
            is_offline,
            is_recovering: self.is_recovering(),
            last_online_time,
            last_update_time,
            network_error_count,
            cached_data_count: fresh,
            total_entry_count: total,
            has_stale_data,
            status,
        }
    }

    // ========================================
    // Subscriptions
    // ========================================

    /// Register a synchronous listener for every future event.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        self.listeners.add(Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(id)
    }

    /// Receive events on a channel instead of a callback.
    ///
    /// Dropping the receiver leaves a no-op listener behind until
    /// [`Self::unsubscribe`] is called with the returned id.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            let _ = tx.send(*event);
        });
        (id, rx)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Register a participant awaited by every recovery sequence.
    pub fn add_recovery_hook(&self, hook: RecoveryHook) -> SubscriptionId {
        self.recovery_hooks.add(hook)
    }

    pub fn remove_recovery_hook(&self, id: SubscriptionId) -> bool {
        self.recovery_hooks.remove(id)
    }

    // ========================================
    // Persistence
    // ========================================

    /// Durable fields in their serialized shape.
    pub fn to_persisted(&self) -> PersistedState {
        let state = self.lock();
        PersistedState {
            last_online_time: state.last_online_time,
            last_update_time: state.last_update_time,
            network_error_count: state.network_error_count,
            cache: PersistedCache::encode(&state.cache),
        }
    }

    /// Replace the durable fields from an external representation.
    pub fn restore(&self, persisted: PersistedState) {
        self.apply_persisted(persisted);
        self.persist();
    }

    fn apply_persisted(&self, persisted: PersistedState) {
        let cache = persisted.cache.decode();
        let entries = cache.len();
        {
            let mut state = self.lock();
            state.last_online_time = persisted.last_online_time;
            state.last_update_time = persisted.last_update_time;
            state.network_error_count = persisted.network_error_count;
            state.cache = cache;
        }
        info!(entries, "Restored persisted network state");
    }

    /// Write the current durable fields to storage now.
    pub fn flush(&self) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let _write = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.write_pending.store(false, Ordering::SeqCst);
        let persisted = self.to_persisted();
        storage.save(&persisted)
    }

    /// Schedule a write after a mutation.
    ///
    /// On a runtime the write runs on the blocking pool and bursts of
    /// mutations collapse into one write. Without a runtime it happens inline.
    fn persist(&self) {
        if self.storage.is_none() {
            return;
        }

        let Ok(handle) = Handle::try_current() else {
            self.flush_logged();
            return;
        };
        if self.write_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let me = self.me.clone();
        handle.spawn_blocking(move || {
            if let Some(store) = me.upgrade() {
                store.flush_logged();
            }
        });
    }

    fn flush_logged(&self) {
        if let Err(e) = self.flush() {
            warn!("Failed to persist network state: {}", e);
        }
    }
}

impl Drop for NetworkStateStore {
    fn drop(&mut self) {
        if self.write_pending.load(Ordering::SeqCst) {
            self.flush_logged();
        }
    }
}

/// Clears the recovery flag when dropped.
struct RecoveryGuard<'a>(&'a AtomicBool);

impl Drop for RecoveryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
