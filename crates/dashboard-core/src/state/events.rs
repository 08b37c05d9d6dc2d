//! Typed publish/subscribe for network state changes.
//!
//! Delivery is synchronous and in registration order. The listener list is
//! snapshotted when a broadcast begins, so a listener registered during a
//! broadcast does not receive it. A panicking listener is logged and skipped;
//! the remaining listeners still run.

use futures::future::BoxFuture;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

use crate::error::Result;

/// Notifications produced by the network state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NetworkEvent {
    /// The connectivity verdict flipped.
    OfflineStateChanged {
        #[serde(rename = "isOffline")]
        is_offline: bool,
    },
    /// A recovery sequence began; sources should refetch immediately.
    #[serde(rename = "network-recovery-started")]
    RecoveryStarted,
}

impl NetworkEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            NetworkEvent::OfflineStateChanged { .. } => "offline-state-changed",
            NetworkEvent::RecoveryStarted => "network-recovery-started",
        }
    }
}

/// Synchronous event listener.
pub type Listener = Arc<dyn Fn(&NetworkEvent) + Send + Sync>;

/// Asynchronous participant awaited by a recovery sequence.
pub type RecoveryHook = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handle returned on registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Ordered list of registered callbacks.
pub(crate) struct Registry<T: Clone> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(SubscriptionId, T)>>,
}

impl<T: Clone> Registry<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, entry: T) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, entry));
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Clone the current entries so callers can run them without the lock.
    pub(crate) fn snapshot(&self) -> Vec<T> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, entry)| entry.clone())
            .collect()
    }
}

impl Registry<Listener> {
    /// Deliver an event to every listener registered right now.
    ///
    /// Returns how many listeners completed without panicking.
    pub(crate) fn broadcast(&self, event: &NetworkEvent) -> usize {
        let listeners = self.snapshot();
        debug!(
            event = event.name(),
            listeners = listeners.len(),
            "Dispatching network event"
        );

        let mut delivered = 0;
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(event = event.name(), "Network event listener panicked"),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recorder(log: &Arc<StdMutex<Vec<String>>>, tag: &'static str) -> Listener {
        let log = Arc::clone(log);
        Arc::new(move |event: &NetworkEvent| {
            log.lock().unwrap().push(format!("{}:{}", tag, event.name()));
        })
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let registry: Registry<Listener> = Registry::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        registry.add(recorder(&log, "a"));
        registry.add(recorder(&log, "b"));

        let delivered = registry.broadcast(&NetworkEvent::RecoveryStarted);

        assert_eq!(delivered, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:network-recovery-started", "b:network-recovery-started"]
        );
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let registry: Registry<Listener> = Registry::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        registry.add(Arc::new(|_: &NetworkEvent| panic!("listener bug")));
        registry.add(recorder(&log, "survivor"));

        let delivered = registry.broadcast(&NetworkEvent::OfflineStateChanged { is_offline: true });

        assert_eq!(delivered, 1);
        assert_eq!(*log.lock().unwrap(), vec!["survivor:offline-state-changed"]);
    }

    #[test]
    fn test_unsubscribe() {
        let registry: Registry<Listener> = Registry::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let id = registry.add(recorder(&log, "gone"));

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        registry.broadcast(&NetworkEvent::RecoveryStarted);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_listener_added_during_broadcast_misses_it() {
        let registry: Arc<Registry<Listener>> = Arc::new(Registry::new());
        let log = Arc::new(StdMutex::new(Vec::new()));

        let inner_registry = Arc::clone(&registry);
        let inner_log = Arc::clone(&log);
        registry.add(Arc::new(move |_: &NetworkEvent| {
            inner_registry.add(recorder(&inner_log, "late"));
        }));

        registry.broadcast(&NetworkEvent::RecoveryStarted);
        assert!(log.lock().unwrap().is_empty());

        registry.broadcast(&NetworkEvent::RecoveryStarted);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_event_serialization() {
        let json =
            serde_json::to_value(NetworkEvent::OfflineStateChanged { is_offline: true }).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "offline-state-changed", "isOffline": true})
        );
        let json = serde_json::to_value(NetworkEvent::RecoveryStarted).unwrap();
        assert_eq!(json, serde_json::json!({"type": "network-recovery-started"}));
    }
}
