//! Network state: the shared store, its events and its persisted form.

mod events;
mod persist;
mod store;

pub use events::{Listener, NetworkEvent, RecoveryHook, SubscriptionId};
pub use persist::{JsonFileStorage, MemoryStorage, PersistedCache, PersistedState, StateStorage};
pub use store::{
    CacheEntry, NetworkSnapshot, NetworkStateStore, NetworkStateStoreBuilder, NetworkStatus,
    RecoveryOutcome,
};
