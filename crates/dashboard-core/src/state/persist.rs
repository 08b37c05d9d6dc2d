//! Persisted representation of the network state store.
//!
//! The on-disk shape is kept separate from the in-memory store. Older
//! writers serialized the cache either as a plain object or as a list of
//! `[key, entry]` pairs; [`PersistedCache::decode`] turns both into the map
//! the store works with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::debug;

use super::store::CacheEntry;
use crate::config::StorageConfig;
use crate::error::{DashboardError, Result};

/// Serialized form of the durable store fields.
///
/// `is_offline` and `is_recovering` are not persisted; both are recomputed
/// at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_online_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_update_time: DateTime<Utc>,
    #[serde(default, alias = "networkErrors")]
    pub network_error_count: u32,
    #[serde(default, alias = "cachedData")]
    pub cache: PersistedCache,
}

/// The cache field as found on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PersistedCache {
    /// `{"key": entry, ...}`
    Record(BTreeMap<String, CacheEntry>),
    /// `[["key", entry], ...]`
    Pairs(Vec<(String, CacheEntry)>),
    /// `null`
    Empty,
}

impl Default for PersistedCache {
    fn default() -> Self {
        PersistedCache::Record(BTreeMap::new())
    }
}

impl PersistedCache {
    /// Convert whatever was persisted into the in-memory mapping.
    ///
    /// Later pairs win over earlier ones with the same key.
    pub fn decode(self) -> HashMap<String, CacheEntry> {
        match self {
            PersistedCache::Record(map) => map.into_iter().collect(),
            PersistedCache::Pairs(pairs) => pairs.into_iter().collect(),
            PersistedCache::Empty => HashMap::new(),
        }
    }

    /// Always written as a plain record, sorted by key.
    pub fn encode(cache: &HashMap<String, CacheEntry>) -> Self {
        PersistedCache::Record(
            cache
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Durable backend for [`PersistedState`].
pub trait StateStorage: Send + Sync {
    /// `Ok(None)` when nothing was saved yet.
    fn load(&self) -> Result<Option<PersistedState>>;
    fn save(&self, state: &PersistedState) -> Result<()>;
}

/// JSON file under a state directory, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    /// Store `offline-state.json` inside `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir
                .as_ref()
                .join(format!("{}.json", StorageConfig::STATE_KEY)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStorage for JsonFileStorage {
    fn load(&self) -> Result<Option<PersistedState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut contents = String::new();
        File::open(&self.path)
            .and_then(|mut file| file.read_to_string(&mut contents))
            .map_err(|e| DashboardError::Io {
                message: format!("Failed to read {}", self.path.display()),
                path: Some(self.path.clone()),
                source: Some(e),
            })?;

        let state = serde_json::from_str(&contents).map_err(|e| DashboardError::Json {
            message: format!("Failed to parse {}: {}", self.path.display(), e),
            source: Some(e),
        })?;
        Ok(Some(state))
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        atomic_write_json(&self.path, state)
    }
}

/// Write JSON to a uniquely named sibling temp file, fsync it, then rename it
/// over the target. Concurrent writers never share a temp file.
fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !parent.exists() {
        fs::create_dir_all(parent).map_err(|e| DashboardError::io_with_path(e, parent))?;
    }

    let serialized = serde_json::to_string_pretty(data)?;
    let mut temp =
        NamedTempFile::new_in(parent).map_err(|e| DashboardError::io_with_path(e, parent))?;
    let temp_path = temp.path().to_path_buf();

    temp.write_all(serialized.as_bytes())
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| DashboardError::Io {
            message: format!("Failed to write temp file {}", temp_path.display()),
            path: Some(temp_path.clone()),
            source: Some(e),
        })?;

    temp.persist(path).map_err(|e| DashboardError::Io {
        message: format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        ),
        path: Some(path.to_path_buf()),
        source: Some(e.error),
    })?;

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

/// In-memory storage holding the serialized JSON text.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    raw: Mutex<Option<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the storage with raw JSON, as if an earlier session wrote it.
    pub fn from_json(raw: impl Into<String>) -> Self {
        Self {
            raw: Mutex::new(Some(raw.into())),
        }
    }

    /// The last saved JSON text.
    pub fn raw(&self) -> Option<String> {
        self.raw.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl StateStorage for MemoryStorage {
    fn load(&self) -> Result<Option<PersistedState>> {
        match self.raw() {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        let raw = serde_json::to_string(state)?;
        *self.raw.lock().unwrap_or_else(|e| e.into_inner()) = Some(raw);
        Ok(())
    }
}
