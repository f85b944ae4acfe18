//! Durable Store
//!
//! A generic key → JSON value store with atomic per-key writes, and the typed
//! accessors (`Records`) every other component goes through. Records of one
//! kind live together in a namespace map stored under a single key, the same
//! way the browser-side storage keeps them.

mod file;
mod memory;
pub mod watch;

pub(crate) use file::atomic_write;
pub use file::FileStore;
pub use memory::MemoryStore;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::model::{Segment, Thread, UserSettings};
use crate::orchestrator::progress::CheckpointProgress;
use crate::selectors::SelectorMap;

/// Namespaced storage keys
pub mod keys {
    pub const THREADS: &str = "weaver:threads";
    pub const SEGMENTS: &str = "weaver:segments";
    pub const ACTIVE_THREAD: &str = "weaver:active_thread";
    pub const SETTINGS: &str = "weaver:settings";
    pub const SELECTOR_CONFIG: &str = "weaver:selector_config";
    pub const CHECKPOINTS: &str = "weaver:checkpoints";
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error in {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid store key: {0}")]
    InvalidKey(String),
    #[error("Watch error: {0}")]
    Watch(String),
}

impl Serialize for StoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Key → value persistence. Each `set` is atomic for its key; there are no
/// multi-key transactions.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Keys may only contain alphanumerics, `-`, `_` and `:`.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    if key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':')
    {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// A record that is keyed by its own id inside a namespace
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Thread {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Segment {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for CheckpointProgress {
    fn key(&self) -> &str {
        &self.thread_id
    }
}

/// Typed CRUD over a `DurableStore`.
///
/// Read-modify-write of a namespace map is serialized within the process;
/// across processes the last writer of a key wins.
#[derive(Clone)]
pub struct Records {
    store: Arc<dyn DurableStore>,
    write_lock: Arc<Mutex<()>>,
}

impl Records {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// In-memory records, mostly for tests
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn raw(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    // ------- generic helpers -------

    fn load_namespace<T: DeserializeOwned>(&self, ns: &str) -> Result<BTreeMap<String, T>, StoreError> {
        match self.store.get(ns)? {
            Some(value) => serde_json::from_value(value).map_err(|source| StoreError::Json {
                key: ns.to_string(),
                source,
            }),
            None => Ok(BTreeMap::new()),
        }
    }

    fn save_namespace<T: Serialize>(&self, ns: &str, map: &BTreeMap<String, T>) -> Result<(), StoreError> {
        let value = serde_json::to_value(map).map_err(|source| StoreError::Json {
            key: ns.to_string(),
            source,
        })?;
        self.store.set(ns, value)
    }

    pub fn get<T: DeserializeOwned>(&self, ns: &str, id: &str) -> Result<Option<T>, StoreError> {
        let mut map = self.load_namespace::<T>(ns)?;
        Ok(map.remove(id))
    }

    pub fn all<T: DeserializeOwned>(&self, ns: &str) -> Result<Vec<T>, StoreError> {
        Ok(self.load_namespace::<T>(ns)?.into_values().collect())
    }

    pub fn put<T: Serialize + DeserializeOwned + Keyed>(&self, ns: &str, record: &T) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut map = self.load_namespace::<Value>(ns)?;
        let value = serde_json::to_value(record).map_err(|source| StoreError::Json {
            key: ns.to_string(),
            source,
        })?;
        map.insert(record.key().to_string(), value);
        self.save_namespace(ns, &map)
    }

    /// Apply `f` to the record with `id` and write it back. Returns the updated
    /// record, or `None` if it does not exist.
    pub fn update<T, F>(&self, ns: &str, id: &str, f: F) -> Result<Option<T>, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let _guard = self.write_lock.lock();
        let mut map = self.load_namespace::<T>(ns)?;
        let Some(record) = map.get_mut(id) else {
            return Ok(None);
        };
        f(record);
        let updated = serde_json::to_value(&*record).map_err(|source| StoreError::Json {
            key: ns.to_string(),
            source,
        })?;
        self.save_namespace(ns, &map)?;
        serde_json::from_value(updated)
            .map(Some)
            .map_err(|source| StoreError::Json {
                key: ns.to_string(),
                source,
            })
    }

    pub fn remove(&self, ns: &str, id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let mut map = self.load_namespace::<Value>(ns)?;
        if map.remove(id).is_none() {
            return Ok(false);
        }
        self.save_namespace(ns, &map)?;
        Ok(true)
    }

    /// Keep only the records for which `keep` returns true. Returns how many
    /// were removed.
    pub fn retain<T, F>(&self, ns: &str, mut keep: F) -> Result<usize, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&T) -> bool,
    {
        let _guard = self.write_lock.lock();
        let map = self.load_namespace::<T>(ns)?;
        let before = map.len();
        let kept: BTreeMap<String, T> = map.into_iter().filter(|(_, r)| keep(r)).collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.save_namespace(ns, &kept)?;
        }
        Ok(removed)
    }

    pub fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(key)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StoreError::Json {
                    key: key.to_string(),
                    source,
                }),
        }
    }

    pub fn set_value<T: Serialize>(&self, key: &str, value: Option<&T>) -> Result<(), StoreError> {
        match value {
            Some(v) => {
                let json = serde_json::to_value(v).map_err(|source| StoreError::Json {
                    key: key.to_string(),
                    source,
                })?;
                self.store.set(key, json)
            }
            None => self.store.remove(key),
        }
    }

    // ------- threads -------

    pub fn threads(&self) -> Result<Vec<Thread>, StoreError> {
        let mut threads: Vec<Thread> = self.all(keys::THREADS)?;
        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(threads)
    }

    pub fn thread(&self, id: &str) -> Result<Option<Thread>, StoreError> {
        self.get(keys::THREADS, id)
    }

    pub fn save_thread(&self, thread: &Thread) -> Result<(), StoreError> {
        self.put(keys::THREADS, thread)
    }

    // ------- segments -------

    pub fn segment(&self, id: &str) -> Result<Option<Segment>, StoreError> {
        self.get(keys::SEGMENTS, id)
    }

    pub fn segments(&self) -> Result<Vec<Segment>, StoreError> {
        self.all(keys::SEGMENTS)
    }

    /// Segments of a thread ordered by sequence
    pub fn segments_by_thread(&self, thread_id: &str) -> Result<Vec<Segment>, StoreError> {
        let mut segments: Vec<Segment> = self
            .segments()?
            .into_iter()
            .filter(|s| s.thread_id == thread_id)
            .collect();
        segments.sort_by_key(|s| s.sequence);
        Ok(segments)
    }

    pub fn segment_by_conversation(&self, conversation_url: &str) -> Result<Option<Segment>, StoreError> {
        Ok(self
            .segments()?
            .into_iter()
            .find(|s| s.conversation_url == conversation_url))
    }

    pub fn save_segment(&self, segment: &Segment) -> Result<(), StoreError> {
        self.put(keys::SEGMENTS, segment)
    }

    // ------- active thread -------

    pub fn active_thread_id(&self) -> Result<Option<String>, StoreError> {
        self.get_value(keys::ACTIVE_THREAD)
    }

    pub fn set_active_thread_id(&self, thread_id: Option<&str>) -> Result<(), StoreError> {
        self.set_value(keys::ACTIVE_THREAD, thread_id.as_ref())
    }

    // ------- settings -------

    pub fn settings(&self) -> Result<UserSettings, StoreError> {
        Ok(self.get_value(keys::SETTINGS)?.unwrap_or_default())
    }

    pub fn update_settings<F: FnOnce(&mut UserSettings)>(&self, f: F) -> Result<UserSettings, StoreError> {
        let _guard = self.write_lock.lock();
        let mut settings = self.settings()?;
        f(&mut settings);
        self.set_value(keys::SETTINGS, Some(&settings))?;
        Ok(settings)
    }

    // ------- selector config -------

    /// Stored overrides merged over the defaults
    pub fn selector_config(&self) -> Result<SelectorMap, StoreError> {
        let overrides: Option<BTreeMap<String, String>> = self.get_value(keys::SELECTOR_CONFIG)?;
        Ok(SelectorMap::with_overrides(overrides.unwrap_or_default()))
    }

    pub fn update_selector_config(&self, overrides: BTreeMap<String, String>) -> Result<SelectorMap, StoreError> {
        let _guard = self.write_lock.lock();
        let mut stored: BTreeMap<String, String> =
            self.get_value(keys::SELECTOR_CONFIG)?.unwrap_or_default();
        stored.extend(overrides);
        self.set_value(keys::SELECTOR_CONFIG, Some(&stored))?;
        Ok(SelectorMap::with_overrides(stored))
    }

    // ------- checkpoint progress -------

    pub fn progress(&self, thread_id: &str) -> Result<Option<CheckpointProgress>, StoreError> {
        self.get(keys::CHECKPOINTS, thread_id)
    }

    pub fn all_progress(&self) -> Result<Vec<CheckpointProgress>, StoreError> {
        self.all(keys::CHECKPOINTS)
    }

    pub fn save_progress(&self, progress: &CheckpointProgress) -> Result<(), StoreError> {
        self.put(keys::CHECKPOINTS, progress)
    }

    pub fn clear_progress(&self, thread_id: &str) -> Result<bool, StoreError> {
        self.remove(keys::CHECKPOINTS, thread_id)
    }
}
