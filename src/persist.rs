//! Whole-state persistence for the stores.
//!
//! Each store keeps its state in a [`PersistedState`]: a `watch` channel
//! holding the current value, written through to a [`StateStorage`] as one
//! JSON document after every mutation and read back when the store is built.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Key-value storage for JSON snapshots.
///
/// Calls are synchronous and happen on every store mutation, including from
/// feed listener tasks on the async runtime. Implementations must stay cheap:
/// a small local file write at most, never a network round trip.
pub trait StateStorage: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Value>, PersistError>;

    fn save(&self, key: &str, value: &Value) -> Result<(), PersistError>;

    fn remove(&self, key: &str) -> Result<(), PersistError>;
}

/// One `<key>.json` file per store under a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    dir: PathBuf,
}

impl JsonFileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl StateStorage for JsonFileStorage {
    fn load(&self, key: &str) -> Result<Option<Value>, PersistError> {
        match blocking(|| std::fs::read(self.path(key))) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, value: &Value) -> Result<(), PersistError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let path = self.path(key);
        blocking(|| {
            std::fs::create_dir_all(&self.dir)?;
            // Replaced atomically via rename.
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, &bytes)?;
            std::fs::rename(&tmp, &path)
        })?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistError> {
        match blocking(|| std::fs::remove_file(self.path(key))) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Runs file IO in place, letting a multi-threaded runtime move its other
/// tasks off this worker first.
fn blocking<R>(io: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(io)
        }
        _ => io(),
    }
}

/// Process-local storage; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStorage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<Value>, PersistError> {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, value: &Value) -> Result<(), PersistError> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistError> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.remove(key);
        Ok(())
    }
}

/// Observable store state, persisted after every mutation.
///
/// Persistence failures are logged and otherwise ignored; the in-memory
/// state stays authoritative.
pub struct PersistedState<T> {
    state: watch::Sender<T>,
    storage: Arc<dyn StateStorage>,
    key: String,
}

impl<T> PersistedState<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static,
{
    /// Rehydrates from `storage`, falling back to `T::default()` when the
    /// snapshot is missing or unreadable.
    pub fn restore(storage: Arc<dyn StateStorage>, key: impl Into<String>) -> Self {
        let key = key.into();
        let initial = match storage.load(&key) {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!(key = %key, error = %e, "discarding unreadable state snapshot");
                T::default()
            }),
            Ok(None) => T::default(),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to load state snapshot");
                T::default()
            }
        };

        let (state, _) = watch::channel(initial);
        Self { state, storage, key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.state.borrow())
    }

    pub fn snapshot(&self) -> T {
        self.state.borrow().clone()
    }

    /// Applies `mutate`, notifies subscribers and persists the result.
    pub fn commit(&self, mutate: impl FnOnce(&mut T)) {
        self.state.send_modify(mutate);
        self.persist();
    }

    pub fn replace(&self, value: T) {
        self.state.send_replace(value);
        self.persist();
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.state.subscribe()
    }

    fn persist(&self) {
        let value = match serde_json::to_value(&*self.state.borrow()) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "failed to serialize state");
                return;
            }
        };

        if let Err(e) = self.storage.save(&self.key, &value) {
            tracing::warn!(key = %self.key, error = %e, "failed to persist state");
        }
    }
}
