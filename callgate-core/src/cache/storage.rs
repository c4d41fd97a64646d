use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("Storage lock poisoned")]
    Poisoned,
}

/// A cached value with its write time and lifetime, both in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Value,
    pub timestamp: u64,
    pub ttl: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp) > self.ttl
    }
}

/// Backing store for [`crate::cache::CacheStore`].
///
/// Implementations only hold entries; expiry and LRU bookkeeping live in the
/// store so every strategy observes the same TTL contract.
pub trait CacheStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError>;
    fn set(&self, key: &str, entry: CacheEntry) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<bool, StorageError>;
    fn clear(&self) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;
    fn len(&self) -> Result<usize, StorageError>;

    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, entry: CacheEntry) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.remove(key).is_some())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.entries.clear();
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.iter().map(|entry| entry.key().clone()).collect())
    }

    fn len(&self) -> Result<usize, StorageError> {
        Ok(self.entries.len())
    }
}

/// Persistent storage keeping the whole cache in one JSON document.
/// Every mutation rewrites the file.
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl JsonFileStorage {
    /// Open (or create) the storage file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            HashMap::new()
        };

        debug!("Opened cache file {:?} with {} entries", path, entries.len());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, CacheEntry>) -> R,
    ) -> Result<R, StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        let result = f(&mut entries);
        let raw = serde_json::to_string(&*entries)?;
        std::fs::write(&self.path, raw)?;
        Ok(result)
    }

    fn read<R>(&self, f: impl FnOnce(&HashMap<String, CacheEntry>) -> R) -> Result<R, StorageError> {
        let entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(f(&entries))
    }
}

impl CacheStorage for JsonFileStorage {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        self.read(|entries| entries.get(key).cloned())
    }

    fn set(&self, key: &str, entry: CacheEntry) -> Result<(), StorageError> {
        self.mutate(|entries| {
            entries.insert(key.to_string(), entry);
        })
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.mutate(|entries| entries.remove(key).is_some())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.mutate(|entries| entries.clear())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.read(|entries| entries.keys().cloned().collect())
    }

    fn len(&self) -> Result<usize, StorageError> {
        self.read(|entries| entries.len())
    }
}
