// Bounded response cache with per-entry TTL and LRU eviction.
//
// The store is best-effort: storage failures are logged and reported as a
// miss, never surfaced to the caller.

pub mod clock;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use storage::{CacheEntry, CacheStorage, JsonFileStorage, MemoryStorage, StorageError};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction kicks in
    pub max_size: usize,
    /// TTL used when a cache policy does not name one
    pub default_ttl_ms: u64,
    /// Interval of the background expiry sweep; 0 disables it
    pub sweep_interval_ms: u64,
    /// Maximum expired entries removed per sweep cycle
    pub sweep_batch_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            default_ttl_ms: 5 * 60 * 1000,
            sweep_interval_ms: 60 * 1000,
            sweep_batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub errors: u64,
    pub size: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct CacheStore {
    config: CacheConfig,
    storage: Arc<dyn CacheStorage>,
    clock: Arc<dyn Clock>,
    /// Access order, least recently used first
    order: Mutex<IndexSet<String>>,
    counters: Counters,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("config", &self.config)
            .field("size", &self.len())
            .finish()
    }
}

impl CacheStore {
    /// Create an in-memory store using the system clock
    pub fn new(config: CacheConfig) -> Self {
        Self::with_storage(config, Arc::new(MemoryStorage::new()), Arc::new(SystemClock))
    }

    /// Create a store over an explicit storage strategy and clock.
    /// Entries already present in the storage are adopted into the LRU index.
    pub fn with_storage(
        config: CacheConfig,
        storage: Arc<dyn CacheStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let existing = storage.keys().unwrap_or_else(|e| {
            warn!("Failed to list existing cache keys: {}", e);
            Vec::new()
        });

        Self {
            config,
            storage,
            clock,
            order: Mutex::new(existing.into_iter().collect()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn order(&self) -> MutexGuard<'_, IndexSet<String>> {
        self.order.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn storage_failed(&self, op: &str, key: &str, err: StorageError) {
        Counters::bump(&self.counters.errors);
        warn!("Cache {} failed for key {}: {}", op, key, err);
    }

    /// Look up a live entry. Expired entries are removed and count as a miss.
    pub fn get(&self, key: &str) -> Option<Value> {
        let entry = match self.storage.get(key) {
            Ok(entry) => entry,
            Err(e) => {
                self.storage_failed("read", key, e);
                Counters::bump(&self.counters.misses);
                return None;
            }
        };

        match entry {
            None => {
                self.order().shift_remove(key);
                Counters::bump(&self.counters.misses);
                trace!("Cache miss: {}", key);
                None
            }
            Some(entry) if entry.is_expired(self.clock.now_ms()) => {
                self.remove_entry(key);
                Counters::bump(&self.counters.expirations);
                Counters::bump(&self.counters.misses);
                trace!("Cache entry expired: {}", key);
                None
            }
            Some(entry) => {
                let mut order = self.order();
                // An eviction may have run since the storage read
                if order.shift_remove(key) {
                    order.insert(key.to_string());
                }
                drop(order);
                Counters::bump(&self.counters.hits);
                trace!("Cache hit: {}", key);
                Some(entry.data)
            }
        }
    }

    /// Insert or overwrite an entry, evicting the least recently used key
    /// first when the store is full.
    pub fn set(&self, key: &str, value: Value, ttl: Duration) {
        if self.config.max_size == 0 {
            return;
        }

        let entry = CacheEntry {
            data: value,
            timestamp: self.clock.now_ms(),
            ttl: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        };

        let mut order = self.order();
        if !order.contains(key) {
            while order.len() >= self.config.max_size {
                let Some(oldest) = order.shift_remove_index(0) else {
                    break;
                };
                if let Err(e) = self.storage.delete(&oldest) {
                    self.storage_failed("evict", &oldest, e);
                }
                Counters::bump(&self.counters.evictions);
                debug!("Evicted least recently used cache entry {}", oldest);
            }
        }

        order.shift_remove(key);
        match self.storage.set(key, entry) {
            Ok(()) => {
                order.insert(key.to_string());
                Counters::bump(&self.counters.sets);
            }
            Err(e) => self.storage_failed("write", key, e),
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.remove_entry(key)
    }

    fn remove_entry(&self, key: &str) -> bool {
        self.order().shift_remove(key);
        match self.storage.delete(key) {
            Ok(removed) => removed,
            Err(e) => {
                self.storage_failed("delete", key, e);
                false
            }
        }
    }

    /// Remove every entry whose key starts with `prefix`
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let keys: Vec<String> = self
            .order()
            .iter()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();

        keys.iter().filter(|k| self.remove_entry(k)).count()
    }

    pub fn clear(&self) {
        self.order().clear();
        if let Err(e) = self.storage.clear() {
            self.storage_failed("clear", "*", e);
        }
    }

    pub fn len(&self) -> usize {
        self.order().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.order().contains(key)
    }

    /// Remove up to `sweep_batch_size` expired entries; returns the number removed
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let keys: Vec<String> = self.order().iter().cloned().collect();
        let mut removed = 0;

        for key in keys {
            if removed >= self.config.sweep_batch_size {
                break;
            }
            match self.storage.get(&key) {
                Ok(Some(entry)) if entry.is_expired(now) => {
                    self.remove_entry(&key);
                    Counters::bump(&self.counters.expirations);
                    removed += 1;
                }
                Ok(None) => {
                    self.order().shift_remove(&key);
                }
                Ok(Some(_)) => {}
                Err(e) => self.storage_failed("sweep", &key, e),
            }
        }

        if removed > 0 {
            debug!("Cache sweep removed {} expired entries", removed);
        }
        removed
    }

    /// Start the periodic expiry sweep. The task stops on its own once the
    /// store is dropped. Returns `None` when sweeping is disabled or no tokio
    /// runtime is available.
    pub fn spawn_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.config.sweep_interval_ms == 0 {
            return None;
        }
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let weak: Weak<CacheStore> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.sweep_interval_ms);

        Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                store.sweep_expired();
            }
        }))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            size: self.len(),
        }
    }
}
