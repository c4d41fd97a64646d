// Trailing-edge debounce keyed by caller-chosen string (the engine uses the
// method name).
//
// Every caller waits out the delay. Only the most recent caller for a key
// executes; the callers it superseded receive a clone of its result.

use crate::error::CallError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

type Waiter<T> = (u64, oneshot::Sender<Result<T, CallError>>);

struct Slot<T> {
    generation: u64,
    waiters: Vec<Waiter<T>>,
}

type Slots<T> = Arc<Mutex<HashMap<String, Slot<T>>>>;

/// Drops the slot if the latest caller goes away before it executes, which
/// rejects everyone it superseded.
struct SlotGuard<T> {
    slots: Slots<T>,
    key: String,
    generation: u64,
    armed: bool,
}

impl<T> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.get(&self.key).map(|s| s.generation) == Some(self.generation) {
            slots.remove(&self.key);
        }
    }
}

pub struct Debouncer<T> {
    slots: Slots<T>,
}

impl<T> Default for Debouncer<T> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> std::fmt::Debug for Debouncer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("pending_keys", &self.lock().len())
            .finish()
    }
}

impl<T> Debouncer<T> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot<T>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Clone + Send + 'static> Debouncer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait `delay`, then run `operation` if no newer call for `key` arrived
    /// in the meantime. Superseded callers resolve with the winner's result.
    pub async fn debounce<F, Fut>(
        &self,
        key: &str,
        delay: Duration,
        operation: F,
    ) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut slots = self.lock();
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                generation: 0,
                waiters: Vec::new(),
            });
            slot.generation += 1;
            slot.waiters.push((slot.generation, tx));
            slot.generation
        };

        let mut guard = SlotGuard {
            slots: self.slots.clone(),
            key: key.to_string(),
            generation,
            armed: true,
        };

        tokio::time::sleep(delay).await;

        let waiters = {
            let mut slots = self.lock();
            match slots.get(key) {
                Some(slot) if slot.generation == generation => {
                    slots.remove(key).map(|slot| slot.waiters).unwrap_or_default()
                }
                _ => Vec::new(),
            }
        };
        guard.armed = false;

        if waiters.is_empty() {
            trace!("Debounced call for {} superseded", key);
            return rx
                .await
                .unwrap_or_else(|_| Err(CallError::cancelled("Debounced call was cancelled")));
        }

        trace!("Debounce window closed for {}, {} callers", key, waiters.len());
        let result = operation().await;
        for (waiter_generation, sender) in waiters {
            if waiter_generation != generation {
                let _ = sender.send(result.clone());
            }
        }
        result
    }

    /// Whether a debounce window is currently open for `key`
    pub fn is_pending(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of callers waiting in the open window for `key`
    pub fn pending(&self, key: &str) -> usize {
        self.lock().get(key).map(|s| s.waiters.len()).unwrap_or(0)
    }

    /// Drop every open window; waiting callers are rejected as cancelled
    pub fn clear(&self) {
        self.lock().clear();
    }
}
