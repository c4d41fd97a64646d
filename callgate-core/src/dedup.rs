// At-most-one in-flight execution per key.
//
// The first caller for a key spawns the work as a tokio task and owns it;
// later callers join the shared result. The task deregisters itself through a
// drop guard, so the entry disappears on success, failure, panic or abort.

use crate::error::CallError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, CallError>>>;

struct PendingTask<T: Clone> {
    id: u64,
    created_at: Instant,
    ref_count: usize,
    result: SharedResult<T>,
    abort: AbortHandle,
}

/// Removes the task's map entry when the spawned task ends in any way
struct SettleGuard<T: Clone> {
    tasks: Arc<DashMap<String, PendingTask<T>>>,
    key: String,
    id: u64,
}

impl<T: Clone> Drop for SettleGuard<T> {
    fn drop(&mut self) {
        self.tasks.remove_if(&self.key, |_, task| task.id == self.id);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub in_flight: usize,
    pub executions: u64,
    pub joins: u64,
    pub cancelled: u64,
}

pub struct DeduplicationCoordinator<T: Clone> {
    tasks: Arc<DashMap<String, PendingTask<T>>>,
    next_id: AtomicU64,
    executions: AtomicU64,
    joins: AtomicU64,
    cancelled: AtomicU64,
}

impl<T: Clone> std::fmt::Debug for DeduplicationCoordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeduplicationCoordinator")
            .field("in_flight", &self.tasks.len())
            .finish()
    }
}

impl<T: Clone> Default for DeduplicationCoordinator<T> {
    fn default() -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            executions: AtomicU64::new(0),
            joins: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }
}

impl<T> DeduplicationCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `factory` for `key` unless an execution is already in flight, in
    /// which case the caller joins it.
    ///
    /// When the caller that started the execution cancels `signal`, the work
    /// is aborted and every joined caller is rejected. A joined caller that
    /// cancels only stops waiting. `factory` must not call back into the
    /// coordinator synchronously.
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        signal: Option<&CancellationToken>,
        factory: F,
    ) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        let (result, id, owner) = match self.tasks.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let task = entry.get_mut();
                task.ref_count += 1;
                self.joins.fetch_add(1, Ordering::Relaxed);
                debug!("Joining in-flight request {} ({} waiters)", key, task.ref_count);
                (task.result.clone(), task.id, false)
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                let fut = factory();
                let guard = SettleGuard {
                    tasks: self.tasks.clone(),
                    key: key.to_string(),
                    id,
                };

                let handle = tokio::spawn(async move {
                    let result = fut.await;
                    drop(guard);
                    let _ = tx.send(result);
                });

                let result: SharedResult<T> = async move {
                    rx.await.unwrap_or_else(|_| {
                        Err(CallError::cancelled("Deduplicated request was cancelled"))
                    })
                }
                .boxed()
                .shared();

                entry.insert(PendingTask {
                    id,
                    created_at: Instant::now(),
                    ref_count: 1,
                    result: result.clone(),
                    abort: handle.abort_handle(),
                });
                self.executions.fetch_add(1, Ordering::Relaxed);
                trace!("Started deduplicated execution {} for {}", id, key);
                (result, id, true)
            }
        };

        let Some(token) = signal else {
            return result.await;
        };

        tokio::select! {
            biased;
            outcome = result => outcome,
            _ = token.cancelled() => {
                if owner {
                    self.cancel_task(key, id);
                } else if let Some(mut task) = self.tasks.get_mut(key) {
                    if task.id == id {
                        task.ref_count = task.ref_count.saturating_sub(1);
                    }
                }
                Err(CallError::cancelled("Request cancelled"))
            }
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.tasks.contains_key(key)
    }

    /// Number of callers currently waiting on `key`
    pub fn waiters(&self, key: &str) -> usize {
        self.tasks.get(key).map(|t| t.ref_count).unwrap_or(0)
    }

    fn cancel_task(&self, key: &str, id: u64) -> bool {
        match self.tasks.remove_if(key, |_, task| task.id == id) {
            Some((_, task)) => {
                task.abort.abort();
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!("Cancelled in-flight request {} ({} waiters)", key, task.ref_count);
                true
            }
            None => false,
        }
    }

    /// Abort the execution for `key`; all joined callers are rejected
    pub fn cancel(&self, key: &str) -> bool {
        match self.tasks.remove(key) {
            Some((_, task)) => {
                task.abort.abort();
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!("Cancelled in-flight request {} ({} waiters)", key, task.ref_count);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let keys: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        keys.iter().filter(|key| self.cancel(key)).count()
    }

    /// Cancel executions older than `max_age` that never settled
    pub fn cleanup_timeout_tasks(&self, max_age: Duration) -> usize {
        let stale: Vec<(String, u64)> = self
            .tasks
            .iter()
            .filter(|e| e.created_at.elapsed() > max_age)
            .map(|e| (e.key().clone(), e.id))
            .collect();

        let removed = stale
            .iter()
            .filter(|(key, id)| self.cancel_task(key, *id))
            .count();
        if removed > 0 {
            warn!("Removed {} stale in-flight requests", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            in_flight: self.tasks.len(),
            executions: self.executions.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn coordinator() -> Arc<DeduplicationCoordinator<u32>> {
        Arc::new(DeduplicationCoordinator::new())
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let dedup = coordinator();
        let runs = Arc::new(AtomicUsize::new(0));

        let futures = (0..8).map(|_| {
            let dedup = dedup.clone();
            let runs = runs.clone();
            async move {
                dedup
                    .execute("GET /items", None, || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(42)
                    })
                    .await
            }
        });

        let results = futures::future::join_all(futures).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_ref().ok() == Some(&42)));

        let stats = dedup.stats();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.joins, 7);
        assert!(!dedup.is_running("GET /items"));
    }

    #[tokio::test]
    async fn test_entry_removed_after_failure() {
        let dedup = coordinator();
        let err = dedup
            .execute("k", None, || async { Err(CallError::network("down")) })
            .await
            .unwrap_err();
        assert_eq!(err.message, "down");
        assert!(dedup.is_empty());

        // A later call runs again instead of reusing the failure
        let value = dedup.execute("k", None, || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_entry_removed_after_panic() {
        let dedup = coordinator();
        let err = dedup
            .execute("k", None, || async {
                if true {
                    panic!("executor blew up");
                }
                Ok(1)
            })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(dedup.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_rejects_all_waiters() {
        let dedup = coordinator();

        let spawn_waiter = |dedup: Arc<DeduplicationCoordinator<u32>>| {
            tokio::spawn(async move {
                dedup
                    .execute("slow", None, || async {
                        futures::future::pending::<()>().await;
                        Ok(1)
                    })
                    .await
            })
        };
        let a = spawn_waiter(dedup.clone());
        let b = spawn_waiter(dedup.clone());
        settle().await;
        assert_eq!(dedup.waiters("slow"), 2);

        assert!(dedup.cancel("slow"));
        assert!(a.await.unwrap().unwrap_err().is_cancelled());
        assert!(b.await.unwrap().unwrap_err().is_cancelled());
        assert!(!dedup.is_running("slow"));
    }

    #[tokio::test]
    async fn test_owner_signal_cancels_everyone() {
        let dedup = coordinator();
        let owner_token = CancellationToken::new();

        let d = dedup.clone();
        let t = owner_token.clone();
        let owner = tokio::spawn(async move {
            d.execute("k", Some(&t), || async {
                futures::future::pending::<()>().await;
                Ok(1)
            })
            .await
        });
        settle().await;

        let d = dedup.clone();
        let joined = tokio::spawn(async move { d.execute("k", None, || async { Ok(2) }).await });
        settle().await;

        owner_token.cancel();
        assert!(owner.await.unwrap().unwrap_err().is_cancelled());
        assert!(joined.await.unwrap().unwrap_err().is_cancelled());
        assert!(dedup.is_empty());
    }

    #[tokio::test]
    async fn test_joined_signal_only_detaches() {
        let dedup = coordinator();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let d = dedup.clone();
        let owner = tokio::spawn(async move {
            d.execute("k", None, || async move {
                let _ = release_rx.await;
                Ok(5)
            })
            .await
        });
        settle().await;

        let joined_token = CancellationToken::new();
        let d = dedup.clone();
        let t = joined_token.clone();
        let joined = tokio::spawn(async move { d.execute("k", Some(&t), || async { Ok(9) }).await });
        settle().await;
        assert_eq!(dedup.waiters("k"), 2);

        joined_token.cancel();
        assert!(joined.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(dedup.waiters("k"), 1);
        assert!(dedup.is_running("k"));

        let _ = release_tx.send(());
        assert_eq!(owner.await.unwrap().unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_timeout_tasks() {
        let dedup = coordinator();
        let d = dedup.clone();
        let stuck = tokio::spawn(async move {
            d.execute("stuck", None, || async {
                futures::future::pending::<()>().await;
                Ok(1)
            })
            .await
        });
        settle().await;

        assert_eq!(dedup.cleanup_timeout_tasks(Duration::from_secs(30)), 0);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(dedup.cleanup_timeout_tasks(Duration::from_secs(30)), 1);
        assert!(stuck.await.unwrap().unwrap_err().is_cancelled());
    }
}
