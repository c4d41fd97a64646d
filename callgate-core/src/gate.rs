// Admission control with a priority-ordered waiting queue.
//
// Waiters are admitted strictly by priority, FIFO within a level. A periodic
// boost pass moves long-waiting items up one level at a time so low priority
// work cannot starve. Admission is handed out as an RAII `GatePermit`; dropping
// it frees the slot and dispatches the next waiter.

use crate::error::CallError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Idle,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Idle,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// The next level up; Critical stays Critical
    pub fn boosted(self) -> Priority {
        match self {
            Priority::Critical | Priority::High => Priority::Critical,
            Priority::Normal => Priority::High,
            Priority::Low => Priority::Normal,
            Priority::Idle => Priority::Low,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    /// Maximum time an item may wait in the queue; 0 disables the timeout
    pub queue_timeout_ms: u64,
    /// Waiting time after which an item moves up one priority level; 0 disables boosting
    pub boost_interval_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 6,
            max_queue_size: 100,
            queue_timeout_ms: 30_000,
            boost_interval_ms: 5_000,
        }
    }
}

impl GateConfig {
    fn queue_timeout(&self) -> Option<Duration> {
        (self.queue_timeout_ms > 0).then(|| Duration::from_millis(self.queue_timeout_ms))
    }

    fn boost_interval(&self) -> Option<Duration> {
        (self.boost_interval_ms > 0).then(|| Duration::from_millis(self.boost_interval_ms))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub active: usize,
    pub queued: usize,
    pub queued_by_priority: BTreeMap<Priority, usize>,
    pub max_active_observed: usize,
    pub dispatched: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub boosted: u64,
}

struct QueueItem {
    id: u64,
    priority: Priority,
    enqueued_at: Instant,
    /// When the item entered its current priority level
    level_since: Instant,
    tx: oneshot::Sender<Result<(), CallError>>,
    signal: Option<CancellationToken>,
}

#[derive(Default)]
struct GateState {
    buckets: [VecDeque<QueueItem>; 5],
    active: usize,
    next_id: u64,
    closed: bool,
    max_active_observed: usize,
    dispatched: u64,
    rejected: u64,
    timed_out: u64,
    cancelled: u64,
    boosted: u64,
}

impl GateState {
    fn queued(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    fn remove(&mut self, id: u64) -> Option<QueueItem> {
        for bucket in self.buckets.iter_mut() {
            if let Some(pos) = bucket.iter().position(|item| item.id == id) {
                return bucket.remove(pos);
            }
        }
        None
    }

    fn admit(&mut self) {
        self.active += 1;
        self.dispatched += 1;
        self.max_active_observed = self.max_active_observed.max(self.active);
    }

    fn dispatch(&mut self, max_concurrent: usize) {
        while self.active < max_concurrent {
            let Some(item) = self.buckets.iter_mut().find_map(VecDeque::pop_front) else {
                break;
            };
            if item.tx.send(Ok(())).is_ok() {
                self.admit();
                trace!(
                    "Admitted queued item {} ({:?}) after {:?}",
                    item.id,
                    item.priority,
                    item.enqueued_at.elapsed()
                );
            }
        }
    }

    fn drain(&mut self) -> Vec<QueueItem> {
        self.buckets.iter_mut().flat_map(|b| b.drain(..)).collect()
    }
}

struct GateShared {
    config: GateConfig,
    state: Mutex<GateState>,
}

impl GateShared {
    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self) {
        let mut state = self.state();
        state.active = state.active.saturating_sub(1);
        state.dispatch(self.config.max_concurrent);
    }

    fn boost(&self, now: Instant) -> usize {
        let Some(interval) = self.config.boost_interval() else {
            return 0;
        };
        let mut state = self.state();
        let mut promoted = 0;

        // Walk from High down to Idle so an item climbs at most one level per pass
        for level in 1..Priority::ALL.len() {
            let bucket = std::mem::take(&mut state.buckets[level]);
            let (starved, waiting): (VecDeque<_>, VecDeque<_>) = bucket
                .into_iter()
                .partition(|item| now.duration_since(item.level_since) >= interval);
            state.buckets[level] = waiting;

            for mut item in starved {
                item.priority = item.priority.boosted();
                item.level_since = now;
                state.buckets[level - 1].push_back(item);
                promoted += 1;
            }
        }

        state.boosted += promoted as u64;
        if promoted > 0 {
            debug!("Boosted {} starved queue items", promoted);
        }
        promoted
    }
}

/// Admission to run one unit of work. Dropping it frees the slot.
pub struct GatePermit {
    shared: Arc<GateShared>,
}

impl std::fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatePermit").finish_non_exhaustive()
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// A queued acquisition. If it is dropped before settling, its queue item is
/// withdrawn, or, when admission already happened, the slot is handed back.
struct Waiter {
    shared: Arc<GateShared>,
    id: u64,
    rx: oneshot::Receiver<Result<(), CallError>>,
    settled: bool,
}

impl Waiter {
    /// Remove the item from the queue; false when it was already dispatched
    fn withdraw(&mut self) -> bool {
        let removed = self.shared.state().remove(self.id).is_some();
        if removed {
            self.settled = true;
        }
        removed
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.shared.state();
        if state.remove(self.id).is_some() {
            state.cancelled += 1;
            trace!("Withdrew queue item {}", self.id);
        } else if let Ok(Ok(())) = self.rx.try_recv() {
            state.active = state.active.saturating_sub(1);
            state.dispatch(self.shared.config.max_concurrent);
        }
    }
}

enum Wake {
    Admitted(Result<Result<(), CallError>, oneshot::error::RecvError>),
    TimedOut,
    Cancelled,
}

pub struct ConcurrencyGate {
    shared: Arc<GateShared>,
    booster: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyGate")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl ConcurrencyGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            shared: Arc::new(GateShared {
                config,
                state: Mutex::new(GateState::default()),
            }),
            booster: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.shared.config
    }

    /// Start the periodic boost pass. No-op when boosting is disabled, no
    /// tokio runtime is available, or it is already running.
    pub fn start_background(&self) {
        let Some(interval) = self.shared.config.boost_interval() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, priority boosting disabled");
            return;
        };
        let mut booster = self.booster.lock().unwrap_or_else(|e| e.into_inner());
        if booster.is_some() {
            return;
        }

        let weak: Weak<GateShared> = Arc::downgrade(&self.shared);
        *booster = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                shared.boost(Instant::now());
            }
        }));
    }

    /// Run one boost pass now; returns the number of promoted items
    pub fn boost_starved(&self) -> usize {
        self.shared.boost(Instant::now())
    }

    /// Wait for admission at `priority`.
    ///
    /// Fails immediately with `QueueFull` when the queue is at capacity, with
    /// `QueueTimeout` once the item waited longer than the queue timeout, and
    /// with `Cancel` when `signal` fires or the item is cancelled.
    pub async fn acquire(
        &self,
        priority: Priority,
        signal: Option<&CancellationToken>,
    ) -> Result<GatePermit, CallError> {
        let (id, rx) = {
            let mut state = self.shared.state();
            if state.closed {
                return Err(CallError::cancelled("Concurrency gate is closed"));
            }
            if state.active < self.shared.config.max_concurrent && state.queued() == 0 {
                state.admit();
                return Ok(self.permit());
            }
            if state.queued() >= self.shared.config.max_queue_size {
                state.rejected += 1;
                return Err(CallError::queue_full(self.shared.config.max_queue_size));
            }

            let (tx, rx) = oneshot::channel();
            state.next_id += 1;
            let id = state.next_id;
            let now = Instant::now();
            state.buckets[priority.index()].push_back(QueueItem {
                id,
                priority,
                enqueued_at: now,
                level_since: now,
                tx,
                signal: signal.cloned(),
            });
            trace!("Queued item {} at {:?}", id, priority);
            (id, rx)
        };

        let started = Instant::now();
        let mut waiter = Waiter {
            shared: self.shared.clone(),
            id,
            rx,
            settled: false,
        };
        let timeout = self.shared.config.queue_timeout();

        let wake = tokio::select! {
            biased;
            res = &mut waiter.rx => Wake::Admitted(res),
            _ = async {
                match timeout {
                    Some(d) => tokio::time::sleep(d).await,
                    None => futures::future::pending::<()>().await,
                }
            } => Wake::TimedOut,
            _ = async {
                match signal {
                    Some(token) => token.cancelled().await,
                    None => futures::future::pending::<()>().await,
                }
            } => Wake::Cancelled,
        };

        match wake {
            Wake::Admitted(res) => {
                waiter.settled = true;
                match res {
                    Ok(Ok(())) => Ok(self.permit()),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(CallError::cancelled("Concurrency gate dropped")),
                }
            }
            Wake::TimedOut => {
                if waiter.withdraw() {
                    self.shared.state().timed_out += 1;
                    debug!("Queue item {} timed out", id);
                    Err(CallError::queue_timeout(started.elapsed().as_millis()))
                } else {
                    // Dispatched at the same instant the timeout fired
                    waiter.settled = true;
                    match waiter.rx.try_recv() {
                        Ok(Ok(())) => Ok(self.permit()),
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(CallError::cancelled("Concurrency gate dropped")),
                    }
                }
            }
            Wake::Cancelled => Err(CallError::cancelled("Request cancelled while queued")),
        }
    }

    /// Acquire a slot, run `fut`, and free the slot whatever the outcome
    pub async fn run<T, Fut>(
        &self,
        priority: Priority,
        signal: Option<&CancellationToken>,
        fut: Fut,
    ) -> Result<T, CallError>
    where
        Fut: Future<Output = Result<T, CallError>>,
    {
        let _permit = self.acquire(priority, signal).await?;
        fut.await
    }

    fn permit(&self) -> GatePermit {
        GatePermit {
            shared: self.shared.clone(),
        }
    }

    /// Reject one queued item
    pub fn cancel(&self, id: u64) -> bool {
        let mut state = self.shared.state();
        match state.remove(id) {
            Some(item) => {
                state.cancelled += 1;
                let _ = item.tx.send(Err(CallError::cancelled("Request cancelled")));
                true
            }
            None => false,
        }
    }

    /// Reject every queued item and cancel their external signals
    pub fn cancel_all(&self, reason: &str) -> usize {
        let items = {
            let mut state = self.shared.state();
            let items = state.drain();
            state.cancelled += items.len() as u64;
            items
        };

        let count = items.len();
        for item in items {
            if let Some(signal) = &item.signal {
                signal.cancel();
            }
            let _ = item.tx.send(Err(CallError::cancelled(reason.to_string())));
        }
        if count > 0 {
            debug!("Cancelled {} queued items: {}", count, reason);
        }
        count
    }

    /// Reject all queued items, refuse new work and stop the boost task
    pub fn close(&self) {
        self.shared.state().closed = true;
        self.cancel_all("Concurrency gate closed");
        if let Some(task) = self
            .booster
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }

    pub fn active(&self) -> usize {
        self.shared.state().active
    }

    pub fn queued(&self) -> usize {
        self.shared.state().queued()
    }

    /// Ids of queued items in dispatch order
    pub fn queued_ids(&self) -> Vec<u64> {
        self.shared
            .state()
            .buckets
            .iter()
            .flat_map(|b| b.iter().map(|item| item.id))
            .collect()
    }

    pub fn stats(&self) -> GateStats {
        let state = self.shared.state();
        GateStats {
            active: state.active,
            queued: state.queued(),
            queued_by_priority: Priority::ALL
                .iter()
                .map(|p| (*p, state.buckets[p.index()].len()))
                .collect(),
            max_active_observed: state.max_active_observed,
            dispatched: state.dispatched,
            rejected: state.rejected,
            timed_out: state.timed_out,
            cancelled: state.cancelled,
            boosted: state.boosted,
        }
    }
}

impl Drop for ConcurrencyGate {
    fn drop(&mut self) {
        if let Some(task) = self
            .booster
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gate(max_concurrent: usize, max_queue_size: usize) -> Arc<ConcurrencyGate> {
        Arc::new(ConcurrencyGate::new(GateConfig {
            max_concurrent,
            max_queue_size,
            queue_timeout_ms: 0,
            boost_interval_ms: 100,
        }))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_concurrency_bound_under_burst() {
        let c = 3;
        let gate = gate(c, 1000);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..(10 * c) {
            let gate = gate.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                gate.run(Priority::Normal, None, async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, CallError>(())
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= c);
        let stats = gate.stats();
        assert!(stats.max_active_observed <= c);
        assert_eq!(stats.dispatched, 30);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_priority_then_fifo_dispatch() {
        let gate = gate(1, 100);
        let holder = gate.acquire(Priority::Normal, None).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (label, priority) in [
            ("low-1", Priority::Low),
            ("critical-1", Priority::Critical),
            ("idle-1", Priority::Idle),
            ("low-2", Priority::Low),
            ("critical-2", Priority::Critical),
            ("high-1", Priority::High),
        ] {
            let gate = gate.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire(priority, None).await.unwrap();
                order.lock().unwrap().push(label);
            }));
            settle().await;
        }
        assert_eq!(gate.queued(), 6);

        drop(holder);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            *order.lock().unwrap(),
            vec!["critical-1", "critical-2", "high-1", "low-1", "low-2", "idle-1"]
        );
    }

    #[tokio::test]
    async fn test_queue_full_rejects_immediately() {
        let gate = gate(1, 1);
        let _holder = gate.acquire(Priority::Normal, None).await.unwrap();

        let g = gate.clone();
        let queued = tokio::spawn(async move { g.acquire(Priority::Normal, None).await.map(|_| ()) });
        settle().await;
        assert_eq!(gate.queued(), 1);

        let err = gate.acquire(Priority::Critical, None).await.unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::QueueFull);
        assert_eq!(gate.stats().rejected, 1);

        queued.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout() {
        let gate = Arc::new(ConcurrencyGate::new(GateConfig {
            max_concurrent: 1,
            max_queue_size: 10,
            queue_timeout_ms: 50,
            boost_interval_ms: 0,
        }));
        let _holder = gate.acquire(Priority::Normal, None).await.unwrap();

        let err = gate.acquire(Priority::High, None).await.unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::QueueTimeout);
        assert_eq!(gate.queued(), 0);
        assert_eq!(gate.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_signal_cancels_queued_item() {
        let gate = gate(1, 10);
        let _holder = gate.acquire(Priority::Normal, None).await.unwrap();
        let token = CancellationToken::new();

        let g = gate.clone();
        let t = token.clone();
        let waiting = tokio::spawn(async move { g.acquire(Priority::Low, Some(&t)).await.map(|_| ()) });
        settle().await;
        assert_eq!(gate.queued(), 1);

        token.cancel();
        let err = waiting.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(gate.queued(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_aborts_signals() {
        let gate = gate(1, 10);
        let _holder = gate.acquire(Priority::Normal, None).await.unwrap();
        let token = CancellationToken::new();

        let g = gate.clone();
        let t = token.clone();
        let waiting = tokio::spawn(async move { g.acquire(Priority::Low, Some(&t)).await.map(|_| ()) });
        settle().await;

        assert_eq!(gate.cancel_all("shutting down"), 1);
        let err = waiting.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_by_id() {
        let gate = gate(1, 10);
        let _holder = gate.acquire(Priority::Normal, None).await.unwrap();

        let g = gate.clone();
        let waiting = tokio::spawn(async move { g.acquire(Priority::Low, None).await.map(|_| ()) });
        settle().await;

        let id = gate.queued_ids()[0];
        assert!(gate.cancel(id));
        assert!(!gate.cancel(id));
        assert!(waiting.await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_withdraws() {
        let gate = gate(1, 10);
        let holder = gate.acquire(Priority::Normal, None).await.unwrap();

        let res = tokio::time::timeout(
            Duration::from_millis(10),
            gate.acquire(Priority::Normal, None),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(gate.queued(), 0);

        drop(holder);
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test]
    async fn test_executor_failure_frees_slot() {
        let gate = gate(1, 10);
        let result: Result<(), _> = gate
            .run(Priority::Normal, None, async { Err(CallError::network("boom")) })
            .await;
        assert!(result.is_err());
        assert_eq!(gate.active(), 0);
        assert!(gate.acquire(Priority::Normal, None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_boost_one_level_per_interval() {
        let gate = gate(1, 10);
        let _holder = gate.acquire(Priority::Normal, None).await.unwrap();

        let g = gate.clone();
        let _waiting = tokio::spawn(async move { g.acquire(Priority::Idle, None).await.map(|_| ()) });
        settle().await;

        assert_eq!(gate.boost_starved(), 0);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(gate.boost_starved(), 1);
        assert_eq!(gate.stats().queued_by_priority[&Priority::Low], 1);

        // Promotion resets the clock, so an immediate second pass does nothing
        assert_eq!(gate.boost_starved(), 0);

        tokio::time::advance(Duration::from_millis(100)).await;
        gate.boost_starved();
        assert_eq!(gate.stats().queued_by_priority[&Priority::Normal], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_boost_prevents_starvation() {
        let gate = gate(1, 100);
        gate.start_background();
        let holder = gate.acquire(Priority::Normal, None).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let g = gate.clone();
        let o = order.clone();
        let starved = tokio::spawn(async move {
            let _permit = g.acquire(Priority::Low, None).await.unwrap();
            o.lock().unwrap().push("low");
        });
        settle().await;

        // Three boost intervals take the Low item all the way to Critical
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(gate.stats().queued_by_priority[&Priority::Critical], 1);

        let g = gate.clone();
        let o = order.clone();
        let late = tokio::spawn(async move {
            let _permit = g.acquire(Priority::Critical, None).await.unwrap();
            o.lock().unwrap().push("critical");
        });
        settle().await;

        drop(holder);
        starved.await.unwrap();
        late.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["low", "critical"]);
        gate.close();
    }

    #[tokio::test]
    async fn test_closed_gate_rejects() {
        let gate = gate(2, 10);
        gate.close();
        assert!(gate.acquire(Priority::Normal, None).await.unwrap_err().is_cancelled());
    }
}
