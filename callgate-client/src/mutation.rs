// Write calls with optimistic updates that can be rolled back.

use crate::engine::Engine;
use crate::options::CallOptions;
use callgate_core::CallError;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

type Undo = Box<dyn FnOnce() + Send>;

/// Undo steps recorded while applying optimistic changes. On failure they
/// run newest first.
#[derive(Default)]
pub struct RollbackStack {
    steps: Vec<Undo>,
}

impl std::fmt::Debug for RollbackStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackStack")
            .field("steps", &self.steps.len())
            .finish()
    }
}

impl RollbackStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, undo: impl FnOnce() + Send + 'static) {
        self.steps.push(Box::new(undo));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every undo step in reverse order; returns how many ran
    pub fn rollback(self) -> usize {
        let count = self.steps.len();
        for undo in self.steps.into_iter().rev() {
            undo();
        }
        count
    }

    /// Keep the optimistic changes and forget the undo steps
    pub fn commit(self) {}
}

struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A reusable handle for one write method
#[derive(Debug, Clone)]
pub struct Mutation {
    engine: Engine,
    method: String,
    options: CallOptions,
    lock_while_pending: bool,
    pending: Arc<AtomicUsize>,
}

impl Mutation {
    pub fn new(engine: Engine, method: impl Into<String>) -> Self {
        Self {
            engine,
            method: method.into(),
            options: CallOptions::default(),
            lock_while_pending: false,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reject new mutations with `MutationPending` while one is in flight
    pub fn lock_while_pending(mut self) -> Self {
        self.lock_while_pending = true;
        self
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    pub async fn mutate(&self, params: Value) -> Result<Value, CallError> {
        self.mutate_with(params, RollbackStack::new()).await
    }

    /// Run the write. On failure `rollback` is unwound before the error is
    /// returned; on success it is discarded.
    pub async fn mutate_with(
        &self,
        params: Value,
        rollback: RollbackStack,
    ) -> Result<Value, CallError> {
        let _pending = self.enter()?;

        match self
            .engine
            .call_value(&self.method, params, self.options.clone())
            .await
        {
            Ok(value) => {
                rollback.commit();
                Ok(value)
            }
            Err(err) => {
                let undone = rollback.rollback();
                if undone > 0 {
                    debug!("Rolled back {} optimistic updates for {}", undone, self.method);
                }
                Err(err)
            }
        }
    }

    fn enter(&self) -> Result<PendingGuard, CallError> {
        if self.lock_while_pending {
            self.pending
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .map_err(|_| CallError::mutation_pending())?;
        } else {
            self.pending.fetch_add(1, Ordering::SeqCst);
        }
        Ok(PendingGuard(self.pending.clone()))
    }
}
