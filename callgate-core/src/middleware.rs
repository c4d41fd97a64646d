// Request, response and error interceptor chains.
//
// Handlers run strictly in registration order. Each chain snapshots its
// handler list before running so registration during a call cannot reorder
// an in-progress pass.

use crate::error::CallError;
use crate::request::{RequestSpec, Response};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

pub type Fulfilled<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<T, CallError>> + Send + Sync>;
pub type Rejected<T> =
    Arc<dyn Fn(CallError) -> BoxFuture<'static, Result<T, CallError>> + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(CallError) -> BoxFuture<'static, ErrorOutcome> + Send + Sync>;

/// Stable handle returned on registration, used to remove a handler later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorId(u64);

impl InterceptorId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

static NEXT_INTERCEPTOR_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> InterceptorId {
    InterceptorId(NEXT_INTERCEPTOR_ID.fetch_add(1, Ordering::Relaxed))
}

/// Result of one error handler
#[derive(Debug, Clone)]
pub enum ErrorOutcome {
    /// Treat the call as successful with this synthetic response
    Recover(Response),
    /// Pass the (possibly rewritten) error on to the next handler
    Continue(CallError),
}

struct Interceptor<T> {
    id: InterceptorId,
    fulfilled: Fulfilled<T>,
    rejected: Option<Rejected<T>>,
}

impl<T> Clone for Interceptor<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            fulfilled: self.fulfilled.clone(),
            rejected: self.rejected.clone(),
        }
    }
}

/// Ordered list of `(fulfilled, rejected?)` handler pairs over `T`
pub struct InterceptorChain<T> {
    entries: RwLock<Vec<Interceptor<T>>>,
}

impl<T> Default for InterceptorChain<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<T: Send + 'static> InterceptorChain<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a boxed handler pair
    pub fn add_boxed(&self, fulfilled: Fulfilled<T>, rejected: Option<Rejected<T>>) -> InterceptorId {
        let id = next_id();
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Interceptor {
                id,
                fulfilled,
                rejected,
            });
        id
    }

    /// Register an async handler
    pub fn add<F, Fut>(&self, fulfilled: F) -> InterceptorId
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        self.add_boxed(Arc::new(move |value| fulfilled(value).boxed()), None)
    }

    /// Register an async handler with its own error callback. The callback
    /// receives errors raised by `fulfilled` and may recover with a value.
    pub fn add_with_rejected<F, Fut, R, RFut>(&self, fulfilled: F, rejected: R) -> InterceptorId
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
        R: Fn(CallError) -> RFut + Send + Sync + 'static,
        RFut: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        self.add_boxed(
            Arc::new(move |value| fulfilled(value).boxed()),
            Some(Arc::new(move |err| rejected(err).boxed())),
        )
    }

    /// Remove a handler; returns false when the id is unknown
    pub fn eject(&self, id: InterceptorId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Interceptor<T>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run every handler in order over `value`
    pub async fn run(&self, mut value: T) -> Result<T, CallError> {
        for entry in self.snapshot() {
            value = match (entry.fulfilled)(value).await {
                Ok(next) => next,
                Err(err) => match &entry.rejected {
                    Some(rejected) => {
                        trace!("Interceptor {:?} failed, routing to its error callback", entry.id);
                        rejected(err).await?
                    }
                    None => return Err(err),
                },
            };
        }
        Ok(value)
    }
}

/// Ordered list of error handlers; the first recovery short-circuits
#[derive(Default)]
pub struct ErrorChain {
    entries: RwLock<Vec<(InterceptorId, ErrorHandler)>>,
}

impl ErrorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_boxed(&self, handler: ErrorHandler) -> InterceptorId {
        let id = next_id();
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, handler));
        id
    }

    pub fn add<F, Fut>(&self, handler: F) -> InterceptorId
    where
        F: Fn(CallError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ErrorOutcome> + Send + 'static,
    {
        self.add_boxed(Arc::new(move |err| handler(err).boxed()))
    }

    pub fn eject(&self, id: InterceptorId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feed `error` through the handlers. `Ok` carries a recovered response,
    /// `Err` the final unrecovered error.
    pub async fn run(&self, mut error: CallError) -> Result<Response, CallError> {
        let handlers: Vec<ErrorHandler> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        for handler in handlers {
            match handler(error).await {
                ErrorOutcome::Recover(response) => {
                    debug!("Error middleware recovered with status {}", response.status);
                    return Ok(response);
                }
                ErrorOutcome::Continue(next) => error = next,
            }
        }
        Err(error)
    }
}

/// The three independent chains used around every transport call
#[derive(Default)]
pub struct MiddlewareChain {
    pub request: InterceptorChain<RequestSpec>,
    pub response: InterceptorChain<Response>,
    pub error: ErrorChain,
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("request", &self.request.len())
            .field("response", &self.response.len())
            .field("error", &self.error.len())
            .finish()
    }
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        self.request.clear();
        self.response.clear();
        self.error.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.request.is_empty() && self.response.is_empty() && self.error.is_empty()
    }
}
