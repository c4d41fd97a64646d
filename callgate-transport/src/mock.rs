// Scripted in-process transport used by tests and local development.

use crate::transport::{HttpTransport, TransportError};
use async_trait::async_trait;
use callgate_core::{RequestSpec, Response};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type MockHandler =
    Arc<dyn Fn(&RequestSpec, u32) -> Result<Response, TransportError> + Send + Sync>;

/// Answers every request with a handler `(request, call_number)`, where
/// `call_number` counts from 1. Records requests and peak concurrency.
pub struct MockTransport {
    handler: MockHandler,
    delay: Option<Duration>,
    calls: AtomicU32,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    requests: Mutex<Vec<RequestSpec>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("delay", &self.delay)
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

struct InFlight {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn new(
        handler: impl Fn(&RequestSpec, u32) -> Result<Response, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            delay: None,
            calls: AtomicU32::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always answer 200 with `data`
    pub fn json(data: Value) -> Self {
        Self::new(move |request, _| Ok(Response::ok(data.clone(), request.clone())))
    }

    /// Always answer with `status` and `data`
    pub fn status(status: u16, data: Value) -> Self {
        Self::new(move |request, _| Ok(Response::new(data.clone(), status, request.clone())))
    }

    /// Always fail with `error`
    pub fn failing(error: TransportError) -> Self {
        Self::new(move |_, _| Err(error.clone()))
    }

    /// Sleep before answering, so tests can overlap calls
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Requests received so far, in arrival order
    pub fn requests(&self) -> Vec<RequestSpec> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn request(&self, request: &RequestSpec) -> Result<Response, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight {
            counter: self.in_flight.clone(),
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(request, call)
    }
}
