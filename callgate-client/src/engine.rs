// Engine: resolves named methods and drives each call through the pipeline.
//
// call -> registry -> cache -> debounce -> dedup -> gate -> retry loop
// (request middleware -> transport -> response middleware, error middleware
// on failure) -> transform/validate -> cache write -> hooks.

use crate::config::EngineConfig;
use crate::options::CallOptions;
use crate::plugin::Plugin;
use crate::stats::{CallCounters, EngineStats};
use crate::timing::TimingRecorder;
use callgate_core::{
    CacheStore, CallError, ConcurrencyGate, Debouncer, DeduplicationCoordinator, KeyGenerator,
    MethodConfig, MethodRegistry, MiddlewareChain, Priority, RequestSpec, Response, RetryConfig,
    RetryEngine,
};
use callgate_transport::{HttpTransport, ReqwestTransport, TransportConfig};
use dashmap::DashSet;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Cloneable handle to one engine instance. All clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("methods", &self.inner.registry.len())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

struct EngineInner {
    config: EngineConfig,
    transport: Arc<dyn HttpTransport>,
    registry: MethodRegistry,
    keys: KeyGenerator,
    cache: Arc<CacheStore>,
    debouncer: Debouncer<Value>,
    dedup: DeduplicationCoordinator<Value>,
    gate: ConcurrencyGate,
    retry: RetryEngine,
    middleware: MiddlewareChain,
    timings: TimingRecorder,
    counters: CallCounters,
    plugins: DashSet<String>,
    background: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.stop_background();
    }
}

async fn with_signal<T, F>(signal: Option<&CancellationToken>, fut: F) -> Result<T, CallError>
where
    F: Future<Output = Result<T, CallError>>,
{
    match signal {
        Some(token) => tokio::select! {
            biased;
            result = fut => result,
            _ = token.cancelled() => Err(CallError::cancelled("Request cancelled")),
        },
        None => fut.await,
    }
}

impl Engine {
    /// Create a new engine over `transport`. Background maintenance (cache
    /// sweep, priority boost, stale dedup cleanup) starts when a tokio
    /// runtime is available.
    pub fn new(config: EngineConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let cache = CacheStore::new(config.cache.clone());
        Self::with_cache(config, transport, cache)
    }

    /// Create an engine with a prepared cache, e.g. one backed by
    /// persistent storage or a manual clock
    pub fn with_cache(
        config: EngineConfig,
        transport: Arc<dyn HttpTransport>,
        cache: CacheStore,
    ) -> Self {
        let inner = Arc::new(EngineInner {
            keys: KeyGenerator::new(config.key.clone()),
            gate: ConcurrencyGate::new(config.gate.clone()),
            cache: Arc::new(cache),
            transport,
            registry: MethodRegistry::new(),
            debouncer: Debouncer::new(),
            dedup: DeduplicationCoordinator::new(),
            retry: RetryEngine::new(),
            middleware: MiddlewareChain::new(),
            timings: TimingRecorder::new(),
            counters: CallCounters::default(),
            plugins: DashSet::new(),
            background: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            config,
        });
        EngineInner::start_background(&inner);
        Engine { inner }
    }

    /// Create an engine backed by the reqwest transport
    pub fn with_http(base_url: &str, config: EngineConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(TransportConfig {
            base_url: Some(base_url.to_string()),
            timeout_ms: config.transport_timeout_ms,
            ..Default::default()
        })?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn register(&self, config: MethodConfig) {
        self.inner.registry.register(config);
    }

    pub fn register_all(&self, configs: impl IntoIterator<Item = MethodConfig>) {
        self.inner.registry.register_all(configs);
    }

    /// Remove a method and its cached results
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.inner.registry.unregister(name);
        if removed {
            self.inner.cache.delete_prefix(&method_prefix(name));
        }
        removed
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.inner.registry.contains(name)
    }

    pub fn method_names(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    /// Engine-wide middleware, applied to every call
    pub fn middleware(&self) -> &MiddlewareChain {
        &self.inner.middleware
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.inner.gate
    }

    pub fn timings(&self) -> &TimingRecorder {
        &self.inner.timings
    }

    /// Register a plugin's methods and run its installer. Installing a
    /// plugin with an already installed name is a no-op.
    pub async fn use_plugin(&self, plugin: &dyn Plugin) -> Result<(), CallError> {
        self.inner.ensure_alive()?;
        let name = plugin.name().to_string();
        if !self.inner.plugins.insert(name.clone()) {
            debug!("Plugin {} already installed", name);
            return Ok(());
        }

        self.register_all(plugin.methods());
        if let Err(err) = plugin.install(self).await {
            self.inner.plugins.remove(&name);
            warn!("Plugin {} failed to install: {}", name, err);
            return Err(err);
        }
        info!("Installed plugin {}", name);
        Ok(())
    }

    /// Call `name` with serialisable params and decode the result into `T`
    pub async fn call<P, T>(&self, name: &str, params: &P, options: CallOptions) -> Result<T, CallError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let value = self.call_value(name, params, options).await?;
        serde_json::from_value(value).map_err(|e| {
            CallError::parse(format!("Failed to decode result of {}: {}", name, e))
        })
    }

    /// Call `name` with raw JSON params
    pub async fn call_value(
        &self,
        name: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, CallError> {
        let counters = &self.inner.counters;
        CallCounters::bump(&counters.calls);
        let started = Instant::now();

        let result = self.inner.run_call(name, &params, &options).await;

        let elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        counters.total_latency_us.fetch_add(elapsed_us, Ordering::Relaxed);

        match result {
            Ok(value) => {
                CallCounters::bump(&counters.successes);
                Ok(value)
            }
            Err(err) => {
                CallCounters::bump(&counters.failures);
                let err = err.with_context(name, &params);
                if let Some(hook) = self.inner.registry.get(name).and_then(|m| m.on_error.clone()) {
                    hook(&err, &params);
                }
                if err.is_cancelled() {
                    debug!("Call {} cancelled: {}", name, err);
                } else {
                    warn!("Call {} failed: {}", name, err);
                }
                Err(err)
            }
        }
    }

    /// Drop cached results. `None` clears everything; a registered method
    /// name clears that method's entries; anything else is treated as a raw
    /// cache key. Returns the number of removed entries.
    pub fn clear_cache(&self, target: Option<&str>) -> usize {
        let cache = &self.inner.cache;
        match target {
            None => {
                let count = cache.len();
                cache.clear();
                count
            }
            Some(name) if self.inner.registry.contains(name) => {
                cache.delete_prefix(&method_prefix(name))
            }
            Some(key) => usize::from(cache.delete(key)),
        }
    }

    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        EngineStats::from_counters(
            &inner.counters,
            inner.cache.stats(),
            inner.gate.stats(),
            inner.dedup.stats(),
            inner.timings.snapshot(),
        )
    }

    pub fn performance_metrics(&self) -> EngineStats {
        self.stats()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Stop background work, reject queued and in-flight shared calls, and
    /// clear all state. Later calls fail with a cancellation error.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = &self.inner;
        inner.stop_background();
        inner.gate.close();
        let aborted = inner.dedup.cancel_all();
        inner.debouncer.clear();
        inner.cache.clear();
        inner.registry.clear();
        inner.middleware.clear();
        inner.timings.clear();
        inner.plugins.clear();
        info!("Engine destroyed ({} in-flight requests aborted)", aborted);
    }
}

/// Cache key prefix for a method. `|` separates the name from the request
/// key, so it is escaped inside names (and `%` with it).
fn method_prefix(name: &str) -> String {
    format!("{}|", name.replace('%', "%25").replace('|', "%7C"))
}

impl EngineInner {
    fn ensure_alive(&self) -> Result<(), CallError> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(CallError::cancelled("Engine has been destroyed"))
        } else {
            Ok(())
        }
    }

    fn start_background(inner: &Arc<Self>) {
        inner.gate.start_background();

        let mut tasks = Vec::new();
        if let Some(sweeper) = inner.cache.spawn_sweeper() {
            tasks.push(sweeper);
        }
        if let Some(cleanup) = Self::spawn_dedup_cleanup(inner) {
            tasks.push(cleanup);
        }
        *inner.background.lock().unwrap_or_else(|e| e.into_inner()) = tasks;
    }

    fn spawn_dedup_cleanup(inner: &Arc<Self>) -> Option<JoinHandle<()>> {
        if inner.config.dedup_cleanup_interval_ms == 0 {
            return None;
        }
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let period = Duration::from_millis(inner.config.dedup_cleanup_interval_ms);
        let max_age = inner.config.effective_dedup_max_age();
        let weak: Weak<EngineInner> = Arc::downgrade(inner);

        Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.dedup.cleanup_timeout_tasks(max_age);
            }
        }))
    }

    fn stop_background(&self) {
        let tasks = std::mem::take(&mut *self.background.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
    }

    async fn run_call(
        self: &Arc<Self>,
        name: &str,
        params: &Value,
        options: &CallOptions,
    ) -> Result<Value, CallError> {
        self.ensure_alive()?;
        let signal = options.signal.as_ref();
        if signal.is_some_and(CancellationToken::is_cancelled) {
            return Err(CallError::cancelled("Request cancelled"));
        }

        let method = self.registry.resolve(name)?;
        let request = method.build_request(params)?;
        let key = format!("{}{}", method_prefix(&method.name), self.keys.generate(&request));

        let cache_policy = if options.skip_cache {
            None
        } else {
            method.cache_policy(&request, options.cache)
        };
        if cache_policy.is_some() {
            if let Some(hit) = self.cache.get(&key) {
                CallCounters::bump(&self.counters.cache_hits);
                debug!("Cache hit for {}", key);
                return Ok(hit);
            }
            trace!("Cache miss for {}", key);
        }

        let dedup = !options.skip_deduplication && method.dedup_enabled(request.method);
        let execution = Execution {
            inner: self.clone(),
            retry: options
                .retry
                .clone()
                .or_else(|| method.retry.clone())
                .unwrap_or_else(|| self.config.retry.clone()),
            priority: options.priority.or(method.priority).unwrap_or_default(),
            cache_ttl: cache_policy.map(|p| p.ttl(self.config.default_cache_ttl())),
            extra: options.middlewares.clone(),
            params: params.clone(),
            key: key.clone(),
            method: method.clone(),
            request,
        };

        let run = async {
            if dedup {
                self.dedup
                    .execute(&key, signal, move || execution.run(None))
                    .await
            } else {
                with_signal(signal, execution.run(signal.cloned())).await
            }
        };

        match method.debounce() {
            Some(delay) if !options.skip_debounce => {
                with_signal(signal, self.debouncer.debounce(&method.name, delay, || run)).await
            }
            _ => run.await,
        }
    }

    /// One attempt: run the exchange and, on failure, the error middleware
    async fn attempt(
        &self,
        request: &RequestSpec,
        extra: Option<&MiddlewareChain>,
        attempt: u32,
    ) -> Result<Response, CallError> {
        trace!("Attempt {} for {} {}", attempt, request.method, request.url);
        let err = match self.exchange(request, extra).await {
            Ok(response) => return Ok(response),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => err,
        };

        let err = match self.middleware.error.run(err).await {
            Ok(recovered) => return Ok(recovered),
            Err(err) => err,
        };
        match extra {
            Some(chain) => chain.error.run(err).await,
            None => Err(err),
        }
    }

    async fn exchange(
        &self,
        request: &RequestSpec,
        extra: Option<&MiddlewareChain>,
    ) -> Result<Response, CallError> {
        let mut request = self.middleware.request.run(request.clone()).await?;
        if let Some(chain) = extra {
            request = chain.request.run(request).await?;
        }

        let response = self.transport.request(&request).await?;
        if !response.is_success() {
            let status = response.status;
            return Err(
                CallError::http(status, format!("Request failed with status {}", status))
                    .with_response(response),
            );
        }

        let mut response = self.middleware.response.run(response).await?;
        if let Some(chain) = extra {
            response = chain.response.run(response).await?;
        }
        Ok(response)
    }
}

/// Everything one network execution needs, owned so it can run as a
/// detached task when deduplicated
struct Execution {
    inner: Arc<EngineInner>,
    method: Arc<MethodConfig>,
    request: RequestSpec,
    params: Value,
    key: String,
    cache_ttl: Option<Duration>,
    retry: RetryConfig,
    priority: Priority,
    extra: Option<Arc<MiddlewareChain>>,
}

impl Execution {
    async fn run(self, signal: Option<CancellationToken>) -> Result<Value, CallError> {
        let inner = &self.inner;
        let started = Instant::now();

        let permit = inner.gate.acquire(self.priority, signal.as_ref()).await?;
        CallCounters::bump(&inner.counters.network_calls);

        let request = &self.request;
        let extra = self.extra.as_deref();
        let (result, state) = inner
            .retry
            .execute_with_state(&self.retry, move |attempt| inner.attempt(request, extra, attempt))
            .await;
        drop(permit);

        if state.attempt > 1 {
            inner
                .counters
                .retries
                .fetch_add(u64::from(state.attempt - 1), Ordering::Relaxed);
        }
        let response = result?;
        // Error middleware may recover with a non-2xx fallback
        let cacheable = response.is_success();
        let data = self.method.process(response.data)?;

        if self.method.timed {
            inner.timings.record(&self.method.name, started.elapsed());
        }
        match self.cache_ttl {
            Some(ttl) if cacheable => inner.cache.set(&self.key, data.clone(), ttl),
            Some(_) => debug!(
                "Not caching {} response for {}",
                response.status, self.key
            ),
            None => {}
        }
        for target in &self.method.invalidates {
            let removed = inner.cache.delete_prefix(&method_prefix(target));
            debug!("{} invalidated {} cached entries of {}", self.method.name, removed, target);
        }
        if let Some(hook) = &self.method.on_success {
            hook(&data, &self.params);
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callgate_core::ErrorKind;
    use callgate_transport::MockTransport;
    use serde_json::json;

    fn engine_with(transport: MockTransport) -> (Engine, Arc<MockTransport>) {
        let transport = Arc::new(transport);
        let config = EngineConfig {
            retry: RetryConfig {
                initial_delay_ms: 10,
                enable_jitter: false,
                ..Default::default()
            },
            ..Default::default()
        };
        (Engine::new(config, transport.clone()), transport)
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (engine, transport) = engine_with(MockTransport::json(json!(1)));
        let err = engine
            .call_value("nope", Value::Null, CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MethodNotFound);
        assert_eq!(err.context.unwrap().method_name, "nope");
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_typed_call_round_trip() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Item {
            id: u32,
        }

        let (engine, transport) = engine_with(MockTransport::new(|request, _| {
            let id = request
                .params
                .as_ref()
                .and_then(|p| p["id"].as_u64())
                .unwrap_or(0);
            Ok(Response::ok(json!({ "id": id }), request.clone()))
        }));
        engine.register(MethodConfig::get("item.get", "/items"));

        let item: Item = engine
            .call("item.get", &json!({"id": 5}), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(item, Item { id: 5 });

        let err = engine
            .call::<_, Vec<String>>("item.get", &json!({"id": 6}), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_clear_cache_targets() {
        let (engine, transport) = engine_with(MockTransport::json(json!([1])));
        engine.register_all([
            MethodConfig::get("a.list", "/a"),
            MethodConfig::get("b.list", "/b"),
        ]);
        for name in ["a.list", "b.list"] {
            engine.call_value(name, Value::Null, CallOptions::default()).await.unwrap();
        }
        assert_eq!(engine.cache().len(), 2);

        assert_eq!(engine.clear_cache(Some("a.list")), 1);
        assert_eq!(engine.clear_cache(Some("b.list|GET /b")), 1);
        assert_eq!(engine.clear_cache(None), 0);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_clear_cache_does_not_touch_names_sharing_a_prefix() {
        let (engine, _transport) = engine_with(MockTransport::json(json!([1])));
        engine.register_all([
            MethodConfig::get("a", "/a"),
            MethodConfig::get("a|b", "/ab"),
            MethodConfig::get("a%7Cb", "/ab2"),
        ]);
        for name in ["a", "a|b", "a%7Cb"] {
            engine.call_value(name, Value::Null, CallOptions::default()).await.unwrap();
        }
        assert_eq!(engine.cache().len(), 3);

        assert_eq!(engine.clear_cache(Some("a")), 1);
        assert_eq!(engine.clear_cache(Some("a|b")), 1);
        assert_eq!(engine.clear_cache(Some("a%7Cb")), 1);
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_final() {
        let (engine, _transport) = engine_with(MockTransport::json(json!(1)));
        engine.register(MethodConfig::get("a", "/a"));
        engine.destroy();
        engine.destroy();

        assert!(engine.is_destroyed());
        assert!(!engine.has_method("a"));
        let err = engine
            .call_value("a", Value::Null, CallOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
