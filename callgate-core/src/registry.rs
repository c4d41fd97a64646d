// Named API methods and the per-method pipeline overrides.

use crate::error::CallError;
use crate::gate::Priority;
use crate::request::{HttpMethod, RequestSpec};
use crate::retry::RetryConfig;
use crate::validate::SchemaValidator;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub type RequestBuilder = Arc<dyn Fn(&Value) -> Result<RequestSpec, CallError> + Send + Sync>;
pub type Transform = Arc<dyn Fn(Value) -> Result<Value, CallError> + Send + Sync>;
pub type CustomValidator = Arc<dyn Fn(&Value) -> Result<(), CallError> + Send + Sync>;
/// Called with `(data, params)` after a successful network call
pub type SuccessHook = Arc<dyn Fn(&Value, &Value) + Send + Sync>;
/// Called with `(error, params)` after a failed call
pub type ErrorHook = Arc<dyn Fn(&CallError, &Value) + Send + Sync>;

/// How a method turns call params into a request
#[derive(Clone)]
pub enum RequestTemplate {
    /// Fixed request; params are merged in with [`RequestSpec::merged_with`]
    Static(RequestSpec),
    /// Request computed from params on every call
    Dynamic(RequestBuilder),
}

impl std::fmt::Debug for RequestTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestTemplate::Static(spec) => f.debug_tuple("Static").field(spec).finish(),
            RequestTemplate::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

#[derive(Clone)]
pub enum Validation {
    Custom(CustomValidator),
    Schema(Arc<SchemaValidator>),
}

impl Validation {
    pub fn check(&self, data: &Value) -> Result<(), CallError> {
        match self {
            Validation::Custom(check) => check(data),
            Validation::Schema(schema) => schema.validate(data),
        }
    }
}

/// Per-method cache settings. Without one, read methods are cached with the
/// engine's default TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl_ms: Option<u64>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: None,
        }
    }
}

impl CachePolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ttl_ms: None,
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            enabled: true,
            ttl_ms: Some(ttl.as_millis() as u64),
        }
    }

    pub fn ttl(&self, default_ttl: Duration) -> Duration {
        self.ttl_ms.map(Duration::from_millis).unwrap_or(default_ttl)
    }
}

#[derive(Clone)]
pub struct MethodConfig {
    pub name: String,
    pub request: RequestTemplate,
    pub transform: Option<Transform>,
    pub validate: Option<Validation>,
    pub cache: Option<CachePolicy>,
    pub retry: Option<RetryConfig>,
    pub on_success: Option<SuccessHook>,
    pub on_error: Option<ErrorHook>,
    /// Overrides the default: on for read methods, off for writes
    pub dedup: Option<bool>,
    pub debounce_ms: Option<u64>,
    pub priority: Option<Priority>,
    /// Methods whose cached results are dropped after this one succeeds
    pub invalidates: Vec<String>,
    pub timed: bool,
}

impl std::fmt::Debug for MethodConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodConfig")
            .field("name", &self.name)
            .field("request", &self.request)
            .field("cache", &self.cache)
            .field("retry", &self.retry)
            .field("dedup", &self.dedup)
            .field("debounce_ms", &self.debounce_ms)
            .field("priority", &self.priority)
            .field("invalidates", &self.invalidates)
            .field("timed", &self.timed)
            .finish_non_exhaustive()
    }
}

impl MethodConfig {
    pub fn new(name: impl Into<String>, request: RequestTemplate) -> Self {
        MethodConfig {
            name: name.into(),
            request,
            transform: None,
            validate: None,
            cache: None,
            retry: None,
            on_success: None,
            on_error: None,
            dedup: None,
            debounce_ms: None,
            priority: None,
            invalidates: Vec::new(),
            timed: false,
        }
    }

    pub fn from_spec(name: impl Into<String>, spec: RequestSpec) -> Self {
        Self::new(name, RequestTemplate::Static(spec))
    }

    pub fn get(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::from_spec(name, RequestSpec::get(url))
    }

    pub fn post(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::from_spec(name, RequestSpec::post(url))
    }

    pub fn put(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::from_spec(name, RequestSpec::put(url))
    }

    pub fn patch(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::from_spec(name, RequestSpec::patch(url))
    }

    pub fn delete(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::from_spec(name, RequestSpec::delete(url))
    }

    /// A method whose request is computed from the call params
    pub fn dynamic(
        name: impl Into<String>,
        build: impl Fn(&Value) -> Result<RequestSpec, CallError> + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, RequestTemplate::Dynamic(Arc::new(build)))
    }

    pub fn with_transform(
        mut self,
        transform: impl Fn(Value) -> Result<Value, CallError> + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn with_validator(
        mut self,
        check: impl Fn(&Value) -> Result<(), CallError> + Send + Sync + 'static,
    ) -> Self {
        self.validate = Some(Validation::Custom(Arc::new(check)));
        self
    }

    /// Validate transformed data against a JSON schema
    pub fn with_schema(mut self, schema: Value) -> Result<Self, CallError> {
        self.validate = Some(Validation::Schema(Arc::new(SchemaValidator::new(schema)?)));
        Ok(self)
    }

    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    pub fn with_cache_ttl(self, ttl: Duration) -> Self {
        self.with_cache(CachePolicy::with_ttl(ttl))
    }

    pub fn without_cache(self) -> Self {
        self.with_cache(CachePolicy::disabled())
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn on_success(mut self, hook: impl Fn(&Value, &Value) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&CallError, &Value) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn with_dedup(mut self, enabled: bool) -> Self {
        self.dedup = Some(enabled);
        self
    }

    pub fn with_debounce(mut self, delay: Duration) -> Self {
        self.debounce_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn invalidates<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidates.extend(methods.into_iter().map(Into::into));
        self
    }

    pub fn timed(mut self) -> Self {
        self.timed = true;
        self
    }

    /// Build the concrete request for one call
    pub fn build_request(&self, params: &Value) -> Result<RequestSpec, CallError> {
        match &self.request {
            RequestTemplate::Static(spec) => Ok(spec.merged_with(params)),
            RequestTemplate::Dynamic(build) => build(params),
        }
    }

    /// Transform then validate raw response data
    pub fn process(&self, data: Value) -> Result<Value, CallError> {
        let data = match &self.transform {
            Some(transform) => transform(data)?,
            None => data,
        };
        if let Some(validation) = &self.validate {
            validation.check(&data)?;
        }
        Ok(data)
    }

    /// Cache policy in effect for `request`, or `None` when it must not be
    /// cached. `override_policy` comes from the call site and wins.
    pub fn cache_policy(
        &self,
        request: &RequestSpec,
        override_policy: Option<CachePolicy>,
    ) -> Option<CachePolicy> {
        if !request.method.is_read() {
            return None;
        }
        let policy = override_policy.or(self.cache).unwrap_or_default();
        policy.enabled.then_some(policy)
    }

    /// Whether concurrent identical calls share one execution
    pub fn dedup_enabled(&self, method: HttpMethod) -> bool {
        self.dedup.unwrap_or_else(|| method.is_read())
    }

    pub fn debounce(&self) -> Option<Duration> {
        self.debounce_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

/// Thread-safe name -> config table
#[derive(Debug, Default)]
pub struct MethodRegistry {
    methods: DashMap<String, Arc<MethodConfig>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `config` under its name, replacing any previous registration
    pub fn register(&self, config: MethodConfig) {
        debug!("Registering method {}", config.name);
        self.methods.insert(config.name.clone(), Arc::new(config));
    }

    pub fn register_all(&self, configs: impl IntoIterator<Item = MethodConfig>) {
        for config in configs {
            self.register(config);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<MethodConfig>> {
        self.methods.get(name).map(|entry| entry.value().clone())
    }

    /// Look up `name`, failing with `MethodNotFound`
    pub fn resolve(&self, name: &str) -> Result<Arc<MethodConfig>, CallError> {
        self.get(name).ok_or_else(|| CallError::method_not_found(name))
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.methods.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn clear(&self) {
        self.methods.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_static_read_merges_query() {
        let config = MethodConfig::get("item.list", "/items")
            .with_cache_ttl(Duration::from_secs(60));
        let request = config.build_request(&json!({"page": 2})).unwrap();
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.params, Some(json!({"page": 2})));
        assert!(request.data.is_none());
        assert_eq!(
            config.cache_policy(&request, None).unwrap().ttl(Duration::ZERO),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_static_write_uses_body_and_is_never_cached() {
        let config = MethodConfig::from_spec(
            "item.create",
            RequestSpec::post("/items").with_data(json!({"kind": "note"})),
        );
        let request = config.build_request(&json!({"title": "a"})).unwrap();
        assert_eq!(request.data, Some(json!({"kind": "note", "title": "a"})));
        assert!(config.cache_policy(&request, None).is_none());
        assert!(!config.dedup_enabled(request.method));
        assert!(config.clone().with_dedup(true).dedup_enabled(request.method));
    }

    #[test]
    fn test_dynamic_template() {
        let config = MethodConfig::dynamic("item.get", |params| {
            let id = params["id"]
                .as_u64()
                .ok_or_else(|| CallError::validation("id is required"))?;
            Ok(RequestSpec::get(format!("/items/{}", id)))
        });

        assert_eq!(config.build_request(&json!({"id": 7})).unwrap().url, "/items/7");
        let err = config.build_request(&json!({})).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_process_transforms_then_validates() {
        let config = MethodConfig::get("item.count", "/items")
            .with_transform(|data| Ok(json!(data.as_array().map(Vec::len).unwrap_or(0))))
            .with_validator(|data| {
                if data.as_u64().is_some() {
                    Ok(())
                } else {
                    Err(CallError::validation("expected a count"))
                }
            });

        assert_eq!(config.process(json!([1, 2, 3])).unwrap(), json!(3));
    }

    #[test]
    fn test_disabled_cache_policy() {
        let config = MethodConfig::get("clock.now", "/now").without_cache();
        let request = config.build_request(&Value::Null).unwrap();
        assert!(config.cache_policy(&request, None).is_none());
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = MethodRegistry::new();
        registry.register_all([
            MethodConfig::get("item.list", "/items"),
            MethodConfig::post("item.create", "/items").invalidates(["item.list"]),
        ]);

        assert_eq!(registry.names(), vec!["item.create", "item.list"]);
        assert_eq!(registry.get("item.create").unwrap().invalidates, vec!["item.list"]);

        // Re-registering replaces the previous config
        registry.register(MethodConfig::get("item.list", "/v2/items"));
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister("item.list"));
        let err = registry.resolve("item.list").unwrap_err();
        assert_eq!(err.kind, ErrorKind::MethodNotFound);
    }
}
