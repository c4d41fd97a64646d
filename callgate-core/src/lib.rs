// Pipeline building blocks for named API calls: request keys, caching,
// deduplication, debouncing, priority admission, retry and middleware.

pub mod cache;
pub mod debounce;
pub mod dedup;
pub mod error;
pub mod gate;
pub mod key;
pub mod middleware;
pub mod registry;
pub mod request;
pub mod retry;
pub mod validate;

pub use cache::{
    CacheConfig, CacheEntry, CacheStats, CacheStorage, CacheStore, Clock, JsonFileStorage,
    ManualClock, MemoryStorage, StorageError, SystemClock,
};
pub use debounce::Debouncer;
pub use dedup::{DedupStats, DeduplicationCoordinator};
pub use error::{CallError, ErrorContext, ErrorKind};
pub use gate::{ConcurrencyGate, GateConfig, GatePermit, GateStats, Priority};
pub use key::{BodyKeyMode, KeyConfig, KeyGenerator};
pub use middleware::{ErrorChain, ErrorOutcome, InterceptorChain, InterceptorId, MiddlewareChain};
pub use registry::{CachePolicy, MethodConfig, MethodRegistry, RequestTemplate, Validation};
pub use request::{HttpMethod, RequestSpec, Response};
pub use retry::{BackoffStrategy, RetryConfig, RetryEngine, RetryState};
pub use validate::SchemaValidator;
