// Named API method client: register methods once, then call them by name
// through caching, deduplication, priority queueing, retries and middleware.

pub mod config;
pub mod engine;
pub mod global;
pub mod logging;
pub mod mutation;
pub mod options;
pub mod plugin;
pub mod stats;
pub mod timing;

pub use config::EngineConfig;
pub use engine::Engine;
pub use mutation::{Mutation, RollbackStack};
pub use options::CallOptions;
pub use plugin::Plugin;
pub use stats::EngineStats;
pub use timing::{with_timing, TimingRecorder, TimingStats};

pub use callgate_core::{
    BackoffStrategy, CachePolicy, CallError, ErrorKind, ErrorOutcome, HttpMethod, MethodConfig,
    MiddlewareChain, Priority, RequestSpec, Response, RetryConfig,
};
pub use callgate_transport::{HttpTransport, MockTransport, ReqwestTransport, TransportError};
