// Optional process-wide engine handle.
//
// Nothing in the crate reads this implicitly; applications that want a single
// shared engine opt in with `create` or `install` and tear it down with
// `destroy`.

use crate::config::EngineConfig;
use crate::engine::Engine;
use callgate_transport::HttpTransport;
use std::sync::{Arc, RwLock};
use tracing::debug;

static GLOBAL: RwLock<Option<Engine>> = RwLock::new(None);

/// Build an engine and make it the global one. A previous global engine is
/// destroyed.
pub fn create(config: EngineConfig, transport: Arc<dyn HttpTransport>) -> Engine {
    let engine = Engine::new(config, transport);
    install(engine.clone());
    engine
}

/// Make `engine` the global one, destroying any previous global engine
pub fn install(engine: Engine) {
    let previous = GLOBAL
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .replace(engine);
    if let Some(previous) = previous {
        debug!("Replacing global engine");
        previous.destroy();
    }
}

pub fn get() -> Option<Engine> {
    GLOBAL.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Destroy and forget the global engine; returns false when none was set
pub fn destroy() -> bool {
    let engine = GLOBAL.write().unwrap_or_else(|e| e.into_inner()).take();
    match engine {
        Some(engine) => {
            engine.destroy();
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callgate_transport::MockTransport;
    use serde_json::json;

    // One test owns the process-wide slot
    #[tokio::test]
    async fn test_global_lifecycle() {
        assert!(!destroy());
        assert!(get().is_none());

        let first = create(EngineConfig::default(), Arc::new(MockTransport::json(json!(1))));
        assert!(!get().unwrap().is_destroyed());

        let second = create(EngineConfig::default(), Arc::new(MockTransport::json(json!(2))));
        assert!(first.is_destroyed());
        assert!(!second.is_destroyed());

        assert!(destroy());
        assert!(second.is_destroyed());
        assert!(get().is_none());
    }
}
