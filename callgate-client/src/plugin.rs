use crate::engine::Engine;
use async_trait::async_trait;
use callgate_core::{CallError, MethodConfig};

/// A bundle of methods plus setup code, installed with [`Engine::use_plugin`].
///
/// Methods are registered before `install` runs, so the installer may call
/// them or attach middleware that depends on them.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn methods(&self) -> Vec<MethodConfig> {
        Vec::new()
    }

    async fn install(&self, _engine: &Engine) -> Result<(), CallError> {
        Ok(())
    }
}
