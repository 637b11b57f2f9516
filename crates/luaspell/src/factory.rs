//! Instance factory: builds fresh, sandboxed interpreter instances.
//!
//! Construction order matters and is fixed: create the VM with only the
//! approved standard libraries, strip the escape surface, apply the memory
//! limit, run the preload step (bridge module materialization), run the
//! optional init script, run the optional warmup, then capture the global
//! baseline. Any failure destroys the half-built instance and surfaces a
//! construction error — a partially hardened instance must never reach the
//! pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mlua::{Lua, LuaOptions};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::security::SecurityManager;
use crate::vm::LuaInstance;

/// A step run against a freshly built instance (preload, warmup). The engine
/// wires bridge materialization through this without the factory knowing
/// about bridges.
pub type InstanceSetupFn = Arc<dyn Fn(&LuaInstance) -> Result<()> + Send + Sync>;

/// Everything needed to build one instance.
#[derive(Clone)]
pub struct FactoryConfig {
    pub security: SecurityManager,
    /// Allocator budget in bytes; enforced by the VM when set.
    pub memory_limit: Option<usize>,
    /// Script run once per new instance, before warmup.
    pub init_script: Option<String>,
    /// Runs after hardening, before the init script.
    pub preload: Option<InstanceSetupFn>,
    /// Runs last, e.g. to JIT-warm hot paths or prime caches.
    pub warmup: Option<InstanceSetupFn>,
}

/// Builds sandboxed [`LuaInstance`]s for the pool.
pub struct InstanceFactory {
    config: FactoryConfig,
    /// Effective allocator budget for new instances; 0 means unlimited.
    /// Adjustable at runtime, applies to builds from then on.
    memory_limit: AtomicUsize,
}

impl InstanceFactory {
    pub fn new(config: FactoryConfig) -> Self {
        let memory_limit = AtomicUsize::new(config.memory_limit.unwrap_or(0));
        Self {
            config,
            memory_limit,
        }
    }

    /// Changes the allocator budget for instances built after this call.
    pub fn set_memory_limit(&self, bytes: usize) {
        self.memory_limit.store(bytes, Ordering::Release);
    }

    /// Constructs one fully configured instance.
    pub fn build(&self) -> Result<LuaInstance> {
        let flags = self.config.security.stdlib_flags();
        let lua = Lua::new_with(flags, LuaOptions::default())
            .map_err(|e| construction_error(format!("vm creation failed: {e}")))?;

        let limit = self.memory_limit.load(Ordering::Acquire);
        if limit > 0 {
            lua.set_memory_limit(limit)
                .map_err(|e| construction_error(format!("memory limit rejected: {e}")))?;
        }

        self.config.security.link_into(&lua)?;

        let mut instance = LuaInstance::new(lua);

        if let Some(preload) = &self.config.preload {
            preload(&instance)
                .map_err(|e| construction_error(format!("preload failed: {e}")))?;
        }

        if let Some(init) = &self.config.init_script {
            instance
                .exec("init", init)
                .map_err(|e| construction_error(format!("init script failed: {e}")))?;
        }

        if let Some(warmup) = &self.config.warmup {
            warmup(&instance)
                .map_err(|e| construction_error(format!("warmup failed: {e}")))?;
        }

        instance.capture_baseline()?;

        debug!(instance = %instance.id(), "built interpreter instance");
        Ok(instance)
    }
}

fn construction_error(message: String) -> EngineError {
    EngineError::runtime(format!("instance construction: {message}"))
}
