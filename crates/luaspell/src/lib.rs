// luaspell: sandboxed, pooled Lua execution service with cooperative tasks,
// typed channels, and host capability bridges.

pub mod bridge;
pub mod cache;
pub mod channels;
pub mod config;
pub mod context;
pub(crate) mod convert;
pub mod engine;
pub mod error;
pub mod factory;
pub mod health;
pub mod optimizer;
pub mod pool;
pub mod security;
pub mod tasks;
pub mod types;
pub mod vm;

pub use bridge::{AsyncBridgeWrapper, Bridge, BridgeMetadata, BridgeMethod, BridgeRegistry};
pub use channels::{SelectCase, SelectOp, SelectOutcome};
pub use config::{
    EngineConfig, FilesystemMode, OptimizerConfig, PoolConfig, SecurityConfig, SecurityLevel,
};
pub use context::ExecContext;
pub use engine::{ResourceLimits, ScriptEngine};
pub use error::{EngineError, ErrorKind, Result};
pub use tasks::Promise;
pub use types::{from_native, to_native, EngineFeature, EngineMetrics, Params, PoolMetrics, ScriptValue};
pub use vm::{InstanceId, LuaInstance};
