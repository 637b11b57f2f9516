//! Engine configuration.
//!
//! All knobs are plain serde-deserializable data with defaults, so a config
//! can come from a file, an env layer, or `EngineConfig::default()`. Durations
//! are millisecond integers on the wire.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How much filesystem surface scripts get.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FilesystemMode {
    /// No filesystem access at all; `io` and `os` are never linked.
    #[default]
    None,
    /// `io.open` is replaced with a read-only wrapper.
    ReadOnly,
    /// The linked `io` library is left as-is (still subject to the module
    /// allow/deny lists).
    ReadWrite,
}

/// Sandbox strictness level. `disabled` entries always override `allowed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityLevel {
    /// Arithmetic and string/table manipulation only.
    Minimal,
    /// Minimal plus `utf8` and `coroutine`.
    #[default]
    Standard,
    /// Standard, with reflection and metatable surgery removed on top.
    Strict,
}

/// Which built-ins and capabilities are linked into an interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    pub level: SecurityLevel,
    /// Module names linked in addition to the level's base set.
    pub allowed_modules: Vec<String>,
    /// Module names removed even if allowed. `"filesystem"` and `"process"`
    /// are accepted as aliases for `io` and `os`.
    pub disabled_modules: Vec<String>,
}

/// Interpreter pool sizing and lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Instances pre-warmed at startup and kept through idle eviction.
    pub min_size: usize,
    /// Hard ceiling on live instances.
    pub max_size: usize,
    /// Idle instances older than this are evicted by the background sweep.
    pub idle_timeout_ms: u64,
    /// Instances scoring below this on return are recycled.
    pub health_threshold: f64,
    /// Background sweep cadence.
    pub cleanup_interval_ms: u64,
    /// When true, an instance returned in a damaged state is recycled
    /// immediately instead of being cleaned and left for the health score to
    /// judge at the next lease.
    pub recycle_damaged_on_return: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 8,
            idle_timeout_ms: 300_000,
            health_threshold: 0.5,
            cleanup_interval_ms: 60_000,
            recycle_damaged_on_return: false,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Source-level transforms applied before compilation, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub strip_comments: bool,
    pub reduce_whitespace: bool,
    pub fold_constants: bool,
    pub eliminate_dead_code: bool,
    pub pattern_opt: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            strip_comments: true,
            reduce_whitespace: true,
            fold_constants: true,
            eliminate_dead_code: true,
            pattern_opt: true,
        }
    }
}

impl OptimizerConfig {
    /// Stable one-byte encoding of the flag set, folded into cache keys so
    /// artifacts produced under different configs never collide.
    pub fn fingerprint(&self) -> u8 {
        (self.strip_comments as u8)
            | (self.reduce_whitespace as u8) << 1
            | (self.fold_constants as u8) << 2
            | (self.eliminate_dead_code as u8) << 3
            | (self.pattern_opt as u8) << 4
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Advisory memory budget per instance, in bytes. Enforced by the VM's
    /// allocator limit where available and fed into health scoring.
    pub memory_limit: Option<usize>,
    /// Default per-execution deadline when the caller supplies none.
    pub timeout_limit_ms: u64,
    /// Whether the security manager's strict capability list is applied.
    /// When false, the full safe standard library is linked.
    pub sandbox_mode: bool,
    pub security: SecurityConfig,
    pub filesystem_mode: FilesystemMode,
    pub pool: PoolConfig,
    /// Maximum cached compiled artifacts.
    pub chunk_cache_size: usize,
    pub optimizer: OptimizerConfig,
    /// Ceiling on concurrently active script tasks.
    pub max_coroutines: usize,
    /// Ceiling on concurrently open channels.
    pub max_channels: usize,
    /// Script run once in every freshly built instance, before warmup.
    pub init_script: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_limit: None,
            timeout_limit_ms: 5_000,
            sandbox_mode: true,
            security: SecurityConfig::default(),
            filesystem_mode: FilesystemMode::None,
            pool: PoolConfig::default(),
            chunk_cache_size: 256,
            optimizer: OptimizerConfig::default(),
            max_coroutines: 64,
            max_channels: 256,
            init_script: None,
        }
    }
}

impl EngineConfig {
    pub fn timeout_limit(&self) -> Duration {
        Duration::from_millis(self.timeout_limit_ms)
    }
}
