//! The engine facade and the end-to-end execution pipeline.
//!
//! One [`ScriptEngine`] composes the whole system: pool, health monitor,
//! chunk cache + optimizer, task runtime, channel manager, and bridge
//! registry. A single `execute` call flows through the pipeline:
//!
//! 1. lease an instance (healthiest idle first, blocking under the ctx);
//! 2. bound the deadline by the configured execution limit;
//! 3. ensure registered bridge modules are visible, install parameters;
//! 4. fetch or build the optimized artifact (cache keyed by name, source,
//!    and optimizer config);
//! 5. run the chunk on a blocking thread, racing the context;
//! 6. extract the return value through the fixed conversion mapping;
//! 7. on deadline/cancel with the script still running: raise the interrupt
//!    flag, give the script a bounded grace to observe it, then abandon the
//!    instance — a mid-execution cancellation never returns its instance to
//!    the pool;
//! 8. on completion, record health and return the instance via `put`.
//!
//! Spawned coroutines run the same pipeline with their own leased instance,
//! so no instance is ever shared between concurrent execution units.
//!
//! Shutdown order: reject new work, close the task runtime, the channel
//! manager, and the bridge registry, drain the pool under a deadline, then
//! clear the cache. Calling shutdown twice is a no-op.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bridge::{AsyncBridgeWrapper, Bridge, BridgeRegistry};
use crate::cache::{chunk_key, ChunkArtifact, ChunkCache, ChunkMetadata};
use crate::channels::ChannelManager;
use crate::config::{EngineConfig, FilesystemMode};
use crate::context::ExecContext;
use crate::error::{EngineError, ErrorKind, Result};
use crate::factory::{FactoryConfig, InstanceFactory};
use crate::health::HealthMonitor;
use crate::optimizer::SourceOptimizer;
use crate::pool::InstancePool;
use crate::security::SecurityManager;
use crate::tasks::{ExecFuture, FragmentExecutor, TaskRuntime};
use crate::types::{EngineFeature, EngineMetrics, Params, ScriptValue};
use crate::vm::{InstanceId, InterruptKind};

/// How long a script gets to observe its interrupt flag before the pipeline
/// abandons the instance.
const INTERRUPT_GRACE: Duration = Duration::from_millis(100);

/// Caps adjustable after construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLimits {
    pub max_memory: Option<usize>,
    pub max_exec_time: Option<Duration>,
    pub max_coroutines: Option<usize>,
}

#[derive(Default)]
struct EngineCounters {
    scripts_executed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    total_exec_ms: AtomicU64,
    error_count: AtomicU64,
}

/// Shared pipeline state: everything one execution needs. Task fragments run
/// through the same core, which is what guarantees them their own instance.
struct PipelineCore {
    pool: Arc<InstancePool>,
    health: Arc<HealthMonitor>,
    cache: Arc<ChunkCache>,
    optimizer: SourceOptimizer,
    bridges: Arc<BridgeRegistry>,
    counters: EngineCounters,
    timeout: RwLock<Duration>,
    closed: AtomicBool,
}

impl PipelineCore {
    async fn execute(
        &self,
        ctx: &ExecContext,
        name: &str,
        source: &str,
        params: Option<&Params>,
    ) -> Result<ScriptValue> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::closed("engine"));
        }
        let ctx = ctx.bounded_by(*self.timeout.read());
        let started = Instant::now();

        let outcome = self.run(&ctx, name, source, params).await;

        self.counters.scripts_executed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_exec_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        if outcome.is_err() {
            self.counters.error_count.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    async fn run(
        &self,
        ctx: &ExecContext,
        name: &str,
        source: &str,
        params: Option<&Params>,
    ) -> Result<ScriptValue> {
        let instance = self.pool.get(ctx).await?;
        let id = instance.id();

        // Bridge modules materialized after this instance's baseline may have
        // been wiped by cleanup; re-install anything missing.
        if let Err(e) = self.bridges.install_all(&instance) {
            self.pool.put(instance);
            return Err(e);
        }

        if let Some(params) = params {
            if let Err(e) = instance.install_params(params) {
                self.pool.put(instance);
                return Err(e);
            }
        }

        let key = chunk_key(name, source, self.optimizer.config());
        let (artifact, cache_hit) = match self.cache.get(&key) {
            Some(artifact) => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                (artifact, true)
            }
            None => {
                self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
                let (optimized, report) = self.optimizer.optimize(source);
                let artifact = ChunkArtifact {
                    source: Arc::from(optimized),
                    metadata: ChunkMetadata {
                        original_size: report.original_len,
                        optimized_size: report.optimized_len,
                        optimize_duration: report.duration,
                        compile_duration: None,
                        fired_transforms: report.fired,
                        warnings: report.warnings,
                    },
                };
                (artifact, false)
            }
        };

        // The chunk runs synchronously on a blocking thread; the instance
        // travels with it and comes back in the join result.
        let interrupt = instance.interrupt_handle();
        let chunk_name = name.to_string();
        let chunk_source = Arc::clone(&artifact.source);
        let run_started = Instant::now();
        let mut join = tokio::task::spawn_blocking(move || {
            let result = instance.run_chunk(&chunk_name, &chunk_source);
            (instance, result)
        });

        match ctx.run_until(&mut join).await {
            Ok(joined) => {
                let (instance, result) = match joined {
                    Ok(pair) => pair,
                    Err(e) => {
                        // Executor thread died; the instance died with it.
                        self.pool.abandon(id);
                        return Err(EngineError::runtime(format!("executor thread failed: {e}")));
                    }
                };
                let duration = run_started.elapsed();
                self.health.record_execution(id, duration, result.is_err());
                self.health.update_memory_usage(id, instance.used_memory());

                match result {
                    Err(e) if matches!(e.kind(), ErrorKind::Cancelled | ErrorKind::Timeout) => {
                        // The interrupt hook fired inside the script. The
                        // execution was cancelled mid-run; the instance is
                        // never returned to the pool.
                        self.pool.abandon(id);
                        drop(instance);
                        Err(rewrite_interrupt_error(ctx, e))
                    }
                    result => {
                        if !cache_hit && !matches!(result, Err(EngineError::Syntax { .. })) {
                            let mut artifact = artifact;
                            artifact.metadata.compile_duration = Some(duration);
                            self.cache.put(key, artifact);
                        }
                        self.pool.put(instance);
                        result
                    }
                }
            }
            Err(ctx_error) => {
                // Context fired while the script is still on its thread.
                // Signal the cooperative hook, wait a bounded grace, then
                // abandon — the pipeline never blocks on a hung script.
                interrupt.request(match ctx_error.kind() {
                    ErrorKind::Cancelled => InterruptKind::Cancel,
                    _ => InterruptKind::Deadline,
                });
                match tokio::time::timeout(INTERRUPT_GRACE, &mut join).await {
                    Ok(Ok((instance, _discarded))) => {
                        // The script observed the interrupt within the grace
                        // window, but this lease was still cancelled mid-run:
                        // abandon, never re-pool.
                        self.pool.abandon(id);
                        drop(instance);
                    }
                    Ok(Err(e)) => {
                        warn!(instance = %id, error = %e, "executor thread failed during cancellation");
                        self.pool.abandon(id);
                    }
                    Err(_grace_elapsed) => {
                        self.pool.abandon(id);
                        debug!(instance = %id, "script did not yield in grace window, reaping in background");
                        let pool = Arc::clone(&self.pool);
                        tokio::spawn(async move {
                            match join.await {
                                // The pool recognizes the abandoned identity
                                // and discards it with a log line.
                                Ok((instance, _)) => pool.put(instance),
                                Err(e) => {
                                    warn!(instance = %id, error = %e, "abandoned executor thread failed")
                                }
                            }
                        });
                    }
                }
                Err(ctx_error)
            }
        }
    }
}

/// The interrupt hook cannot know the caller's deadline; re-derive the
/// canonical error from the context that actually fired.
fn rewrite_interrupt_error(ctx: &ExecContext, fallback: EngineError) -> EngineError {
    match ctx.check() {
        Err(e) => e,
        Ok(()) => match fallback {
            EngineError::Timeout { limit_ms: 0 } => EngineError::Timeout {
                limit_ms: ctx.limit_ms(),
            },
            other => other,
        },
    }
}

/// Adapter letting the task runtime drive the pipeline.
struct CoreExecutor(Arc<PipelineCore>);

impl FragmentExecutor for CoreExecutor {
    fn run(&self, ctx: ExecContext, fragment: String, params: Option<Params>) -> ExecFuture {
        let core = Arc::clone(&self.0);
        Box::pin(async move { core.execute(&ctx, "task", &fragment, params.as_ref()).await })
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Sandboxed, pooled, concurrent Lua execution service. Multiple engines in
/// one process are fully independent; there is no process-wide state.
///
/// Must be created inside a tokio runtime (the pool's background sweep is a
/// spawned task).
pub struct ScriptEngine {
    config: EngineConfig,
    core: Arc<PipelineCore>,
    pool: Arc<InstancePool>,
    health: Arc<HealthMonitor>,
    cache: Arc<ChunkCache>,
    tasks: Arc<TaskRuntime>,
    channels: Arc<ChannelManager>,
    bridges: Arc<BridgeRegistry>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ScriptEngine {
    /// Builds the engine and pre-warms the pool per `config`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let security = SecurityManager::new(
            config.security.clone(),
            config.sandbox_mode,
            config.filesystem_mode,
        );
        let health = Arc::new(HealthMonitor::new(config.memory_limit));
        let bridges = BridgeRegistry::new();

        let factory = InstanceFactory::new(FactoryConfig {
            security,
            memory_limit: config.memory_limit,
            init_script: config.init_script.clone(),
            preload: None,
            warmup: None,
        });
        let pool = InstancePool::new(factory, Arc::clone(&health), config.pool.clone())?;

        {
            let bridges = Arc::clone(&bridges);
            pool.set_on_destroy(Arc::new(move |id: InstanceId| {
                bridges.forget_instance(id);
            }));
        }

        let cache = Arc::new(ChunkCache::new(config.chunk_cache_size));
        let core = Arc::new(PipelineCore {
            pool: Arc::clone(&pool),
            health: Arc::clone(&health),
            cache: Arc::clone(&cache),
            optimizer: SourceOptimizer::new(config.optimizer),
            bridges: Arc::clone(&bridges),
            counters: EngineCounters::default(),
            timeout: RwLock::new(config.timeout_limit()),
            closed: AtomicBool::new(false),
        });

        let tasks = TaskRuntime::new(
            Arc::new(CoreExecutor(Arc::clone(&core))),
            config.max_coroutines,
        );
        let channels = ChannelManager::new(config.max_channels);

        let sweeper = pool.start_sweeper();
        info!(version = env!("CARGO_PKG_VERSION"), "script engine initialized");

        Ok(Self {
            config,
            core,
            pool,
            health,
            cache,
            tasks,
            channels,
            bridges,
            sweeper: Mutex::new(Some(sweeper)),
            closed: AtomicBool::new(false),
        })
    }

    // ── Execution ────────────────────────────────────────────────────────────

    /// Runs `script` with optional named parameters and returns its value.
    pub async fn execute(
        &self,
        ctx: &ExecContext,
        script: &str,
        params: Option<Params>,
    ) -> Result<ScriptValue> {
        self.core
            .execute(ctx, "script", script, params.as_ref())
            .await
    }

    /// Like [`execute`](Self::execute) with a chunk name used in error
    /// messages and as part of the cache key.
    pub async fn execute_named(
        &self,
        ctx: &ExecContext,
        name: &str,
        script: &str,
        params: Option<Params>,
    ) -> Result<ScriptValue> {
        self.core.execute(ctx, name, script, params.as_ref()).await
    }

    /// Reads a script from disk (subject to the filesystem mode) and runs it.
    pub async fn execute_file(
        &self,
        ctx: &ExecContext,
        path: &std::path::Path,
        params: Option<Params>,
    ) -> Result<ScriptValue> {
        if self.config.filesystem_mode == FilesystemMode::None {
            return Err(EngineError::validation(
                "filesystem access is disabled by configuration",
            ));
        }
        let source = std::fs::read_to_string(path)
            .map_err(|e| EngineError::validation(format!("cannot read {}: {e}", path.display())))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        self.core
            .execute(ctx, &name, &source, params.as_ref())
            .await
    }

    // ── Bridges ──────────────────────────────────────────────────────────────

    pub fn register_bridge(&self, bridge: Arc<dyn Bridge>) -> Result<()> {
        self.bridges.register(bridge)
    }

    pub fn unregister_bridge(&self, id: &str) -> Result<()> {
        self.bridges.unregister(id)
    }

    pub fn get_bridge(&self, id: &str) -> Option<Arc<dyn Bridge>> {
        self.bridges.get(id)
    }

    pub fn list_bridges(&self) -> Vec<String> {
        self.bridges.list()
    }

    /// Async execution patterns (promise, stream, progress) over a
    /// registered bridge.
    pub fn async_bridge(&self, id: &str) -> Result<AsyncBridgeWrapper> {
        let bridge = self
            .bridges
            .get(id)
            .ok_or_else(|| EngineError::validation(format!("unknown bridge {id:?}")))?;
        Ok(AsyncBridgeWrapper::new(
            bridge,
            Arc::clone(&self.tasks),
            Arc::clone(&self.channels),
        ))
    }

    // ── Subsystem access ─────────────────────────────────────────────────────

    /// The cooperative task runtime (spawn, await, cancel).
    pub fn tasks(&self) -> &Arc<TaskRuntime> {
        &self.tasks
    }

    /// The channel manager (create, send, receive, select).
    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    // ── Limits ───────────────────────────────────────────────────────────────

    /// Advisory per-instance memory budget, applied to instances built from
    /// now on and to health scoring.
    pub fn set_memory_limit(&self, bytes: usize) {
        self.pool.set_memory_limit(bytes);
        self.health.set_advisory_memory(bytes);
    }

    /// Default per-execution deadline for callers that supply none.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.core.timeout.write() = timeout;
    }

    pub fn set_resource_limits(&self, limits: ResourceLimits) {
        if let Some(bytes) = limits.max_memory {
            self.set_memory_limit(bytes);
        }
        if let Some(timeout) = limits.max_exec_time {
            self.set_timeout(timeout);
        }
        if let Some(max) = limits.max_coroutines {
            self.tasks.set_max_coroutines(max);
        }
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            scripts_executed: self.core.counters.scripts_executed.load(Ordering::Relaxed),
            cache_hits: self.core.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.core.counters.cache_misses.load(Ordering::Relaxed),
            total_exec_time_ms: self.core.counters.total_exec_ms.load(Ordering::Relaxed),
            error_count: self.core.counters.error_count.load(Ordering::Relaxed),
            memory_used: self.health.total_memory(),
            active_coroutines: self.tasks.active_coroutine_count(),
            active_channels: self.channels.channel_count(),
            pool: self.pool.metrics(),
        }
    }

    pub fn name(&self) -> &'static str {
        "lua"
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn file_extensions(&self) -> Vec<&'static str> {
        vec!["lua"]
    }

    pub fn features(&self) -> Vec<EngineFeature> {
        vec![
            EngineFeature::Coroutines,
            EngineFeature::Modules,
            EngineFeature::Compilation,
            EngineFeature::Async,
            EngineFeature::Debugging,
        ]
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    /// Graceful shutdown: rejects new work, cancels outstanding tasks, wakes
    /// channel waiters, runs bridge cleanup, drains the pool under a
    /// deadline, and clears the cache. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("script engine shutting down");
        self.core.closed.store(true, Ordering::Release);
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }

        let grace = ExecContext::with_timeout(self.config.timeout_limit());
        let mut first_error: Option<EngineError> = None;

        if let Err(e) = self.tasks.close(&grace).await {
            first_error.get_or_insert(e);
        }
        self.channels.close();
        self.bridges.close();
        if let Err(e) = self.pool.shutdown(&grace).await {
            first_error.get_or_insert(e);
        }
        self.cache.clear();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
