//! Interpreter pool: caches, leases, returns, recycles, abandons, and shuts
//! down instances.
//!
//! ## Design
//!
//! The pool owns every instance that is not currently leased. A lease moves
//! the instance out by value, so exclusive ownership — not a lock — is what
//! keeps "at most one executor per instance" true. State lives in one mutex:
//!
//! - `idle`: instances ready to lease, picked highest-health-score first;
//! - `inflight`: identities of leased instances;
//! - `abandoned`: identities whose lease was given up on (hung script); the
//!   instance is destroyed whenever its runaway execution finally returns it;
//! - `building`: in-progress constructions, counted against `max_size` so
//!   concurrent `get`s cannot overshoot the ceiling.
//!
//! Abandonment removes the identity from `inflight` immediately: the still
//! running script keeps its instance alive on its own thread, is never
//! interfered with, and its eventual return is discarded with a debug log.
//! This mirrors how a worker that misses its response deadline simply drops
//! the result and moves on.
//!
//! ## Return policy
//!
//! On `put`, a draining pool or a sub-threshold health score recycles the
//! instance. A damaged instance is recycled immediately only when
//! `recycle_damaged_on_return` is set; the default is a best-effort clean,
//! leaving the health score to decide at the next lease.
//!
//! A background sweep evicts instances idle past `idle_timeout` while keeping
//! the live count at or above `min_size`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::context::ExecContext;
use crate::error::{EngineError, Result};
use crate::factory::InstanceFactory;
use crate::health::HealthMonitor;
use crate::types::PoolMetrics;
use crate::vm::{InstanceId, LuaInstance};

struct IdleEntry {
    instance: LuaInstance,
    last_used: Instant,
}

struct InflightEntry {
    #[allow(dead_code)]
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleEntry>,
    inflight: HashMap<InstanceId, InflightEntry>,
    abandoned: HashSet<InstanceId>,
    building: usize,
    draining: bool,
}

impl PoolState {
    fn live_count(&self) -> usize {
        self.idle.len() + self.inflight.len() + self.building
    }
}

/// Pool of sandboxed interpreter instances.
pub struct InstancePool {
    state: Mutex<PoolState>,
    /// Notified when an instance is returned or capacity frees up.
    available: Notify,
    /// Notified when the inflight set shrinks; shutdown waits on this.
    inflight_drained: Notify,
    factory: InstanceFactory,
    health: Arc<HealthMonitor>,
    config: PoolConfig,
    total_created: AtomicU64,
    total_recycled: AtomicU64,
    closed: AtomicBool,
    /// Observers of instance destruction (bridge registry drops its
    /// per-instance state here). The monitor is notified directly.
    on_destroy: Mutex<Option<Arc<dyn Fn(InstanceId) + Send + Sync>>>,
}

impl InstancePool {
    /// Creates the pool and pre-warms `min_size` instances. Fails if any of
    /// the initial builds fail.
    pub fn new(
        factory: InstanceFactory,
        health: Arc<HealthMonitor>,
        config: PoolConfig,
    ) -> Result<Arc<Self>> {
        let pool = Arc::new(Self {
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            inflight_drained: Notify::new(),
            factory,
            health,
            config,
            total_created: AtomicU64::new(0),
            total_recycled: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            on_destroy: Mutex::new(None),
        });

        for _ in 0..pool.config.min_size {
            let instance = pool.factory.build()?;
            pool.total_created.fetch_add(1, Ordering::Relaxed);
            pool.health.register(instance.id());
            pool.state.lock().idle.push(IdleEntry {
                instance,
                last_used: Instant::now(),
            });
        }
        info!(
            min = pool.config.min_size,
            max = pool.config.max_size,
            "interpreter pool ready"
        );
        Ok(pool)
    }

    /// Spawns the periodic idle-eviction sweep. The task stops on its own
    /// once the pool is closed.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.cleanup_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if pool.closed.load(Ordering::Acquire) {
                    break;
                }
                pool.sweep();
            }
        })
    }

    /// Leases an instance: healthiest idle first, a fresh build when below
    /// the ceiling, otherwise blocks until one frees up or `ctx` fires.
    pub async fn get(&self, ctx: &ExecContext) -> Result<LuaInstance> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(EngineError::closed("interpreter pool"));
            }
            ctx.check()?;

            // The wakeup future must exist before the state check so a `put`
            // racing between unlock and await still wakes us.
            let available = self.available.notified();

            let mut build_slot = false;
            {
                let mut state = self.state.lock();
                if !state.draining {
                    if let Some(best) = self.best_idle_index(&state) {
                        let entry = state.idle.swap_remove(best);
                        let id = entry.instance.id();
                        state.inflight.insert(
                            id,
                            InflightEntry {
                                since: Instant::now(),
                            },
                        );
                        self.health.set_last_used(id);
                        return Ok(entry.instance);
                    }
                    if state.live_count() < self.config.max_size {
                        state.building += 1;
                        build_slot = true;
                    }
                }
            }

            if build_slot {
                return self.build_for_lease();
            }

            ctx.run_until(available).await?;
        }
    }

    /// Returns a leased instance. Evaluates health and policy, then either
    /// cleans the instance back into the idle set or recycles it.
    pub fn put(&self, instance: LuaInstance) {
        let id = instance.id();
        {
            let mut state = self.state.lock();
            if state.abandoned.remove(&id) {
                // Runaway execution finished after we gave up on it. Its
                // recycle was accounted at abandon time; just destroy.
                drop(state);
                debug!(instance = %id, "discarding instance returned after abandonment");
                drop(instance);
                return;
            }
            if state.inflight.remove(&id).is_none() {
                drop(state);
                warn!(instance = %id, "put of unknown instance ignored");
                drop(instance);
                return;
            }
        }
        self.inflight_drained.notify_waiters();

        let draining = self.closed.load(Ordering::Acquire) || self.state.lock().draining;
        let mut recycle = draining
            || (instance.is_broken() && self.config.recycle_damaged_on_return)
            || self
                .health
                .should_recycle(id, self.config.health_threshold);

        let mut instance = instance;
        if !recycle {
            // Clean between leases: the next lessee must not see this
            // script's globals. A failed clean means the instance is not
            // trustworthy.
            if let Err(e) = instance.reset_globals() {
                warn!(instance = %id, error = %e, "cleanup failed, recycling");
                instance.mark_broken();
                recycle = true;
            }
        }

        if recycle {
            self.destroy(instance);
        } else {
            self.state.lock().idle.push(IdleEntry {
                instance,
                last_used: Instant::now(),
            });
        }
        self.available.notify_one();
    }

    /// Gives up on an in-use instance whose script has not yielded. Removes
    /// it from the pool immediately; the still-running script finishes on its
    /// own and the instance is destroyed when it comes back. Idempotent, and
    /// a no-op for unknown identities.
    pub fn abandon(&self, id: InstanceId) {
        let mut state = self.state.lock();
        if state.inflight.remove(&id).is_none() {
            return;
        }
        state.abandoned.insert(id);
        drop(state);

        self.total_recycled.fetch_add(1, Ordering::Relaxed);
        self.health.cleanup_state(id);
        self.notify_destroyed(id);
        self.inflight_drained.notify_waiters();
        // Live count dropped below the ceiling; a waiter may build afresh.
        self.available.notify_one();
        debug!(instance = %id, "abandoned in-flight instance");
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = self.state.lock();
        PoolMetrics {
            total_created: self.total_created.load(Ordering::Relaxed),
            total_recycled: self.total_recycled.load(Ordering::Relaxed),
            available: state.idle.len(),
            in_use: state.inflight.len(),
        }
    }

    /// Stops new leases, destroys idle instances, and waits for in-flight
    /// leases to come home until `ctx` fires. Idle instances are closed even
    /// when the wait times out. Calling again is a no-op.
    pub async fn shutdown(&self, ctx: &ExecContext) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("interpreter pool shutting down");

        let idle = {
            let mut state = self.state.lock();
            state.draining = true;
            std::mem::take(&mut state.idle)
        };
        for entry in idle {
            self.destroy(entry.instance);
        }
        // Wake blocked getters so they observe the closed flag.
        self.available.notify_waiters();

        loop {
            let drained = self.inflight_drained.notified();
            if self.state.lock().inflight.is_empty() {
                return Ok(());
            }
            ctx.run_until(drained).await?;
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn best_idle_index(&self, state: &PoolState) -> Option<usize> {
        state
            .idle
            .iter()
            .enumerate()
            .map(|(i, e)| (i, self.health.score(e.instance.id())))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }

    /// Builds a new instance against a reserved `building` slot and leases it
    /// directly to the caller.
    fn build_for_lease(&self) -> Result<LuaInstance> {
        let built = self.factory.build();
        let mut state = self.state.lock();
        state.building -= 1;
        match built {
            Ok(instance) => {
                let id = instance.id();
                self.total_created.fetch_add(1, Ordering::Relaxed);
                self.health.register(id);
                state.inflight.insert(
                    id,
                    InflightEntry {
                        since: Instant::now(),
                    },
                );
                Ok(instance)
            }
            Err(e) => {
                drop(state);
                // The reserved capacity is free again.
                self.available.notify_one();
                warn!(error = %e, "instance construction failed");
                Err(e)
            }
        }
    }

    /// Changes the allocator budget applied to instances built from now on.
    pub fn set_memory_limit(&self, bytes: usize) {
        self.factory.set_memory_limit(bytes);
    }

    /// Registers an observer called with the identity of every destroyed or
    /// abandoned instance.
    pub fn set_on_destroy(&self, callback: Arc<dyn Fn(InstanceId) + Send + Sync>) {
        *self.on_destroy.lock() = Some(callback);
    }

    fn notify_destroyed(&self, id: InstanceId) {
        let callback = self.on_destroy.lock().clone();
        if let Some(callback) = callback {
            callback(id);
        }
    }

    fn destroy(&self, instance: LuaInstance) {
        let id = instance.id();
        drop(instance);
        self.health.cleanup_state(id);
        self.notify_destroyed(id);
        self.total_recycled.fetch_add(1, Ordering::Relaxed);
        debug!(instance = %id, "recycled instance");
    }

    /// One idle-eviction pass. Evicts entries idle past `idle_timeout` while
    /// keeping the live count at or above `min_size`.
    pub(crate) fn sweep(&self) {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            let mut live = state.live_count();
            let mut i = 0;
            while i < state.idle.len() {
                if live <= self.config.min_size {
                    break;
                }
                if now.duration_since(state.idle[i].last_used) > self.config.idle_timeout() {
                    evicted.push(state.idle.swap_remove(i).instance);
                    live -= 1;
                } else {
                    i += 1;
                }
            }
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicting idle instances");
            for instance in evicted {
                self.destroy(instance);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
