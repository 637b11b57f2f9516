//! Cooperative task runtime: spawn, await, cancel, and harvest script-level
//! tasks without blocking the host or starving the pool.
//!
//! A spawned task runs a script fragment through a [`FragmentExecutor`] — in
//! production that is the execution pipeline, which leases the task its own
//! pooled instance, so no instance is ever driven by two execution units at
//! once. The runtime itself only manages handles, the active-count cap, and
//! resolution.
//!
//! ## Resolution
//!
//! A handle resolves exactly once: pending → resolved or pending → cancelled,
//! never backwards. The outcome slot's lock is the synchronization point —
//! the first writer to find the handle pending wins, later writers are
//! silent no-ops. All current and future awaiters observe the same outcome;
//! awaiting an already-resolved handle returns immediately.
//!
//! ## Cancellation
//!
//! `Promise::cancel` resolves the handle as cancelled *and* cancels the
//! context the fragment runs under; the running script observes that at its
//! next yield point (and a non-cooperative script is abandoned by the pool).
//! A task whose spawn context expires resolves with the deadline error — the
//! two outcomes stay distinguishable all the way to the awaiter.
//!
//! The active-count cap applies to spawned tasks only; empty promises are
//! storage and do not count.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::context::ExecContext;
use crate::error::{EngineError, ErrorKind, Result};
use crate::types::{Params, ScriptValue};

/// Boxed future returned by fragment executors.
pub type ExecFuture = Pin<Box<dyn Future<Output = Result<ScriptValue>> + Send + 'static>>;

/// Runs one script fragment to completion. Implemented by the execution
/// pipeline; abstract here so the runtime does not depend on it.
pub trait FragmentExecutor: Send + Sync {
    fn run(&self, ctx: ExecContext, fragment: String, params: Option<Params>) -> ExecFuture;
}

// ── Task handle ───────────────────────────────────────────────────────────────

const STATE_PENDING: u8 = 0;
const STATE_RESOLVED: u8 = 1;
const STATE_CANCELLED: u8 = 2;

/// Shared state of one task. Addressed by id through the runtime or held
/// directly inside a [`Promise`].
pub struct TaskHandle {
    id: Uuid,
    state: AtomicU8,
    outcome: Mutex<Option<Result<ScriptValue>>>,
    done: Notify,
    /// Context the fragment runs under; cancelling it is how `cancel`
    /// reaches the running script.
    run_ctx: ExecContext,
    /// Whether a spawned task backs this handle (empty promises are not
    /// counted as active).
    backed: bool,
}

impl TaskHandle {
    fn new(run_ctx: ExecContext, backed: bool) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            state: AtomicU8::new(STATE_PENDING),
            outcome: Mutex::new(None),
            done: Notify::new(),
            run_ctx,
            backed,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_resolved(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_PENDING
    }

    fn is_pending(&self) -> bool {
        !self.is_resolved()
    }

    /// First caller wins; later calls are no-ops returning false.
    fn resolve(&self, outcome: Result<ScriptValue>, to_state: u8) -> bool {
        let mut slot = self.outcome.lock();
        if self.state.load(Ordering::Acquire) != STATE_PENDING {
            return false;
        }
        *slot = Some(outcome);
        self.state.store(to_state, Ordering::Release);
        drop(slot);
        self.done.notify_waiters();
        true
    }

    fn cancel(&self) {
        self.run_ctx.cancel();
        self.resolve(Err(EngineError::Cancelled), STATE_CANCELLED);
    }

    /// Blocks until resolution or `ctx` fires. Post-resolution calls return
    /// the cached outcome immediately.
    async fn wait(&self, ctx: &ExecContext) -> Result<ScriptValue> {
        loop {
            let done = self.done.notified();
            if self.is_resolved() {
                let slot = self.outcome.lock();
                return slot
                    .clone()
                    .unwrap_or(Err(EngineError::runtime("resolved task lost its outcome")));
            }
            ctx.run_until(done).await?;
        }
    }
}

/// Caller-facing handle with await/cancel semantics.
#[derive(Clone)]
pub struct Promise {
    handle: Arc<TaskHandle>,
}

impl Promise {
    pub fn coro_id(&self) -> Uuid {
        self.handle.id()
    }

    pub fn is_resolved(&self) -> bool {
        self.handle.is_resolved()
    }

    /// Waits for the result. Every successful await of the same promise
    /// observes the same value.
    pub async fn wait(&self, ctx: &ExecContext) -> Result<ScriptValue> {
        self.handle.wait(ctx).await
    }

    /// Cancels the task: current and future awaiters wake with the canonical
    /// cancellation error, and the running fragment's context is cancelled.
    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

// ── Runtime ───────────────────────────────────────────────────────────────────

/// Owns all task handles and enforces the concurrency cap.
pub struct TaskRuntime {
    handles: RwLock<HashMap<Uuid, Arc<TaskHandle>>>,
    executor: Arc<dyn FragmentExecutor>,
    active: AtomicUsize,
    max_coroutines: AtomicUsize,
    closed: AtomicBool,
    /// Notified on every active-count decrement; close waits on it.
    settled: Notify,
}

impl TaskRuntime {
    pub fn new(executor: Arc<dyn FragmentExecutor>, max_coroutines: usize) -> Arc<Self> {
        Arc::new(Self {
            handles: RwLock::new(HashMap::new()),
            executor,
            active: AtomicUsize::new(0),
            max_coroutines: AtomicUsize::new(max_coroutines.max(1)),
            closed: AtomicBool::new(false),
            settled: Notify::new(),
        })
    }

    /// Adjusts the cap at runtime. Running tasks are unaffected; the new cap
    /// applies to subsequent spawns.
    pub fn set_max_coroutines(&self, max: usize) {
        self.max_coroutines.store(max.max(1), Ordering::Release);
    }

    /// Schedules `fragment` on its own execution unit and returns its id
    /// immediately. Fails once the runtime is closed or the active cap is hit.
    pub fn spawn_coroutine(
        self: &Arc<Self>,
        ctx: &ExecContext,
        fragment: impl Into<String>,
        params: Option<Params>,
    ) -> Result<Uuid> {
        let promise = self.create_promise(ctx, fragment, params)?;
        Ok(promise.coro_id())
    }

    /// Spawns a fragment wrapped in a [`Promise`].
    pub fn create_promise(
        self: &Arc<Self>,
        ctx: &ExecContext,
        fragment: impl Into<String>,
        params: Option<Params>,
    ) -> Result<Promise> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::closed("task runtime"));
        }

        // Reserve an active slot; back off if the cap is hit.
        let cap = self.max_coroutines.load(Ordering::Acquire);
        let prev = self.active.fetch_add(1, Ordering::AcqRel);
        if prev >= cap {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Err(EngineError::resource(format!(
                "max coroutines exceeded (cap {cap})"
            )));
        }

        let run_ctx = ctx.child();
        let handle = TaskHandle::new(run_ctx.clone(), true);
        let id = handle.id();
        self.handles.write().insert(id, Arc::clone(&handle));

        let runtime = Arc::clone(self);
        let executor = Arc::clone(&self.executor);
        let fragment = fragment.into();
        let spawned_handle = Arc::clone(&handle);
        tokio::spawn(async move {
            let outcome = executor.run(run_ctx, fragment, params).await;
            // Decrement before the handle becomes observable as resolved, so
            // the cap frees up no later than the awaiter wakes.
            runtime.active.fetch_sub(1, Ordering::AcqRel);
            runtime.settled.notify_waiters();
            let to_state = match &outcome {
                Err(e) if e.kind() == ErrorKind::Cancelled => STATE_CANCELLED,
                _ => STATE_RESOLVED,
            };
            if !spawned_handle.resolve(outcome, to_state) {
                debug!(coro = %id, "task finished after external resolution");
            }
        });

        Ok(Promise { handle })
    }

    /// Creates a storage-only promise resolved later via
    /// [`set_coroutine_result`](Self::set_coroutine_result). Not counted
    /// against the coroutine cap.
    pub fn create_empty_promise(&self, ctx: &ExecContext) -> Promise {
        let handle = TaskHandle::new(ctx.child(), false);
        self.handles.write().insert(handle.id(), Arc::clone(&handle));
        Promise { handle }
    }

    /// Resolves a promise externally. First call wins; later calls are
    /// accepted no-ops.
    pub fn set_coroutine_result(
        &self,
        id: Uuid,
        value: ScriptValue,
        error: Option<EngineError>,
    ) -> Result<()> {
        let handle = self
            .handles
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::validation(format!("unknown coroutine {id}")))?;
        let outcome = match error {
            Some(e) => Err(e),
            None => Ok(value),
        };
        handle.resolve(outcome, STATE_RESOLVED);
        Ok(())
    }

    /// Blocks until the task resolves, is cancelled, or `ctx` fires.
    /// Subsequent waits on the same id return the cached outcome.
    pub async fn wait_for_coroutine(&self, ctx: &ExecContext, id: Uuid) -> Result<ScriptValue> {
        let handle = self
            .handles
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::validation(format!("unknown coroutine {id}")))?;
        handle.wait(ctx).await
    }

    /// True while a spawned task backing `id` has not resolved.
    pub fn is_coroutine_active(&self, id: Uuid) -> bool {
        self.handles
            .read()
            .get(&id)
            .map(|h| h.backed && h.is_pending())
            .unwrap_or(false)
    }

    pub fn active_coroutine_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Rejects further spawns, cancels everything pending, and waits for
    /// outstanding tasks to observe their cancellation or for `ctx` to fire.
    /// Calling again is a no-op.
    pub async fn close(&self, ctx: &ExecContext) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let pending: Vec<Arc<TaskHandle>> = self
            .handles
            .read()
            .values()
            .filter(|h| h.is_pending())
            .cloned()
            .collect();
        for handle in pending {
            handle.cancel();
        }
        loop {
            let settled = self.settled.notified();
            if self.active.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            ctx.run_until(settled).await?;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
