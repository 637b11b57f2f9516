//! Interpreter instance lifecycle.
//!
//! This module owns all direct VM API calls. [`LuaInstance`] wraps one
//! sandboxed `mlua::Lua` together with:
//! - a shared interrupt flag checked by an instruction-count hook, which is
//!   how cooperative cancellation reaches a running script;
//! - the baseline global set captured after construction, used to reset
//!   script-introduced globals between leases (a leased instance must look
//!   clean to the next lessee);
//! - structured error extraction (syntax vs runtime vs interrupt).
//!
//! ## Cancellation strategy
//!
//! The hook runs every [`HOOK_GRANULARITY`] VM instructions and raises a
//! typed interrupt error when the interrupt flag is set. A script stuck in a
//! native call never reaches the hook; the pipeline's bounded grace wait
//! covers that case by abandoning the instance instead.
//!
//! An instance is driven by at most one host thread at a time: the pool
//! leases it by value and takes it back by value, so exclusive ownership is
//! the synchronization.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use mlua::{HookTriggers, Lua, Value, VmState};
use uuid::Uuid;

use crate::convert::lua_to_script;
use crate::error::{EngineError, Result};
use crate::types::{Params, ScriptValue};

/// Instructions between interrupt-flag checks. Low enough that a busy loop
/// observes cancellation within microseconds, high enough to stay invisible
/// in benchmarks.
const HOOK_GRANULARITY: u32 = 4096;

/// The error raised by the interrupt hook. A private type matched by
/// downcast: scripts control their own error text, so recognition must never
/// depend on message contents — `error('...')` with any message stays an
/// ordinary runtime error.
#[derive(Debug, Clone, Copy)]
struct InterruptError(InterruptKind);

impl std::fmt::Display for InterruptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            InterruptKind::Cancel => write!(f, "execution cancelled"),
            InterruptKind::Deadline => write!(f, "execution deadline exceeded"),
        }
    }
}

impl std::error::Error for InterruptError {}

// ── Instance identity ─────────────────────────────────────────────────────────

/// Opaque identity of one interpreter instance. Stable across the instance's
/// lifetime; used as the key in the pool, health monitor, and bridge
/// materialization maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(Uuid);

impl InstanceId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ── Interrupt flag ────────────────────────────────────────────────────────────

const INTERRUPT_CLEAR: u8 = 0;
const INTERRUPT_CANCEL: u8 = 1;
const INTERRUPT_DEADLINE: u8 = 2;

/// What an interrupt request was for; determines which canonical error the
/// script observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InterruptKind {
    Cancel,
    Deadline,
}

/// Cheaply cloneable handle to an instance's interrupt flag. The pipeline
/// holds one while the instance itself is inside a blocking run.
#[derive(Debug, Clone)]
pub(crate) struct InterruptHandle {
    state: Arc<AtomicU8>,
}

impl InterruptHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(INTERRUPT_CLEAR)),
        }
    }

    pub(crate) fn request(&self, kind: InterruptKind) {
        let value = match kind {
            InterruptKind::Cancel => INTERRUPT_CANCEL,
            InterruptKind::Deadline => INTERRUPT_DEADLINE,
        };
        // First request wins; a later deadline must not overwrite an
        // explicit cancel (or vice versa).
        let _ = self.state.compare_exchange(
            INTERRUPT_CLEAR,
            value,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn clear(&self) {
        self.state.store(INTERRUPT_CLEAR, Ordering::Release);
    }

    fn load(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }
}

// ── LuaInstance ───────────────────────────────────────────────────────────────

/// One isolated, sandboxed interpreter. Built by the factory; owned by the
/// pool while idle; leased exclusively to one caller at a time.
#[derive(Debug)]
pub struct LuaInstance {
    id: InstanceId,
    lua: Lua,
    interrupt: InterruptHandle,
    baseline_globals: HashSet<String>,
    broken: bool,
}

impl LuaInstance {
    /// Wraps a freshly configured VM. The factory installs the interrupt hook
    /// here so every instance carries it from birth.
    pub(crate) fn new(lua: Lua) -> Self {
        let interrupt = InterruptHandle::new();
        let hook_flag = interrupt.clone();
        let _ = lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_GRANULARITY),
            move |_lua, _debug| match hook_flag.load() {
                INTERRUPT_CANCEL => Err(mlua::Error::external(InterruptError(
                    InterruptKind::Cancel,
                ))),
                INTERRUPT_DEADLINE => Err(mlua::Error::external(InterruptError(
                    InterruptKind::Deadline,
                ))),
                _ => Ok(VmState::Continue),
            },
        );
        Self {
            id: InstanceId::new(),
            lua,
            interrupt,
            baseline_globals: HashSet::new(),
            broken: false,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub(crate) fn lua(&self) -> &Lua {
        &self.lua
    }

    pub(crate) fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Bytes currently allocated by this instance's VM.
    pub fn used_memory(&self) -> usize {
        self.lua.used_memory()
    }

    /// Marks the instance as damaged; the pool decides what to do with it on
    /// return based on policy.
    pub(crate) fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken
    }

    // ── Baseline capture and reset ───────────────────────────────────────────

    /// Records the current global names. Called once by the factory after
    /// linking, preload, and init script — everything present now is part of
    /// the instance's permanent environment.
    pub(crate) fn capture_baseline(&mut self) -> Result<()> {
        let mut baseline = HashSet::new();
        for entry in self.lua.globals().pairs::<Value, Value>() {
            let (k, _) = entry.map_err(map_lua_error)?;
            if let Value::String(s) = k {
                baseline.insert(s.to_string_lossy().to_string());
            }
        }
        self.baseline_globals = baseline;
        Ok(())
    }

    /// Removes every string-keyed global not present at baseline capture.
    /// This is the cleanup step between leases: the next lessee must not see
    /// the previous script's globals.
    pub(crate) fn reset_globals(&self) -> Result<()> {
        let globals = self.lua.globals();
        let mut to_remove: Vec<String> = Vec::new();
        for entry in globals.pairs::<Value, Value>() {
            let (k, _) = entry.map_err(map_lua_error)?;
            if let Value::String(s) = k {
                let name = s.to_string_lossy().to_string();
                if !self.baseline_globals.contains(&name) {
                    to_remove.push(name);
                }
            }
        }
        for name in to_remove {
            globals
                .set(name.as_str(), Value::Nil)
                .map_err(map_lua_error)?;
        }
        Ok(())
    }

    // ── Execution ────────────────────────────────────────────────────────────

    /// Installs named parameters into the global scope.
    pub(crate) fn install_params(&self, params: &Params) -> Result<()> {
        let globals = self.lua.globals();
        for (name, value) in params {
            let lua_value =
                crate::convert::script_to_lua(&self.lua, value).map_err(map_lua_error)?;
            globals.set(name.as_str(), lua_value).map_err(map_lua_error)?;
        }
        Ok(())
    }

    /// Compiles and runs `source` under `name`, returning the chunk's return
    /// value as a [`ScriptValue`] (`Nil` when the chunk returns nothing).
    ///
    /// Parse failures map to syntax errors; script faults map to runtime
    /// errors; interrupt-hook sentinels map to the canonical cancelled and
    /// timeout kinds.
    pub(crate) fn run_chunk(&self, name: &str, source: &str) -> Result<ScriptValue> {
        self.interrupt.clear();
        let value = self
            .lua
            .load(source)
            .set_name(name)
            .eval::<Value>()
            .map_err(map_lua_error)?;
        lua_to_script(&value)
    }

    /// Runs `source` for its side effects only (init scripts, warmup).
    pub(crate) fn exec(&self, name: &str, source: &str) -> Result<()> {
        self.lua
            .load(source)
            .set_name(name)
            .exec()
            .map_err(map_lua_error)
    }
}

// ── Error mapping ─────────────────────────────────────────────────────────────

/// Maps an interpreter error into the engine taxonomy, unwrapping callback
/// layers. The interrupt hook's error is recognized by downcasting to the
/// private [`InterruptError`] type — message text, which scripts control, is
/// never consulted.
pub(crate) fn map_lua_error(err: mlua::Error) -> EngineError {
    if let Some(kind) = interrupt_kind(&err) {
        return match kind {
            InterruptKind::Cancel => EngineError::Cancelled,
            // The pipeline rewrites the limit from its context; 0 means the
            // vm layer could not know it.
            InterruptKind::Deadline => EngineError::Timeout { limit_ms: 0 },
        };
    }
    match err {
        mlua::Error::SyntaxError { message, .. } => {
            let line = parse_error_line(&message);
            EngineError::Syntax { message, line }
        }
        mlua::Error::RuntimeError(message) => EngineError::Runtime {
            message,
            traceback: String::new(),
        },
        mlua::Error::MemoryError(message) => EngineError::Runtime {
            message: format!("memory limit exceeded: {message}"),
            traceback: String::new(),
        },
        mlua::Error::CallbackError { traceback, cause } => {
            let inner = match Arc::try_unwrap(cause) {
                Ok(inner) => map_lua_error(inner),
                Err(shared) => EngineError::Runtime {
                    message: shared.to_string(),
                    traceback: String::new(),
                },
            };
            match inner {
                EngineError::Runtime { message, .. } => EngineError::Runtime { message, traceback },
                other => other,
            }
        }
        other => EngineError::Runtime {
            message: other.to_string(),
            traceback: String::new(),
        },
    }
}

/// Walks the error chain looking for the hook's [`InterruptError`].
fn interrupt_kind(err: &mlua::Error) -> Option<InterruptKind> {
    match err {
        mlua::Error::ExternalError(cause) => {
            cause.downcast_ref::<InterruptError>().map(|e| e.0)
        }
        mlua::Error::CallbackError { cause, .. } => interrupt_kind(cause),
        _ => None,
    }
}

/// Pulls the 1-based line number out of a standard `name:line: message`
/// interpreter error, 0 if absent.
fn parse_error_line(message: &str) -> u32 {
    let mut parts = message.split(':');
    // Skip the chunk name; scan for the first segment that parses as a line.
    parts.next();
    for part in parts {
        if let Ok(line) = part.trim().parse::<u32>() {
            return line;
        }
    }
    0
}
