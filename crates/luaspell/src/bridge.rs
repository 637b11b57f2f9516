//! Bridge registry: host capability objects exposed to scripts as modules.
//!
//! A [`Bridge`] is host code with an id, metadata, a method list, lifecycle
//! hooks, and a validate/execute pair speaking [`ScriptValue`] at both edges.
//! The registry owns the `id → bridge` map and materializes, once per
//! `(instance, bridge)`, a script-visible global table:
//!
//! ```text
//! mybridge = {
//!   _meta = { name = ..., version = ..., description = ..., ... },
//!   method1 = function(...) end,
//!   ...
//! }
//! ```
//!
//! Each callable converts its arguments through the value bridge, runs
//! validation, executes, and converts the result back; validation and
//! execution failures both raise script-level errors.
//!
//! [`AsyncBridgeWrapper`] layers non-blocking patterns (promise, stream,
//! progress, await-all, await-race) over any bridge using the task runtime
//! and the channel manager — no per-bridge special cases.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channels::ChannelManager;
use crate::context::ExecContext;
use crate::convert::{lua_to_script, script_to_lua};
use crate::error::{EngineError, Result};
use crate::tasks::{Promise, TaskRuntime};
use crate::types::ScriptValue;
use crate::vm::{InstanceId, LuaInstance};

/// Descriptive metadata surfaced to scripts in the module's `_meta` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: Option<String>,
    pub license: Option<String>,
}

/// Declared shape of one bridge method (informational).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeMethod {
    pub name: String,
    pub params: Vec<String>,
    pub returns: String,
}

/// A host capability object callable from scripts.
pub trait Bridge: Send + Sync {
    fn id(&self) -> &str;
    fn metadata(&self) -> BridgeMetadata;
    fn methods(&self) -> Vec<BridgeMethod>;

    /// Called once at registration.
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Called at unregistration and registry shutdown.
    fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Argument check run before every execution. Failures surface to the
    /// caller as validation errors and never mark the interpreter unhealthy.
    fn validate_method(&self, method: &str, args: &[ScriptValue]) -> Result<()>;

    fn execute_method(
        &self,
        ctx: &ExecContext,
        method: &str,
        args: &[ScriptValue],
    ) -> Result<ScriptValue>;
}

/// Owns registered bridges and their per-instance materializations.
pub struct BridgeRegistry {
    bridges: RwLock<HashMap<String, Arc<dyn Bridge>>>,
    materialized: Mutex<HashSet<(InstanceId, String)>>,
    closed: AtomicBool,
}

impl BridgeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bridges: RwLock::new(HashMap::new()),
            materialized: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Registers a bridge and runs its `initialize`. A failed initialize
    /// unregisters the bridge again and propagates the error.
    pub fn register(&self, bridge: Arc<dyn Bridge>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::closed("bridge registry"));
        }
        let id = bridge.id().to_string();
        if id.is_empty() {
            return Err(EngineError::validation("bridge id must not be empty"));
        }
        {
            let mut bridges = self.bridges.write();
            if bridges.contains_key(&id) {
                return Err(EngineError::validation(format!(
                    "bridge {id:?} already registered"
                )));
            }
            bridges.insert(id.clone(), Arc::clone(&bridge));
        }
        if let Err(e) = bridge.initialize() {
            self.bridges.write().remove(&id);
            return Err(e);
        }
        debug!(bridge = %id, "registered bridge");
        Ok(())
    }

    /// Removes a bridge and runs its `cleanup`.
    pub fn unregister(&self, id: &str) -> Result<()> {
        let bridge = self
            .bridges
            .write()
            .remove(id)
            .ok_or_else(|| EngineError::validation(format!("unknown bridge {id:?}")))?;
        self.materialized.lock().retain(|(_, b)| b != id);
        bridge.cleanup()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Bridge>> {
        self.bridges.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.bridges.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Materializes the script-visible module for `id` inside `instance`,
    /// once per `(instance, bridge)` — repeat calls are no-ops.
    pub fn create_lua_module(&self, instance: &LuaInstance, id: &str) -> Result<()> {
        let bridge = self
            .get(id)
            .ok_or_else(|| EngineError::validation(format!("unknown bridge {id:?}")))?;

        {
            let mut materialized = self.materialized.lock();
            if !materialized.insert((instance.id(), id.to_string())) {
                return Ok(());
            }
        }
        self.materialize(&bridge, instance, id)
    }

    /// Ensures every registered bridge is visible inside `instance`. Used at
    /// lease time: instance cleanup may have wiped modules materialized after
    /// the instance's baseline, so presence is checked against the actual
    /// global rather than the memo set.
    pub(crate) fn install_all(&self, instance: &LuaInstance) -> Result<()> {
        for id in self.list() {
            let present = instance
                .lua()
                .globals()
                .contains_key(id.as_str())
                .map_err(crate::vm::map_lua_error)?;
            if !present {
                if let Some(bridge) = self.get(&id) {
                    self.materialize(&bridge, instance, &id)?;
                    self.materialized
                        .lock()
                        .insert((instance.id(), id.clone()));
                }
            }
        }
        Ok(())
    }

    fn materialize(&self, bridge: &Arc<dyn Bridge>, instance: &LuaInstance, id: &str) -> Result<()> {
        let lua = instance.lua();
        let module = lua.create_table().map_err(crate::vm::map_lua_error)?;

        let meta = bridge.metadata();
        let meta_table = lua.create_table().map_err(crate::vm::map_lua_error)?;
        meta_table
            .set("name", meta.name.as_str())
            .and_then(|_| meta_table.set("version", meta.version.as_str()))
            .and_then(|_| meta_table.set("description", meta.description.as_str()))
            .map_err(crate::vm::map_lua_error)?;
        if let Some(author) = &meta.author {
            meta_table
                .set("author", author.as_str())
                .map_err(crate::vm::map_lua_error)?;
        }
        if let Some(license) = &meta.license {
            meta_table
                .set("license", license.as_str())
                .map_err(crate::vm::map_lua_error)?;
        }
        module
            .set("_meta", meta_table)
            .map_err(crate::vm::map_lua_error)?;

        for method in bridge.methods() {
            let bridge = Arc::clone(bridge);
            let method_name = method.name.clone();
            let callable = lua
                .create_function(move |lua, args: mlua::MultiValue| {
                    let mut sv_args = Vec::with_capacity(args.len());
                    for value in args.iter() {
                        sv_args.push(lua_to_script(value).map_err(mlua::Error::external)?);
                    }
                    bridge
                        .validate_method(&method_name, &sv_args)
                        .map_err(mlua::Error::external)?;
                    let result = bridge
                        .execute_method(&ExecContext::new(), &method_name, &sv_args)
                        .map_err(mlua::Error::external)?;
                    script_to_lua(lua, &result)
                })
                .map_err(crate::vm::map_lua_error)?;
            module
                .set(method.name.as_str(), callable)
                .map_err(crate::vm::map_lua_error)?;
        }

        lua.globals()
            .set(id, module)
            .map_err(crate::vm::map_lua_error)?;
        debug!(bridge = %id, instance = %instance.id(), "materialized bridge module");
        Ok(())
    }

    /// Drops materialization records for a destroyed instance.
    pub fn forget_instance(&self, id: InstanceId) {
        self.materialized.lock().retain(|(i, _)| *i != id);
    }

    /// Runs every bridge's `cleanup` and rejects further registration.
    /// Calling again is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let bridges: Vec<(String, Arc<dyn Bridge>)> = self
            .bridges
            .write()
            .drain()
            .collect();
        for (id, bridge) in bridges {
            if let Err(e) = bridge.cleanup() {
                warn!(bridge = %id, error = %e, "bridge cleanup failed");
            }
        }
        self.materialized.lock().clear();
    }
}

// ── Async wrapper ─────────────────────────────────────────────────────────────

/// Asynchronous execution patterns over any [`Bridge`], built on the task
/// runtime and channel manager.
pub struct AsyncBridgeWrapper {
    bridge: Arc<dyn Bridge>,
    tasks: Arc<TaskRuntime>,
    channels: Arc<ChannelManager>,
}

impl AsyncBridgeWrapper {
    pub fn new(
        bridge: Arc<dyn Bridge>,
        tasks: Arc<TaskRuntime>,
        channels: Arc<ChannelManager>,
    ) -> Self {
        Self {
            bridge,
            tasks,
            channels,
        }
    }

    /// Runs a method on a blocking thread and resolves the returned promise
    /// with its outcome.
    pub fn execute_method_async(
        &self,
        ctx: &ExecContext,
        method: &str,
        args: Vec<ScriptValue>,
    ) -> Result<Promise> {
        let promise = self.tasks.create_empty_promise(ctx);
        let id = promise.coro_id();
        let bridge = Arc::clone(&self.bridge);
        let tasks = Arc::clone(&self.tasks);
        let ctx = ctx.child();
        let method = method.to_string();
        tokio::spawn(async move {
            let outcome = run_blocking(bridge, ctx, method, args).await;
            let result = match outcome {
                Ok(value) => tasks.set_coroutine_result(id, value, None),
                Err(e) => tasks.set_coroutine_result(id, ScriptValue::Nil, Some(e)),
            };
            if let Err(e) = result {
                warn!(error = %e, "async bridge result discarded");
            }
        });
        Ok(promise)
    }

    /// Runs a method and streams its result over a fresh channel: array
    /// results element by element, anything else as a single value, errors as
    /// an error value. The channel is closed when the stream ends.
    pub fn execute_method_stream(
        &self,
        ctx: &ExecContext,
        method: &str,
        args: Vec<ScriptValue>,
    ) -> Result<Uuid> {
        let channel = self.channels.create_channel(16)?;
        let bridge = Arc::clone(&self.bridge);
        let channels = Arc::clone(&self.channels);
        let ctx = ctx.child();
        let method = method.to_string();
        tokio::spawn(async move {
            let outcome = run_blocking(bridge, ctx.clone(), method, args).await;
            let items = match outcome {
                Ok(ScriptValue::Array(items)) => items,
                Ok(value) => vec![value],
                Err(e) => vec![ScriptValue::Error(e.to_string())],
            };
            for item in items {
                if channels.send(&ctx, channel, item).await.is_err() {
                    break;
                }
            }
            let _ = channels.close_channel(channel);
        });
        Ok(channel)
    }

    /// Like [`execute_method_async`](Self::execute_method_async), with a
    /// progress channel that reports `"started"` and then `"finished"` or
    /// `"failed"` before closing.
    pub fn execute_method_async_with_progress(
        &self,
        ctx: &ExecContext,
        method: &str,
        args: Vec<ScriptValue>,
    ) -> Result<(Promise, Uuid)> {
        let progress = self.channels.create_channel(4)?;
        let promise = self.tasks.create_empty_promise(ctx);
        let id = promise.coro_id();
        let bridge = Arc::clone(&self.bridge);
        let tasks = Arc::clone(&self.tasks);
        let channels = Arc::clone(&self.channels);
        let ctx = ctx.child();
        let method = method.to_string();
        tokio::spawn(async move {
            let _ = channels
                .send(&ctx, progress, ScriptValue::String("started".into()))
                .await;
            let outcome = run_blocking(bridge, ctx.clone(), method, args).await;
            let (status, set) = match outcome {
                Ok(value) => ("finished", tasks.set_coroutine_result(id, value, None)),
                Err(e) => (
                    "failed",
                    tasks.set_coroutine_result(id, ScriptValue::Nil, Some(e)),
                ),
            };
            let _ = channels
                .send(&ctx, progress, ScriptValue::String(status.into()))
                .await;
            let _ = channels.close_channel(progress);
            if let Err(e) = set {
                warn!(error = %e, "async bridge result discarded");
            }
        });
        Ok((promise, progress))
    }

    /// Waits for every promise, preserving order. The first failure aborts
    /// the wait and propagates.
    pub async fn await_all(
        &self,
        ctx: &ExecContext,
        promises: &[Promise],
    ) -> Result<Vec<ScriptValue>> {
        let mut values = Vec::with_capacity(promises.len());
        for promise in promises {
            values.push(promise.wait(ctx).await?);
        }
        Ok(values)
    }

    /// Waits until any promise resolves and returns its index and outcome.
    pub async fn await_race(
        &self,
        ctx: &ExecContext,
        promises: &[Promise],
    ) -> Result<(usize, ScriptValue)> {
        if promises.is_empty() {
            return Err(EngineError::validation("await_race requires a promise"));
        }
        loop {
            ctx.check()?;
            for (i, promise) in promises.iter().enumerate() {
                if promise.is_resolved() {
                    return promise.wait(ctx).await.map(|v| (i, v));
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }
}

/// Runs one bridge method on the blocking thread pool.
async fn run_blocking(
    bridge: Arc<dyn Bridge>,
    ctx: ExecContext,
    method: String,
    args: Vec<ScriptValue>,
) -> Result<ScriptValue> {
    tokio::task::spawn_blocking(move || {
        bridge.validate_method(&method, &args)?;
        bridge.execute_method(&ctx, &method, &args)
    })
    .await
    .map_err(|e| EngineError::runtime(format!("bridge worker failed: {e}")))?
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::AtomicUsize;

    /// Small arithmetic bridge used across the tests.
    struct CalcBridge {
        init_calls: AtomicUsize,
        cleanup_calls: AtomicUsize,
        fail_init: bool,
    }

    impl CalcBridge {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                init_calls: AtomicUsize::new(0),
                cleanup_calls: AtomicUsize::new(0),
                fail_init: false,
            })
        }
    }

    impl Bridge for CalcBridge {
        fn id(&self) -> &str {
            "calc"
        }

        fn metadata(&self) -> BridgeMetadata {
            BridgeMetadata {
                name: "calc".into(),
                version: "1.0.0".into(),
                description: "arithmetic helpers".into(),
                author: Some("host".into()),
                license: None,
            }
        }

        fn methods(&self) -> Vec<BridgeMethod> {
            vec![BridgeMethod {
                name: "add".into(),
                params: vec!["number".into(), "number".into()],
                returns: "number".into(),
            }]
        }

        fn initialize(&self) -> Result<()> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                return Err(EngineError::runtime("init exploded"));
            }
            Ok(())
        }

        fn cleanup(&self) -> Result<()> {
            self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn validate_method(&self, method: &str, args: &[ScriptValue]) -> Result<()> {
            if method != "add" {
                return Err(EngineError::validation(format!("no method {method:?}")));
            }
            if args.len() != 2 || !args.iter().all(|a| matches!(a, ScriptValue::Number(_))) {
                return Err(EngineError::validation("add expects two numbers"));
            }
            Ok(())
        }

        fn execute_method(
            &self,
            _ctx: &ExecContext,
            _method: &str,
            args: &[ScriptValue],
        ) -> Result<ScriptValue> {
            let (ScriptValue::Number(a), ScriptValue::Number(b)) = (&args[0], &args[1]) else {
                return Err(EngineError::validation("add expects two numbers"));
            };
            Ok(ScriptValue::Number(a + b))
        }
    }

    fn sandbox_instance() -> LuaInstance {
        let mut inst = LuaInstance::new(mlua::Lua::new());
        inst.capture_baseline().unwrap();
        inst
    }

    // ── registration ──────────────────────────────────────────────────────────

    #[test]
    fn test_register_and_lookup() {
        let registry = BridgeRegistry::new();
        let bridge = CalcBridge::new();
        registry.register(bridge.clone()).unwrap();
        assert_eq!(bridge.init_calls.load(Ordering::SeqCst), 1);
        assert!(registry.get("calc").is_some());
        assert_eq!(registry.list(), vec!["calc".to_string()]);
    }

    #[test]
    fn test_register_rejects_duplicate_and_empty() {
        let registry = BridgeRegistry::new();
        registry.register(CalcBridge::new()).unwrap();
        let err = registry.register(CalcBridge::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        struct Anon;
        impl Bridge for Anon {
            fn id(&self) -> &str {
                ""
            }
            fn metadata(&self) -> BridgeMetadata {
                BridgeMetadata::default()
            }
            fn methods(&self) -> Vec<BridgeMethod> {
                vec![]
            }
            fn validate_method(&self, _: &str, _: &[ScriptValue]) -> Result<()> {
                Ok(())
            }
            fn execute_method(
                &self,
                _: &ExecContext,
                _: &str,
                _: &[ScriptValue],
            ) -> Result<ScriptValue> {
                Ok(ScriptValue::Nil)
            }
        }
        let err = registry.register(Arc::new(Anon)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_failed_initialize_unregisters() {
        let registry = BridgeRegistry::new();
        let bridge = Arc::new(CalcBridge {
            init_calls: AtomicUsize::new(0),
            cleanup_calls: AtomicUsize::new(0),
            fail_init: true,
        });
        let err = registry.register(bridge).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert!(registry.get("calc").is_none(), "failed bridge must be removed");
    }

    #[test]
    fn test_unregister_runs_cleanup() {
        let registry = BridgeRegistry::new();
        let bridge = CalcBridge::new();
        registry.register(bridge.clone()).unwrap();
        registry.unregister("calc").unwrap();
        assert_eq!(bridge.cleanup_calls.load(Ordering::SeqCst), 1);
        assert!(registry.get("calc").is_none());
        let err = registry.unregister("calc").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    // ── materialization ───────────────────────────────────────────────────────

    #[test]
    fn test_module_callable_from_script() {
        let registry = BridgeRegistry::new();
        registry.register(CalcBridge::new()).unwrap();
        let inst = sandbox_instance();
        registry.create_lua_module(&inst, "calc").unwrap();
        let v = inst.run_chunk("t", "return calc.add(2, 3)").unwrap();
        assert_eq!(v, ScriptValue::Number(5.0));
    }

    #[test]
    fn test_module_meta_table() {
        let registry = BridgeRegistry::new();
        registry.register(CalcBridge::new()).unwrap();
        let inst = sandbox_instance();
        registry.create_lua_module(&inst, "calc").unwrap();
        let v = inst.run_chunk("t", "return calc._meta.name").unwrap();
        assert_eq!(v, ScriptValue::String("calc".into()));
        let v = inst.run_chunk("t", "return calc._meta.version").unwrap();
        assert_eq!(v, ScriptValue::String("1.0.0".into()));
    }

    #[test]
    fn test_validation_failure_raises_script_error() {
        let registry = BridgeRegistry::new();
        registry.register(CalcBridge::new()).unwrap();
        let inst = sandbox_instance();
        registry.create_lua_module(&inst, "calc").unwrap();
        let err = inst.run_chunk("t", "return calc.add('x')").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert!(err.to_string().contains("two numbers"), "got: {err}");
    }

    #[test]
    fn test_materialization_memoized() {
        let registry = BridgeRegistry::new();
        registry.register(CalcBridge::new()).unwrap();
        let inst = sandbox_instance();
        registry.create_lua_module(&inst, "calc").unwrap();
        // Repeat calls are no-ops, not errors.
        registry.create_lua_module(&inst, "calc").unwrap();
        // After the instance is forgotten, materialization happens anew.
        registry.forget_instance(inst.id());
        registry.create_lua_module(&inst, "calc").unwrap();
    }

    #[test]
    fn test_unknown_bridge_module_rejected() {
        let registry = BridgeRegistry::new();
        let inst = sandbox_instance();
        let err = registry.create_lua_module(&inst, "nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_close_runs_all_cleanups() {
        let registry = BridgeRegistry::new();
        let bridge = CalcBridge::new();
        registry.register(bridge.clone()).unwrap();
        registry.close();
        registry.close(); // no-op
        assert_eq!(bridge.cleanup_calls.load(Ordering::SeqCst), 1);
        let err = registry.register(CalcBridge::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    // ── async wrapper ─────────────────────────────────────────────────────────

    struct NoScriptExecutor;
    impl crate::tasks::FragmentExecutor for NoScriptExecutor {
        fn run(
            &self,
            _ctx: ExecContext,
            _fragment: String,
            _params: Option<crate::types::Params>,
        ) -> crate::tasks::ExecFuture {
            Box::pin(async { Err(EngineError::runtime("no script execution in this test")) })
        }
    }

    fn wrapper() -> AsyncBridgeWrapper {
        AsyncBridgeWrapper::new(
            CalcBridge::new(),
            TaskRuntime::new(Arc::new(NoScriptExecutor), 8),
            ChannelManager::new(8),
        )
    }

    #[tokio::test]
    async fn test_execute_method_async() {
        let w = wrapper();
        let ctx = ExecContext::new();
        let promise = w
            .execute_method_async(
                &ctx,
                "add",
                vec![ScriptValue::Number(4.0), ScriptValue::Number(5.0)],
            )
            .unwrap();
        let v = promise.wait(&ctx).await.unwrap();
        assert_eq!(v, ScriptValue::Number(9.0));
    }

    #[tokio::test]
    async fn test_execute_method_async_propagates_validation_error() {
        let w = wrapper();
        let ctx = ExecContext::new();
        let promise = w.execute_method_async(&ctx, "add", vec![]).unwrap();
        let err = promise.wait(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_execute_method_stream_single_value() {
        let w = wrapper();
        let ctx = ExecContext::new();
        let channel = w
            .execute_method_stream(
                &ctx,
                "add",
                vec![ScriptValue::Number(1.0), ScriptValue::Number(2.0)],
            )
            .unwrap();
        let v = w.channels.receive(&ctx, channel).await.unwrap();
        assert_eq!(v, ScriptValue::Number(3.0));
        let err = w.channels.receive(&ctx, channel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Runtime, "stream must close after end");
    }

    #[tokio::test]
    async fn test_async_with_progress_reports_lifecycle() {
        let w = wrapper();
        let ctx = ExecContext::new();
        let (promise, progress) = w
            .execute_method_async_with_progress(
                &ctx,
                "add",
                vec![ScriptValue::Number(1.0), ScriptValue::Number(1.0)],
            )
            .unwrap();
        assert_eq!(
            w.channels.receive(&ctx, progress).await.unwrap(),
            ScriptValue::String("started".into())
        );
        assert_eq!(
            w.channels.receive(&ctx, progress).await.unwrap(),
            ScriptValue::String("finished".into())
        );
        assert_eq!(promise.wait(&ctx).await.unwrap(), ScriptValue::Number(2.0));
    }

    #[tokio::test]
    async fn test_await_all_preserves_order() {
        let w = wrapper();
        let ctx = ExecContext::new();
        let promises: Vec<Promise> = (0..3)
            .map(|i| {
                w.execute_method_async(
                    &ctx,
                    "add",
                    vec![ScriptValue::Number(i as f64), ScriptValue::Number(0.0)],
                )
                .unwrap()
            })
            .collect();
        let values = w.await_all(&ctx, &promises).await.unwrap();
        assert_eq!(
            values,
            vec![
                ScriptValue::Number(0.0),
                ScriptValue::Number(1.0),
                ScriptValue::Number(2.0)
            ]
        );
    }

    #[tokio::test]
    async fn test_await_race_returns_a_real_index() {
        let w = wrapper();
        let ctx = ExecContext::new();
        let promises: Vec<Promise> = (0..3)
            .map(|i| {
                w.execute_method_async(
                    &ctx,
                    "add",
                    vec![ScriptValue::Number(i as f64), ScriptValue::Number(10.0)],
                )
                .unwrap()
            })
            .collect();
        let (index, value) = w.await_race(&ctx, &promises).await.unwrap();
        assert!(index < 3);
        match value {
            ScriptValue::Number(n) => assert!((10.0..13.0).contains(&n)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
