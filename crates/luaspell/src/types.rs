//! Boundary types for the luaspell library.
//!
//! [`ScriptValue`] is the tagged union every value crosses the host↔script
//! boundary as. Parameters go in as `ScriptValue`, results come out as
//! `ScriptValue`, and bridge methods speak nothing else. Conversions to and
//! from native host values (`serde_json::Value`) live here; conversions to and
//! from interpreter values live in `convert`.
//!
//! Also defined here: the engine metrics snapshots and the advertised feature
//! set.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Named parameters installed into a script's global scope before execution.
pub type Params = BTreeMap<String, ScriptValue>;

/// The tagged union used for all host↔script data exchange.
///
/// Numbers are `f64`; integers crossing the boundary widen to floats (the
/// embedded language's integer subtype is preserved opportunistically on the
/// way in, see `convert`). Tables with consecutive `1..N` integer keys map to
/// `Array`; all other tables map to `Object` with stringified keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScriptValue {
    Nil,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<ScriptValue>),
    Object(BTreeMap<String, ScriptValue>),
    /// A script-level error captured as a value.
    Error(String),
    /// Reference to a channel owned by the channel manager.
    Channel(Uuid),
}

impl ScriptValue {
    /// Human-readable name of this value's tag, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Nil => "nil",
            ScriptValue::Bool(_) => "bool",
            ScriptValue::Number(_) => "number",
            ScriptValue::String(_) => "string",
            ScriptValue::Array(_) => "array",
            ScriptValue::Object(_) => "object",
            ScriptValue::Error(_) => "error",
            ScriptValue::Channel(_) => "channel",
        }
    }
}

// ── Native (JSON) conversions ─────────────────────────────────────────────────

/// Converts a native host value into a [`ScriptValue`].
///
/// All JSON numbers become `Number` (integers widen to `f64`). Objects become
/// `Object` with their key order normalized.
pub fn from_native(value: serde_json::Value) -> ScriptValue {
    match value {
        serde_json::Value::Null => ScriptValue::Nil,
        serde_json::Value::Bool(b) => ScriptValue::Bool(b),
        serde_json::Value::Number(n) => ScriptValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => ScriptValue::String(s),
        serde_json::Value::Array(items) => {
            ScriptValue::Array(items.into_iter().map(from_native).collect())
        }
        serde_json::Value::Object(map) => ScriptValue::Object(
            map.into_iter().map(|(k, v)| (k, from_native(v))).collect(),
        ),
    }
}

/// Converts a [`ScriptValue`] back into a native host value.
///
/// `Error` and `Channel` have no JSON representation and fail with a
/// validation error; everything else round-trips structurally.
pub fn to_native(value: &ScriptValue) -> Result<serde_json::Value> {
    Ok(match value {
        ScriptValue::Nil => serde_json::Value::Null,
        ScriptValue::Bool(b) => serde_json::Value::Bool(*b),
        ScriptValue::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ScriptValue::String(s) => serde_json::Value::String(s.clone()),
        ScriptValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(to_native(item)?);
            }
            serde_json::Value::Array(out)
        }
        ScriptValue::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), to_native(v)?);
            }
            serde_json::Value::Object(out)
        }
        ScriptValue::Error(_) | ScriptValue::Channel(_) => {
            return Err(EngineError::validation(format!(
                "{} values are not representable as native values",
                value.type_name()
            )))
        }
    })
}

// ── Metrics snapshots ─────────────────────────────────────────────────────────

/// Point-in-time view of the interpreter pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub total_created: u64,
    pub total_recycled: u64,
    pub available: usize,
    pub in_use: usize,
}

/// Point-in-time view of the whole engine, serializable for scraping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub scripts_executed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub total_exec_time_ms: u64,
    pub error_count: u64,
    /// Bytes currently held by live interpreter instances, summed.
    pub memory_used: usize,
    pub active_coroutines: usize,
    pub active_channels: usize,
    pub pool: PoolMetrics,
}

/// Capabilities advertised by [`crate::engine::ScriptEngine::features`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineFeature {
    Coroutines,
    Modules,
    Compilation,
    Async,
    Debugging,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── from_native / to_native round-trip ───────────────────────────────────

    #[test]
    fn test_from_native_scalars() {
        assert_eq!(from_native(json!(null)), ScriptValue::Nil);
        assert_eq!(from_native(json!(true)), ScriptValue::Bool(true));
        assert_eq!(from_native(json!(5)), ScriptValue::Number(5.0));
        assert_eq!(from_native(json!(2.5)), ScriptValue::Number(2.5));
        assert_eq!(
            from_native(json!("hi")),
            ScriptValue::String("hi".to_string())
        );
    }

    #[test]
    fn test_round_trip_structural_equality() {
        let values = vec![
            ScriptValue::Nil,
            ScriptValue::Bool(false),
            ScriptValue::Number(42.0),
            ScriptValue::String("Alice".to_string()),
            ScriptValue::Array(vec![
                ScriptValue::Number(1.0),
                ScriptValue::String("two".to_string()),
                ScriptValue::Nil,
            ]),
            ScriptValue::Object(BTreeMap::from([
                ("x".to_string(), ScriptValue::Number(10.0)),
                (
                    "nested".to_string(),
                    ScriptValue::Array(vec![ScriptValue::Bool(true)]),
                ),
            ])),
        ];
        for v in values {
            let native = to_native(&v).expect("representable value");
            assert_eq!(from_native(native), v, "round-trip changed {v:?}");
        }
    }

    #[test]
    fn test_to_native_rejects_error_and_channel() {
        let err = to_native(&ScriptValue::Error("boom".into())).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        let err = to_native(&ScriptValue::Channel(Uuid::new_v4())).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_integer_widening() {
        // JSON integers widen to f64 on the way in; the structural identity
        // 30 == 30.0 holds across the boundary.
        let v = from_native(json!({"age": 30}));
        assert_eq!(
            v,
            ScriptValue::Object(BTreeMap::from([(
                "age".to_string(),
                ScriptValue::Number(30.0)
            )]))
        );
    }

    #[test]
    fn test_type_names() {
        assert_eq!(ScriptValue::Nil.type_name(), "nil");
        assert_eq!(ScriptValue::Array(vec![]).type_name(), "array");
        assert_eq!(ScriptValue::Channel(Uuid::nil()).type_name(), "channel");
    }
}
