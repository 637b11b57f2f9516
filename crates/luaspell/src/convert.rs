//! Conversions between [`ScriptValue`] and interpreter values.
//!
//! The extraction mapping is fixed:
//! numbers → `Number` (integers widen to `f64`), strings → `String`,
//! booleans → `Bool`, nil → `Nil`, tables with consecutive `1..N` integer
//! keys → `Array`, other tables → `Object` (keys stringified), functions and
//! userdata → error (not exportable).
//!
//! On the way in, whole numbers are pushed as the language's integer subtype
//! so string coercion behaves naturally (`30` concatenates as `"30"`, not
//! `"30.0"`). Channel references cross the boundary as a one-field marker
//! table holding the channel id.

use std::collections::BTreeMap;

use mlua::{Lua, Value};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::types::ScriptValue;

/// Marker key identifying a channel-reference table.
const CHANNEL_KEY: &str = "__channel_id";

/// Converts a [`ScriptValue`] into an interpreter value owned by `lua`.
pub fn script_to_lua(lua: &Lua, value: &ScriptValue) -> mlua::Result<Value> {
    Ok(match value {
        ScriptValue::Nil => Value::Nil,
        ScriptValue::Bool(b) => Value::Boolean(*b),
        ScriptValue::Number(n) => {
            // Whole numbers go in as integers so tostring/.. behave naturally.
            if n.fract() == 0.0 && n.is_finite() && *n >= i64::MIN as f64 && *n <= i64::MAX as f64 {
                Value::Integer(*n as i64)
            } else {
                Value::Number(*n)
            }
        }
        ScriptValue::String(s) => Value::String(lua.create_string(s)?),
        ScriptValue::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, script_to_lua(lua, item)?)?;
            }
            Value::Table(table)
        }
        ScriptValue::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (k, v) in map {
                table.raw_set(k.as_str(), script_to_lua(lua, v)?)?;
            }
            Value::Table(table)
        }
        ScriptValue::Error(message) => {
            return Err(mlua::Error::RuntimeError(message.clone()));
        }
        ScriptValue::Channel(id) => {
            let table = lua.create_table_with_capacity(0, 1)?;
            table.raw_set(CHANNEL_KEY, id.to_string())?;
            Value::Table(table)
        }
    })
}

/// Converts an interpreter value into a [`ScriptValue`].
///
/// Functions, threads, and userdata are not exportable and fail with a
/// validation error naming the offending type.
pub fn lua_to_script(value: &Value) -> Result<ScriptValue> {
    Ok(match value {
        Value::Nil => ScriptValue::Nil,
        Value::Boolean(b) => ScriptValue::Bool(*b),
        Value::Integer(i) => ScriptValue::Number(*i as f64),
        Value::Number(n) => ScriptValue::Number(*n),
        Value::String(s) => ScriptValue::String(s.to_string_lossy().to_string()),
        Value::Table(table) => table_to_script(table)?,
        Value::Function(_) => {
            return Err(EngineError::validation(
                "functions are not exportable as script values",
            ))
        }
        Value::Thread(_) => {
            return Err(EngineError::validation(
                "threads are not exportable as script values",
            ))
        }
        Value::UserData(_) | Value::LightUserData(_) => {
            return Err(EngineError::validation(
                "userdata is not exportable as a script value",
            ))
        }
        other => {
            return Err(EngineError::validation(format!(
                "{} is not exportable as a script value",
                other.type_name()
            )))
        }
    })
}

fn table_to_script(table: &mlua::Table) -> Result<ScriptValue> {
    // Channel marker tables round-trip back to channel references.
    if let Ok(Value::String(id)) = table.raw_get::<Value>(CHANNEL_KEY) {
        if let Ok(id) = Uuid::parse_str(&id.to_string_lossy()) {
            return Ok(ScriptValue::Channel(id));
        }
    }

    // First pass: collect pairs and decide array-ness. A table is an array
    // exactly when its key set is {1, 2, .., N} for some N.
    let mut pairs: Vec<(Value, Value)> = Vec::new();
    for entry in table.pairs::<Value, Value>() {
        let (k, v) = entry.map_err(|e| EngineError::runtime(e.to_string()))?;
        pairs.push((k, v));
    }

    let len = pairs.len();
    let mut int_keys: Vec<i64> = Vec::with_capacity(len);
    for (k, _) in &pairs {
        match k {
            Value::Integer(i) => int_keys.push(*i),
            Value::Number(n) if n.fract() == 0.0 => int_keys.push(*n as i64),
            _ => {
                int_keys.clear();
                break;
            }
        }
    }

    let is_array = !pairs.is_empty() && int_keys.len() == len && {
        int_keys.sort_unstable();
        int_keys.iter().enumerate().all(|(i, k)| *k == i as i64 + 1)
    };

    if is_array {
        let mut items = vec![ScriptValue::Nil; len];
        for (k, v) in &pairs {
            let idx = match k {
                Value::Integer(i) => *i as usize - 1,
                Value::Number(n) => *n as usize - 1,
                _ => unreachable!("non-integer key in array-shaped table"),
            };
            items[idx] = lua_to_script(v)?;
        }
        return Ok(ScriptValue::Array(items));
    }

    let mut map = BTreeMap::new();
    for (k, v) in &pairs {
        let key = match k {
            Value::String(s) => s.to_string_lossy().to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Boolean(b) => b.to_string(),
            other => {
                return Err(EngineError::validation(format!(
                    "table key of type {} is not exportable",
                    other.type_name()
                )))
            }
        };
        map.insert(key, lua_to_script(v)?);
    }
    Ok(ScriptValue::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn lua() -> Lua {
        Lua::new()
    }

    // ── scalars ───────────────────────────────────────────────────────────────

    #[test]
    fn test_scalar_round_trip() {
        let lua = lua();
        for sv in [
            ScriptValue::Nil,
            ScriptValue::Bool(true),
            ScriptValue::Number(2.5),
            ScriptValue::Number(42.0),
            ScriptValue::String("hello".to_string()),
        ] {
            let v = script_to_lua(&lua, &sv).unwrap();
            assert_eq!(lua_to_script(&v).unwrap(), sv, "round-trip changed {sv:?}");
        }
    }

    #[test]
    fn test_whole_numbers_become_integers() {
        let lua = lua();
        let v = script_to_lua(&lua, &ScriptValue::Number(30.0)).unwrap();
        assert!(matches!(v, Value::Integer(30)));
        // And they still widen back to f64 on extraction.
        assert_eq!(lua_to_script(&v).unwrap(), ScriptValue::Number(30.0));
    }

    #[test]
    fn test_fractional_numbers_stay_floats() {
        let lua = lua();
        let v = script_to_lua(&lua, &ScriptValue::Number(0.5)).unwrap();
        assert!(matches!(v, Value::Number(_)));
    }

    // ── tables ────────────────────────────────────────────────────────────────

    #[test]
    fn test_sequence_table_maps_to_array() {
        let lua = lua();
        let v: Value = lua.load("return {10, 20, 30}").eval().unwrap();
        assert_eq!(
            lua_to_script(&v).unwrap(),
            ScriptValue::Array(vec![
                ScriptValue::Number(10.0),
                ScriptValue::Number(20.0),
                ScriptValue::Number(30.0),
            ])
        );
    }

    #[test]
    fn test_keyed_table_maps_to_object() {
        let lua = lua();
        let v: Value = lua.load("return {x=10, y=20, z=30}").eval().unwrap();
        let sv = lua_to_script(&v).unwrap();
        assert_eq!(
            sv,
            ScriptValue::Object(BTreeMap::from([
                ("x".to_string(), ScriptValue::Number(10.0)),
                ("y".to_string(), ScriptValue::Number(20.0)),
                ("z".to_string(), ScriptValue::Number(30.0)),
            ]))
        );
    }

    #[test]
    fn test_sparse_table_is_object_not_array() {
        let lua = lua();
        // Keys {1, 3} are not consecutive — must map to an object.
        let v: Value = lua.load("return {[1]='a', [3]='c'}").eval().unwrap();
        match lua_to_script(&v).unwrap() {
            ScriptValue::Object(map) => {
                assert_eq!(map.len(), 2);
                assert!(map.contains_key("1"));
                assert!(map.contains_key("3"));
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_mixed_table_is_object() {
        let lua = lua();
        let v: Value = lua.load("return {1, 2, name='x'}").eval().unwrap();
        assert!(matches!(lua_to_script(&v).unwrap(), ScriptValue::Object(_)));
    }

    #[test]
    fn test_empty_table_is_object() {
        let lua = lua();
        let v: Value = lua.load("return {}").eval().unwrap();
        assert_eq!(lua_to_script(&v).unwrap(), ScriptValue::Object(BTreeMap::new()));
    }

    #[test]
    fn test_nested_round_trip() {
        let lua = lua();
        let sv = ScriptValue::Object(BTreeMap::from([
            (
                "items".to_string(),
                ScriptValue::Array(vec![ScriptValue::Number(1.0), ScriptValue::Number(2.0)]),
            ),
            ("label".to_string(), ScriptValue::String("deep".to_string())),
        ]));
        let v = script_to_lua(&lua, &sv).unwrap();
        assert_eq!(lua_to_script(&v).unwrap(), sv);
    }

    // ── non-exportable values ─────────────────────────────────────────────────

    #[test]
    fn test_function_not_exportable() {
        let lua = lua();
        let v: Value = lua.load("return function() end").eval().unwrap();
        let err = lua_to_script(&v).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    // ── channel references ────────────────────────────────────────────────────

    #[test]
    fn test_channel_reference_round_trip() {
        let lua = lua();
        let id = Uuid::new_v4();
        let v = script_to_lua(&lua, &ScriptValue::Channel(id)).unwrap();
        assert_eq!(lua_to_script(&v).unwrap(), ScriptValue::Channel(id));
    }
}
