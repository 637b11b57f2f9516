//! Security manager: decides which built-ins and capabilities are linked into
//! an interpreter, and strips the escape surface from the ones that are.
//!
//! The posture is deny-by-default: a security level selects a small base set
//! of standard libraries, `allowed_modules` opts additional ones in, and
//! `disabled_modules` wins over everything. `"filesystem"` and `"process"`
//! are accepted as aliases for `io` and `os` so callers can speak in
//! capability terms rather than Lua library names.
//!
//! Hardening always removes dynamic code loading (`load`, `loadstring`,
//! `dofile`, `loadfile`, `require`) in sandbox mode; the strict level
//! additionally removes metatable surgery and the raw-access family.

use std::collections::HashSet;

use mlua::{Lua, StdLib};

use crate::config::{FilesystemMode, SecurityConfig, SecurityLevel};
use crate::error::{EngineError, Result};

/// Library names scripts can request via `allowed_modules`.
const LINKABLE_MODULES: &[&str] = &[
    "math",
    "string",
    "table",
    "utf8",
    "coroutine",
    "os",
    "io",
    "package",
    "debug",
];

/// Globals removed in every sandboxed instance regardless of level. These are
/// the dynamic-load and exec escape paths.
const ESCAPE_GLOBALS: &[&str] = &["load", "loadstring", "dofile", "loadfile", "require"];

/// Additional globals removed at the strict level: reflection-like and
/// metatable-surgery primitives.
const STRICT_GLOBALS: &[&str] = &[
    "getmetatable",
    "setmetatable",
    "rawget",
    "rawset",
    "rawequal",
    "rawlen",
    "collectgarbage",
];

/// `os` functions that survive when `os` is linked: everything that spawns
/// processes or mutates the filesystem is cut.
const OS_DENYLIST: &[&str] = &[
    "execute", "exit", "remove", "rename", "tmpname", "setlocale", "getenv",
];

/// Resolves capability aliases to Lua library names.
fn canonical_module(name: &str) -> &str {
    match name {
        "filesystem" => "io",
        "process" => "os",
        other => other,
    }
}

fn stdlib_flag(name: &str) -> Option<StdLib> {
    Some(match name {
        "math" => StdLib::MATH,
        "string" => StdLib::STRING,
        "table" => StdLib::TABLE,
        "utf8" => StdLib::UTF8,
        "coroutine" => StdLib::COROUTINE,
        "os" => StdLib::OS,
        "io" => StdLib::IO,
        "package" => StdLib::PACKAGE,
        "debug" => StdLib::DEBUG,
        _ => return None,
    })
}

/// Produces the effective capability set for a configuration and installs it
/// into instances. Construction is pure; [`link_into`](SecurityManager::link_into)
/// is deterministic for a given manager.
#[derive(Debug, Clone)]
pub struct SecurityManager {
    config: SecurityConfig,
    sandbox_mode: bool,
    filesystem_mode: FilesystemMode,
}

impl SecurityManager {
    pub fn new(
        config: SecurityConfig,
        sandbox_mode: bool,
        filesystem_mode: FilesystemMode,
    ) -> Self {
        Self {
            config,
            sandbox_mode,
            filesystem_mode,
        }
    }

    /// The module names that will be linked, after level base set, allow
    /// list, deny list, and the filesystem gate are applied.
    pub fn effective_modules(&self) -> HashSet<&'static str> {
        let mut set: HashSet<&'static str> = if !self.sandbox_mode {
            // Sandbox off: full safe stdlib (no io/os/debug unless allowed).
            ["math", "string", "table", "utf8", "coroutine", "package"]
                .into_iter()
                .collect()
        } else {
            match self.config.level {
                SecurityLevel::Minimal => ["math", "string", "table"].into_iter().collect(),
                SecurityLevel::Standard | SecurityLevel::Strict => {
                    ["math", "string", "table", "utf8", "coroutine"]
                        .into_iter()
                        .collect()
                }
            }
        };

        for name in &self.config.allowed_modules {
            let canon = canonical_module(name);
            if let Some(known) = LINKABLE_MODULES.iter().find(|m| **m == canon) {
                set.insert(known);
            }
        }

        // Deny overrides allow.
        for name in &self.config.disabled_modules {
            let canon = canonical_module(name);
            set.remove(canon);
        }

        // Strict never links the reflection library.
        if self.sandbox_mode && self.config.level == SecurityLevel::Strict {
            set.remove("debug");
        }

        // The filesystem gate trumps the allow list for io.
        if self.filesystem_mode == FilesystemMode::None {
            set.remove("io");
        }

        set
    }

    /// The `StdLib` flag set to create the instance with.
    pub fn stdlib_flags(&self) -> StdLib {
        let mut flags = StdLib::NONE;
        for name in self.effective_modules() {
            if let Some(flag) = stdlib_flag(name) {
                flags |= flag;
            }
        }
        flags
    }

    /// Strips the escape surface from a freshly created instance. Deterministic
    /// for a given manager; called exactly once per instance by the factory.
    pub fn link_into(&self, lua: &Lua) -> Result<()> {
        let globals = lua.globals();

        if self.sandbox_mode {
            for name in ESCAPE_GLOBALS {
                globals
                    .set(*name, mlua::Value::Nil)
                    .map_err(|e| EngineError::runtime(format!("sandbox setup: {e}")))?;
            }
            if self.config.level == SecurityLevel::Strict {
                for name in STRICT_GLOBALS {
                    globals
                        .set(*name, mlua::Value::Nil)
                        .map_err(|e| EngineError::runtime(format!("sandbox setup: {e}")))?;
                }
            }
        }

        let effective = self.effective_modules();

        if effective.contains("os") {
            if let Ok(os_table) = globals.get::<mlua::Table>("os") {
                for name in OS_DENYLIST {
                    os_table
                        .set(*name, mlua::Value::Nil)
                        .map_err(|e| EngineError::runtime(format!("sandbox setup: {e}")))?;
                }
            }
        }

        if effective.contains("io") && self.filesystem_mode == FilesystemMode::ReadOnly {
            self.install_read_only_open(lua)?;
        }

        Ok(())
    }

    /// Replaces `io.open` with a wrapper that rejects any mode other than
    /// plain reads, and removes `io.popen` and write-oriented entry points.
    fn install_read_only_open(&self, lua: &Lua) -> Result<()> {
        let globals = lua.globals();
        let io_table: mlua::Table = globals
            .get("io")
            .map_err(|e| EngineError::runtime(format!("sandbox setup: {e}")))?;

        let original_open: mlua::Function = io_table
            .get("open")
            .map_err(|e| EngineError::runtime(format!("sandbox setup: {e}")))?;

        let wrapper = lua
            .create_function(move |_, (path, mode): (String, Option<String>)| {
                let mode = mode.unwrap_or_else(|| "r".to_string());
                if mode != "r" && mode != "rb" {
                    return Err(mlua::Error::RuntimeError(format!(
                        "filesystem is read-only: cannot open {path:?} with mode {mode:?}"
                    )));
                }
                original_open.call::<mlua::MultiValue>((path, mode))
            })
            .map_err(|e| EngineError::runtime(format!("sandbox setup: {e}")))?;

        io_table
            .set("open", wrapper)
            .map_err(|e| EngineError::runtime(format!("sandbox setup: {e}")))?;
        for name in ["popen", "output", "write", "tmpfile"] {
            io_table
                .set(name, mlua::Value::Nil)
                .map_err(|e| EngineError::runtime(format!("sandbox setup: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(level: SecurityLevel, allowed: &[&str], disabled: &[&str]) -> SecurityManager {
        SecurityManager::new(
            SecurityConfig {
                level,
                allowed_modules: allowed.iter().map(|s| s.to_string()).collect(),
                disabled_modules: disabled.iter().map(|s| s.to_string()).collect(),
            },
            true,
            FilesystemMode::None,
        )
    }

    // ── effective set composition ─────────────────────────────────────────────

    #[test]
    fn test_minimal_base_set() {
        let m = manager(SecurityLevel::Minimal, &[], &[]);
        let set = m.effective_modules();
        assert!(set.contains("math"));
        assert!(set.contains("string"));
        assert!(set.contains("table"));
        assert!(!set.contains("coroutine"));
        assert!(!set.contains("os"));
    }

    #[test]
    fn test_standard_adds_utf8_and_coroutine() {
        let m = manager(SecurityLevel::Standard, &[], &[]);
        let set = m.effective_modules();
        assert!(set.contains("utf8"));
        assert!(set.contains("coroutine"));
    }

    #[test]
    fn test_disabled_overrides_allowed() {
        let m = manager(SecurityLevel::Standard, &["os"], &["os"]);
        assert!(!m.effective_modules().contains("os"));
    }

    #[test]
    fn test_capability_aliases() {
        // "process" maps to os; allow via alias, deny via alias.
        let m = manager(SecurityLevel::Standard, &["process"], &[]);
        assert!(m.effective_modules().contains("os"));
        let m = manager(SecurityLevel::Standard, &["os"], &["process"]);
        assert!(!m.effective_modules().contains("os"));
    }

    #[test]
    fn test_filesystem_none_gates_io() {
        let m = manager(SecurityLevel::Standard, &["io"], &[]);
        // filesystem_mode is None in the helper; io must not link even though
        // it was allowed.
        assert!(!m.effective_modules().contains("io"));
    }

    #[test]
    fn test_strict_never_links_debug() {
        let m = manager(SecurityLevel::Strict, &["debug"], &[]);
        assert!(!m.effective_modules().contains("debug"));
    }

    #[test]
    fn test_unknown_module_names_ignored() {
        let m = manager(SecurityLevel::Minimal, &["frobnicate"], &[]);
        let set = m.effective_modules();
        assert_eq!(set.len(), 3, "unknown names must not grow the set");
    }

    // ── flags ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_stdlib_flags_reflect_effective_set() {
        let m = manager(SecurityLevel::Minimal, &[], &["string"]);
        let flags = m.stdlib_flags();
        assert!(flags.contains(StdLib::MATH));
        assert!(flags.contains(StdLib::TABLE));
        assert!(!flags.contains(StdLib::STRING));
        assert!(!flags.contains(StdLib::IO));
    }

    // ── link_into against a live instance ────────────────────────────────────

    #[test]
    fn test_link_into_strips_escape_globals() {
        let m = manager(SecurityLevel::Standard, &[], &[]);
        let lua = Lua::new_with(m.stdlib_flags(), mlua::LuaOptions::default()).unwrap();
        m.link_into(&lua).unwrap();
        for name in ESCAPE_GLOBALS {
            let v: mlua::Value = lua.globals().get(*name).unwrap();
            assert!(v.is_nil(), "{name} should be stripped");
        }
    }

    #[test]
    fn test_strict_strips_metatable_surgery() {
        let m = manager(SecurityLevel::Strict, &[], &[]);
        let lua = Lua::new_with(m.stdlib_flags(), mlua::LuaOptions::default()).unwrap();
        m.link_into(&lua).unwrap();
        let v: mlua::Value = lua.globals().get("setmetatable").unwrap();
        assert!(v.is_nil());
        let v: mlua::Value = lua.globals().get("rawset").unwrap();
        assert!(v.is_nil());
    }

    #[test]
    fn test_standard_keeps_metatable_surgery() {
        let m = manager(SecurityLevel::Standard, &[], &[]);
        let lua = Lua::new_with(m.stdlib_flags(), mlua::LuaOptions::default()).unwrap();
        m.link_into(&lua).unwrap();
        let v: mlua::Value = lua.globals().get("setmetatable").unwrap();
        assert!(!v.is_nil());
    }

    #[test]
    fn test_os_denylist_applied_when_os_linked() {
        let m = SecurityManager::new(
            SecurityConfig {
                level: SecurityLevel::Standard,
                allowed_modules: vec!["os".to_string()],
                disabled_modules: vec![],
            },
            true,
            FilesystemMode::None,
        );
        let lua = Lua::new_with(m.stdlib_flags(), mlua::LuaOptions::default()).unwrap();
        m.link_into(&lua).unwrap();
        let os_table: mlua::Table = lua.globals().get("os").unwrap();
        let execute: mlua::Value = os_table.get("execute").unwrap();
        assert!(execute.is_nil(), "os.execute must be cut");
        let clock: mlua::Value = os_table.get("clock").unwrap();
        assert!(!clock.is_nil(), "os.clock is harmless and stays");
    }
}
