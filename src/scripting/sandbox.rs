//! Execution-context construction. Each script gets a fresh Lua state with a
//! minimal standard library and an environment table built from an allowlist,
//! so stripped capabilities are never reachable by name.

use mlua::{Lua, LuaOptions, StdLib, Table, Value};
use std::path::{Component, Path, PathBuf};

use super::bindings;

const ENV_KEY: &str = "lantern.env";
const LOADED_KEY: &str = "lantern.loaded";

/// Globals every script may use.
const BASE_CAPABILITIES: &[&str] = &[
    "assert",
    "error",
    "ipairs",
    "next",
    "pairs",
    "select",
    "tonumber",
    "tostring",
    "type",
    "unpack",
    "setmetatable",
    "getmetatable",
    "_VERSION",
    "math",
    "string",
    "table",
    "bit",
];

/// Globals only handed out with "Allow insecure" enabled.
const INSECURE_CAPABILITIES: &[&str] = &["pcall", "xpcall", "rawget", "rawset", "rawequal"];

#[derive(Clone, Copy, Debug, Default)]
pub struct SandboxPolicy {
    pub allow_insecure: bool,
}

/// A state without io, os, debug, package, ffi or jit. `string.dump` is
/// removed as well since bytecode can be loaded back with insecure loaders.
pub fn new_state() -> mlua::Result<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::BIT,
        LuaOptions::new(),
    )?;
    let string: Table = lua.globals().get("string")?;
    string.set("dump", Value::Nil)?;
    Ok(lua)
}

/// Builds the per-script environment and records it in the registry so
/// loaders (`require`, `loadfile`) compile into the same table.
pub fn build_environment(lua: &Lua, policy: SandboxPolicy) -> mlua::Result<Table> {
    let globals = lua.globals();
    let env = lua.create_table()?;
    let insecure: &[&str] = if policy.allow_insecure {
        INSECURE_CAPABILITIES
    } else {
        &[]
    };
    for name in BASE_CAPABILITIES.iter().chain(insecure) {
        env.set(*name, globals.get::<Value>(*name)?)?;
    }
    env.set("_G", env.clone())?;
    bindings::install(lua, &env, policy)?;
    lua.set_named_registry_value(ENV_KEY, env.clone())?;
    lua.set_named_registry_value(LOADED_KEY, lua.create_table()?)?;
    Ok(env)
}

pub fn environment(lua: &Lua) -> mlua::Result<Table> {
    lua.named_registry_value(ENV_KEY)
}

/// Results of `require`, keyed by library name. `false` marks a library
/// whose main chunk is still running.
pub fn loaded_libraries(lua: &Lua) -> mlua::Result<Table> {
    lua.named_registry_value(LOADED_KEY)
}

/// Resolves a script-supplied file name directly under `root`. Separators of
/// either kind, drive prefixes and `..` are refused before any filesystem call.
pub fn sandboxed_path(root: &Path, name: &str) -> Result<PathBuf, String> {
    if name.trim().is_empty() {
        return Err("path must not be empty".to_string());
    }
    if name.contains(['/', '\\', ':', '\0']) {
        return Err(format!("path escapes the sandbox: {name}"));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) => Ok(root.join(part)),
        _ => Err(format!("path escapes the sandbox: {name}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_and_absolute_paths_are_refused() {
        let root = Path::new("/data/storage");
        for name in ["../secret", "C:\\x", "a/b", "a\\b", "/etc/passwd", "..", ".", "", "a\0b"] {
            assert!(sandboxed_path(root, name).is_err(), "{name:?} should be refused");
        }
        assert_eq!(
            sandboxed_path(root, "safe.txt").expect("plain file name"),
            root.join("safe.txt")
        );
    }

    #[test]
    fn stripped_capabilities_are_absent() {
        let lua = new_state().expect("state");
        let env = build_environment(&lua, SandboxPolicy::default()).expect("env");
        for name in ["os", "io", "debug", "package", "coroutine", "rawset", "pcall", "loadstring", "dofile", "load"] {
            assert!(
                env.get::<Value>(name).expect("lookup").is_nil(),
                "{name} leaked into the sandbox"
            );
        }
        let dumped: Value = lua
            .load("return string.dump")
            .set_environment(env)
            .eval()
            .expect("eval");
        assert!(dumped.is_nil());
    }

    #[test]
    fn insecure_policy_restores_protected_calls() {
        let lua = new_state().expect("state");
        let env = build_environment(&lua, SandboxPolicy { allow_insecure: true }).expect("env");
        for name in ["pcall", "xpcall", "rawget", "rawset", "rawequal", "load", "loadstring", "dofile"] {
            assert!(!env.get::<Value>(name).expect("lookup").is_nil(), "{name} missing");
        }
        assert!(env.get::<Value>("os").expect("lookup").is_nil());
    }

    #[test]
    fn namespaces_are_read_only() {
        let lua = new_state().expect("state");
        let env = build_environment(&lua, SandboxPolicy::default()).expect("env");
        let err = lua
            .load("render.rect = nil")
            .set_environment(env)
            .exec()
            .expect_err("assignment must fail");
        assert!(err.to_string().contains("overriding fields is forbidden"));
    }
}
