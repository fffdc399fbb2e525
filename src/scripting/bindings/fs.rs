use mlua::{Lua, LuaSerdeExt, Table, Value};
use std::path::{Path, PathBuf};

use super::{binding, byte_table, nothing, ret, Args, BindingError, BindingResult, Caller};
use crate::scripting::sandbox;

fn storage_path(caller: &Caller, args: &Args) -> BindingResult<(String, PathBuf)> {
    let name = args.string(0)?;
    let root = caller.host.borrow().storage_dir();
    let path = sandbox::sandboxed_path(&root, &name).map_err(BindingError::SandboxViolation)?;
    Ok((name, path))
}

fn io_error(name: &str, err: std::io::Error) -> BindingError {
    BindingError::Usage(format!("{name}: {err}"))
}

fn write_file(path: &Path, name: &str, data: &[u8]) -> BindingResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_error(name, e))?;
    }
    std::fs::write(path, data).map_err(|e| io_error(name, e))
}

pub(super) fn fs_namespace(lua: &Lua) -> mlua::Result<Table> {
    let fs = lua.create_table()?;

    fs.set(
        "read",
        binding(lua, "usage: read(path: string): string", |lua, caller, args| {
            let (name, path) = storage_path(caller, &args)?;
            let data = std::fs::read(&path).map_err(|e| io_error(&name, e))?;
            ret(lua, lua.create_string(&data)?)
        })?,
    )?;

    fs.set(
        "read_stream",
        binding(lua, "usage: read_stream(path: string): table", |lua, caller, args| {
            let (name, path) = storage_path(caller, &args)?;
            let data = std::fs::read(&path).map_err(|e| io_error(&name, e))?;
            ret(lua, byte_table(lua, &data)?)
        })?,
    )?;

    fs.set(
        "write",
        binding(lua, "usage: write(path: string, data: string)", |_, caller, args| {
            let (name, path) = storage_path(caller, &args)?;
            let data = args.bytes(1)?;
            write_file(&path, &name, &data)?;
            nothing()
        })?,
    )?;

    fs.set(
        "write_stream",
        binding(lua, "usage: write_stream(path: string, data: table)", |_, caller, args| {
            let (name, path) = storage_path(caller, &args)?;
            let data = args.byte_table(1)?;
            write_file(&path, &name, &data)?;
            nothing()
        })?,
    )?;

    fs.set(
        "remove",
        binding(lua, "usage: remove(path: string)", |_, caller, args| {
            let (name, path) = storage_path(caller, &args)?;
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            removed.map_err(|e| io_error(&name, e))?;
            nothing()
        })?,
    )?;

    fs.set(
        "exists",
        binding(lua, "usage: exists(path: string): boolean", |lua, caller, args| {
            let (_, path) = storage_path(caller, &args)?;
            ret(lua, path.exists())
        })?,
    )?;

    fs.set(
        "is_file",
        binding(lua, "usage: is_file(path: string): boolean", |lua, caller, args| {
            let (_, path) = storage_path(caller, &args)?;
            ret(lua, path.is_file())
        })?,
    )?;

    fs.set(
        "is_dir",
        binding(lua, "usage: is_dir(path: string): boolean", |lua, caller, args| {
            let (_, path) = storage_path(caller, &args)?;
            ret(lua, path.is_dir())
        })?,
    )?;

    fs.set(
        "create_dir",
        binding(lua, "usage: create_dir(path: string)", |_, caller, args| {
            let (name, path) = storage_path(caller, &args)?;
            std::fs::create_dir_all(&path).map_err(|e| io_error(&name, e))?;
            nothing()
        })?,
    )?;

    fs.set(
        "list",
        binding(lua, "usage: list(path = \"\"): table", |lua, caller, args| {
            let root = caller.host.borrow().storage_dir();
            let dir = match args.opt_string(0)? {
                Some(name) if !name.is_empty() => {
                    sandbox::sandboxed_path(&root, &name).map_err(BindingError::SandboxViolation)?
                }
                _ => root,
            };
            let mut names: Vec<String> = match std::fs::read_dir(&dir) {
                Ok(entries) => entries
                    .flatten()
                    .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
                    .collect(),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(err) => return Err(io_error(&dir.display().to_string(), err)),
            };
            names.sort();
            ret(lua, lua.create_sequence_from(names)?)
        })?,
    )?;

    Ok(fs)
}

fn database_path(caller: &Caller, args: &Args) -> BindingResult<(String, PathBuf)> {
    let name = args.string(0)?;
    let root = caller.host.borrow().database_dir();
    let path = sandbox::sandboxed_path(&root, &name).map_err(BindingError::SandboxViolation)?;
    Ok((name, path))
}

/// Key/value persistence under `database/`. Tables round-trip through JSON.
pub(super) fn database_namespace(lua: &Lua) -> mlua::Result<Table> {
    let database = lua.create_table()?;

    database.set(
        "save",
        binding(lua, "usage: save(name: string, value: string | table)", |lua, caller, args| {
            let (name, path) = database_path(caller, &args)?;
            let contents = match args.value(1) {
                Value::String(s) => s.as_bytes().to_vec(),
                Value::Table(table) => {
                    let json: serde_json::Value = lua.from_value(Value::Table(table))?;
                    serde_json::to_vec_pretty(&json)
                        .map_err(|e| BindingError::Usage(format!("{name}: {e}")))?
                }
                _ => return Err(args.usage()),
            };
            write_file(&path, &name, &contents)?;
            nothing()
        })?,
    )?;

    database.set(
        "load",
        binding(lua, "usage: load(name: string): table | string", |lua, caller, args| {
            let (name, path) = database_path(caller, &args)?;
            let contents = match std::fs::read(&path) {
                Ok(contents) => contents,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return nothing(),
                Err(err) => return Err(io_error(&name, err)),
            };
            match serde_json::from_slice::<serde_json::Value>(&contents) {
                Ok(json @ (serde_json::Value::Object(_) | serde_json::Value::Array(_))) => {
                    ret(lua, lua.to_value(&json)?)
                }
                _ => ret(lua, lua.create_string(&contents)?),
            }
        })?,
    )?;

    Ok(database)
}
