//! Native functions exposed to scripts. Every binding validates its arguments
//! against a declared usage line, resolves the calling script, then acts.
//! Non-Lua failures are reported to the script log and turn into a nil return.

mod fs;
mod gui;
mod render;
mod utils;
mod zip;

use mlua::{Function, IntoLuaMulti, Lua, MultiValue, Table, Value};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use super::host::HostContext;
use super::instance::OwnedResources;
use super::sandbox::{self, SandboxPolicy};
use super::LogCategory;
use crate::render::Color;

pub(crate) use render::LuaColor;

const ESCAPED_SANDBOX: &str = "FATAL: could not find the script. Did it escape the sandbox?";
const READ_ONLY: &str = "access violation: overriding fields is forbidden";

/// App data on every script state pointing back at the shared host.
pub(crate) struct HostHandle(pub Rc<RefCell<HostContext>>);

/// App data identifying which script a state belongs to. Removed on unload.
pub(crate) struct ScriptScope {
    pub id: u32,
    pub name: String,
    pub owned: Weak<RefCell<OwnedResources>>,
}

#[derive(Debug)]
pub(crate) enum BindingError {
    Usage(String),
    SandboxViolation(String),
    PolicyDenied(String),
    ResourceExhausted(String),
    Lua(mlua::Error),
}

impl From<mlua::Error> for BindingError {
    fn from(err: mlua::Error) -> Self {
        BindingError::Lua(err)
    }
}

impl BindingError {
    fn category(&self) -> LogCategory {
        match self {
            BindingError::Usage(_) => LogCategory::UsageError,
            BindingError::SandboxViolation(_) => LogCategory::SandboxViolation,
            BindingError::PolicyDenied(_) => LogCategory::PolicyDenied,
            BindingError::ResourceExhausted(_) => LogCategory::ResourceExhausted,
            BindingError::Lua(_) => LogCategory::RuntimeError,
        }
    }

    fn message(&self) -> String {
        match self {
            BindingError::Usage(m)
            | BindingError::SandboxViolation(m)
            | BindingError::PolicyDenied(m)
            | BindingError::ResourceExhausted(m) => m.clone(),
            BindingError::Lua(e) => e.to_string(),
        }
    }
}

pub(crate) type BindingResult<T = MultiValue> = Result<T, BindingError>;

pub(crate) fn insecure_denied(what: &str) -> BindingError {
    BindingError::PolicyDenied(format!("{what} is not available with Allow insecure disabled"))
}

pub(crate) fn host_of(lua: &Lua) -> mlua::Result<Rc<RefCell<HostContext>>> {
    lua.app_data_ref::<HostHandle>()
        .map(|handle| handle.0.clone())
        .ok_or_else(|| mlua::Error::RuntimeError(ESCAPED_SANDBOX.to_string()))
}

/// The script a binding call is attributed to.
pub(crate) struct Caller {
    pub id: u32,
    pub name: String,
    pub owned: Rc<RefCell<OwnedResources>>,
    pub host: Rc<RefCell<HostContext>>,
}

impl Caller {
    fn resolve(lua: &Lua) -> Result<Caller, (Option<Rc<RefCell<HostContext>>>, String)> {
        let host = host_of(lua).ok();
        let scope = lua.app_data_ref::<ScriptScope>();
        let resolved = scope.as_ref().and_then(|scope| {
            Some((scope.id, scope.name.clone(), scope.owned.upgrade()?))
        });
        drop(scope);
        match (resolved, host) {
            (Some((id, name, owned)), Some(host)) => Ok(Caller {
                id,
                name,
                owned,
                host,
            }),
            (_, host) => Err((host, ESCAPED_SANDBOX.to_string())),
        }
    }

    pub fn report(&self, category: LogCategory, message: String) {
        self.host
            .borrow_mut()
            .report(self.id, &self.name, category, message);
    }

    pub fn allow_insecure(&self) -> bool {
        self.host.borrow().allow_insecure()
    }

    pub fn require_insecure(&self, what: &str) -> BindingResult<()> {
        if self.allow_insecure() {
            Ok(())
        } else {
            Err(insecure_denied(what))
        }
    }
}

/// Runs one binding body with caller resolution and error tagging.
pub(crate) fn guarded<F>(lua: &Lua, usage: &str, args: MultiValue, body: F) -> mlua::Result<MultiValue>
where
    F: FnOnce(&Caller, Args) -> BindingResult,
{
    let caller = match Caller::resolve(lua) {
        Ok(caller) => caller,
        Err((Some(host), message)) => {
            host.borrow_mut()
                .report(0, "<unknown>", LogCategory::SandboxViolation, message);
            return Ok(MultiValue::new());
        }
        Err((None, message)) => return Err(mlua::Error::RuntimeError(message)),
    };
    match body(&caller, Args::new(args, usage)) {
        Ok(values) => Ok(values),
        Err(BindingError::Lua(err)) => Err(err),
        Err(err) => {
            caller.report(err.category(), err.message());
            Ok(MultiValue::new())
        }
    }
}

pub(crate) fn binding<F>(lua: &Lua, usage: &'static str, body: F) -> mlua::Result<Function>
where
    F: Fn(&Lua, &Caller, Args) -> BindingResult + 'static,
{
    lua.create_function(move |lua, args: MultiValue| {
        guarded(lua, usage, args, |caller, args| body(lua, caller, args))
    })
}

pub(crate) fn ret<T: IntoLuaMulti>(lua: &Lua, value: T) -> BindingResult {
    Ok(value.into_lua_multi(lua)?)
}

pub(crate) fn nothing() -> BindingResult {
    Ok(MultiValue::new())
}

/// Positional arguments checked against a declared usage line.
pub(crate) struct Args {
    values: Vec<Value>,
    usage: String,
}

impl Args {
    pub fn new(values: MultiValue, usage: &str) -> Self {
        Self {
            values: values.into_iter().collect(),
            usage: usage.to_string(),
        }
    }

    /// Drops the receiver of a `obj:method(...)` call.
    pub fn method(mut self) -> Self {
        if !self.values.is_empty() {
            self.values.remove(0);
        }
        self
    }

    pub fn usage(&self) -> BindingError {
        BindingError::Usage(self.usage.clone())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn value(&self, index: usize) -> Value {
        self.values.get(index).cloned().unwrap_or(Value::Nil)
    }

    pub fn is_nil(&self, index: usize) -> bool {
        matches!(self.values.get(index), None | Some(Value::Nil))
    }

    pub fn string(&self, index: usize) -> BindingResult<String> {
        match self.values.get(index) {
            Some(Value::String(s)) => s
                .to_str()
                .map(|s| s.to_string())
                .map_err(|_| self.usage()),
            _ => Err(self.usage()),
        }
    }

    pub fn opt_string(&self, index: usize) -> BindingResult<Option<String>> {
        if self.is_nil(index) {
            return Ok(None);
        }
        self.string(index).map(Some)
    }

    pub fn bytes(&self, index: usize) -> BindingResult<Vec<u8>> {
        match self.values.get(index) {
            Some(Value::String(s)) => Ok(s.as_bytes().to_vec()),
            _ => Err(self.usage()),
        }
    }

    /// A table of byte values, as produced by the `*_stream` readers.
    pub fn byte_table(&self, index: usize) -> BindingResult<Vec<u8>> {
        let table = self.table(index)?;
        let mut out = Vec::with_capacity(table.raw_len());
        for value in table.sequence_values::<i64>() {
            let byte = value?;
            out.push(u8::try_from(byte).map_err(|_| self.usage())?);
        }
        Ok(out)
    }

    pub fn number(&self, index: usize) -> BindingResult<f64> {
        match self.values.get(index) {
            Some(Value::Integer(i)) => Ok(*i as f64),
            Some(Value::Number(n)) => Ok(*n),
            _ => Err(self.usage()),
        }
    }

    pub fn opt_number(&self, index: usize, default: f64) -> BindingResult<f64> {
        if self.is_nil(index) {
            return Ok(default);
        }
        self.number(index)
    }

    pub fn integer(&self, index: usize) -> BindingResult<i64> {
        match self.values.get(index) {
            Some(Value::Integer(i)) => Ok(*i),
            Some(Value::Number(n)) if n.fract() == 0.0 && n.is_finite() => Ok(*n as i64),
            _ => Err(self.usage()),
        }
    }

    pub fn opt_integer(&self, index: usize, default: i64) -> BindingResult<i64> {
        if self.is_nil(index) {
            return Ok(default);
        }
        self.integer(index)
    }

    /// Resource handles are positive integers.
    pub fn handle(&self, index: usize) -> BindingResult<u64> {
        let value = self.integer(index)?;
        u64::try_from(value)
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| self.usage())
    }

    pub fn boolean(&self, index: usize) -> BindingResult<bool> {
        match self.values.get(index) {
            Some(Value::Boolean(b)) => Ok(*b),
            _ => Err(self.usage()),
        }
    }

    pub fn opt_boolean(&self, index: usize, default: bool) -> BindingResult<bool> {
        if self.is_nil(index) {
            return Ok(default);
        }
        self.boolean(index)
    }

    pub fn table(&self, index: usize) -> BindingResult<Table> {
        match self.values.get(index) {
            Some(Value::Table(t)) => Ok(t.clone()),
            _ => Err(self.usage()),
        }
    }

    pub fn function(&self, index: usize) -> BindingResult<Function> {
        match self.values.get(index) {
            Some(Value::Function(f)) => Ok(f.clone()),
            _ => Err(self.usage()),
        }
    }

    /// Accepts a `render.color` value, an `{r, g, b, a}` table or a hex string.
    pub fn color(&self, index: usize) -> BindingResult<Color> {
        match self.values.get(index) {
            Some(Value::UserData(ud)) => ud
                .borrow::<LuaColor>()
                .map(|c| c.0)
                .map_err(|_| self.usage()),
            Some(Value::Table(t)) => {
                let channel = |key: &str, default: i64| -> BindingResult<u8> {
                    let value: Option<i64> = t.get(key).map_err(|_| self.usage())?;
                    Ok(value.unwrap_or(default).clamp(0, 255) as u8)
                };
                Ok(Color::rgba(
                    channel("r", 0)?,
                    channel("g", 0)?,
                    channel("b", 0)?,
                    channel("a", 255)?,
                ))
            }
            Some(Value::String(s)) => s
                .to_str()
                .ok()
                .and_then(|text| Color::from_hex(&text))
                .ok_or_else(|| self.usage()),
            _ => Err(self.usage()),
        }
    }

    pub fn opt_color(&self, index: usize, default: Color) -> BindingResult<Color> {
        if self.is_nil(index) {
            return Ok(default);
        }
        self.color(index)
    }

    pub fn point(&self, index: usize) -> BindingResult<[f32; 2]> {
        Ok([self.number(index)? as f32, self.number(index + 1)? as f32])
    }
}

/// Wraps `inner` so scripts can read but never assign its fields.
pub(crate) fn read_only(lua: &Lua, inner: Table) -> mlua::Result<Table> {
    let proxy = lua.create_table()?;
    let meta = lua.create_table()?;
    meta.set("__index", inner)?;
    meta.set(
        "__newindex",
        lua.create_function(|_, _: MultiValue| -> mlua::Result<()> {
            Err(mlua::Error::RuntimeError(READ_ONLY.to_string()))
        })?,
    )?;
    meta.set("__metatable", false)?;
    proxy.set_metatable(Some(meta));
    Ok(proxy)
}

pub(crate) fn byte_table(lua: &Lua, bytes: &[u8]) -> mlua::Result<Table> {
    lua.create_sequence_from(bytes.iter().map(|b| *b as i64))
}

fn print_value(value: &Value) -> Option<String> {
    match value {
        Value::Boolean(b) => Some(b.to_string()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.to_string_lossy().to_string()),
        _ => None,
    }
}

fn install_globals(lua: &Lua, env: &Table, policy: SandboxPolicy) -> mlua::Result<()> {
    env.set(
        "print",
        binding(lua, "usage: print(...: boolean | string | number)", |_, caller, args| {
            if args.len() == 0 {
                return Err(args.usage());
            }
            let mut parts = Vec::with_capacity(args.len());
            for index in 0..args.len() {
                parts.push(print_value(&args.value(index)).ok_or_else(|| args.usage())?);
            }
            caller.report(LogCategory::Print, parts.join(" "));
            nothing()
        })?,
    )?;

    env.set(
        "require",
        binding(lua, "usage: require(library: string): any", |lua, caller, args| {
            let library = args.string(0)?;
            if library == "ffi" {
                return nothing();
            }
            let loaded = sandbox::loaded_libraries(lua)?;
            match loaded.get::<Value>(library.as_str())? {
                Value::Nil => {}
                Value::Boolean(false) => {
                    return Err(BindingError::Usage(format!(
                        "library is required again while loading: {library}"
                    )))
                }
                cached => return ret(lua, cached),
            }
            let lib_dir = crate::scripting::catalog::ScriptKind::Library.dir(&caller.host.borrow().data_dir);
            let path = sandbox::sandboxed_path(&lib_dir, &format!("{library}.lua"))
                .map_err(BindingError::SandboxViolation)?;
            let source = std::fs::read(&path)
                .map_err(|_| BindingError::Usage(format!("library not found: {library}")))?;
            let env = sandbox::environment(lua)?;
            loaded.set(library.as_str(), false)?;
            let result = lua
                .load(source)
                .set_name(format!("=lib/{library}"))
                .set_environment(env)
                .call::<Value>(());
            let value = match result {
                Ok(Value::Nil | Value::Boolean(false)) => Value::Boolean(true),
                Ok(value) => value,
                Err(e) => {
                    loaded.set(library.as_str(), Value::Nil)?;
                    return Err(e.into());
                }
            };
            loaded.set(library.as_str(), value.clone())?;
            ret(lua, value)
        })?,
    )?;

    env.set(
        "loadfile",
        binding(lua, "usage: loadfile(path: string): function", |lua, caller, args| {
            let name = args.string(0)?;
            caller.require_insecure("loadfile")?;
            let path = sandbox::sandboxed_path(&caller.host.borrow().storage_dir(), &name)
                .map_err(BindingError::SandboxViolation)?;
            let source = std::fs::read(&path)
                .map_err(|e| BindingError::Usage(format!("{name}: {e}")))?;
            compile_into_env(lua, source, &name)
        })?,
    )?;

    if policy.allow_insecure {
        let load = binding(lua, "usage: load(chunk: string, name = \"chunk\"): function", |lua, _caller, args| {
            let source = args.bytes(0)?;
            let name = args.opt_string(1)?.unwrap_or_else(|| "chunk".to_string());
            compile_into_env(lua, source, &name)
        })?;
        env.set("loadstring", load.clone())?;
        env.set("load", load)?;

        env.set(
            "dofile",
            binding(lua, "usage: dofile(path: string): any", |lua, caller, args| {
                let name = args.string(0)?;
                caller.require_insecure("dofile")?;
                let path = sandbox::sandboxed_path(&caller.host.borrow().storage_dir(), &name)
                    .map_err(BindingError::SandboxViolation)?;
                let source = std::fs::read(&path)
                    .map_err(|e| BindingError::Usage(format!("{name}: {e}")))?;
                let env = sandbox::environment(lua)?;
                Ok(lua
                    .load(source)
                    .set_name(format!("={name}"))
                    .set_environment(env)
                    .call::<MultiValue>(())?)
            })?,
        )?;
    }
    Ok(())
}

/// Mirrors Lua's `load` contract: a function, or nil plus the error message.
fn compile_into_env(lua: &Lua, source: Vec<u8>, name: &str) -> BindingResult {
    let env = sandbox::environment(lua)?;
    match lua
        .load(source)
        .set_name(format!("={name}"))
        .set_environment(env)
        .into_function()
    {
        Ok(function) => ret(lua, function),
        Err(err) => ret(lua, (Value::Nil, err.to_string())),
    }
}

fn install_global_vars(lua: &Lua, env: &Table) -> mlua::Result<()> {
    let proxy = lua.create_table()?;
    let meta = lua.create_table()?;
    meta.set(
        "__index",
        lua.create_function(|lua, (_, key): (Value, String)| {
            let globals = host_of(lua)?.borrow().globals;
            let value = match key.as_str() {
                "realtime" => mlua::IntoLua::into_lua(globals.realtime, lua)?,
                "curtime" => mlua::IntoLua::into_lua(globals.curtime, lua)?,
                "frametime" => mlua::IntoLua::into_lua(globals.frametime, lua)?,
                "framecount" => mlua::IntoLua::into_lua(globals.framecount as i64, lua)?,
                "interval_per_tick" => mlua::IntoLua::into_lua(globals.interval_per_tick, lua)?,
                _ => Value::Nil,
            };
            Ok(value)
        })?,
    )?;
    meta.set(
        "__newindex",
        lua.create_function(|_, _: MultiValue| -> mlua::Result<()> {
            Err(mlua::Error::RuntimeError(READ_ONLY.to_string()))
        })?,
    )?;
    meta.set("__metatable", false)?;
    proxy.set_metatable(Some(meta));
    env.set("global_vars", proxy)
}

fn install_input(lua: &Lua, env: &Table) -> mlua::Result<()> {
    let input = lua.create_table()?;
    input.set(
        "is_key_down",
        binding(lua, "usage: input.is_key_down(key: number): boolean", |lua, caller, args| {
            let key = args.integer(0)?;
            let down = u32::try_from(key).is_ok_and(|k| caller.host.borrow().input.keys.contains(&k));
            ret(lua, down)
        })?,
    )?;
    input.set(
        "is_mouse_down",
        binding(lua, "usage: input.is_mouse_down(button = 0): boolean", |lua, caller, args| {
            let button = args.opt_integer(0, 0)?;
            let down = u32::try_from(button).is_ok_and(|b| caller.host.borrow().input.mouse.contains(&b));
            ret(lua, down)
        })?,
    )?;
    input.set(
        "get_cursor_pos",
        binding(lua, "usage: input.get_cursor_pos(): number, number", |lua, caller, _args| {
            let (x, y) = caller.host.borrow().input.cursor;
            ret(lua, (x, y))
        })?,
    )?;
    env.set("input", read_only(lua, input)?)
}

/// Installs every namespace and global allowed by `policy` into `env`.
pub(crate) fn install(lua: &Lua, env: &Table, policy: SandboxPolicy) -> mlua::Result<()> {
    install_globals(lua, env, policy)?;
    install_global_vars(lua, env)?;
    install_input(lua, env)?;
    env.set("render", read_only(lua, render::namespace(lua)?)?)?;
    env.set("gui", read_only(lua, gui::namespace(lua)?)?)?;
    env.set("utils", read_only(lua, utils::namespace(lua)?)?)?;
    env.set("fs", read_only(lua, fs::fs_namespace(lua)?)?)?;
    env.set("database", read_only(lua, fs::database_namespace(lua)?)?)?;
    env.set("zip", read_only(lua, zip::namespace(lua)?)?)?;
    Ok(())
}
