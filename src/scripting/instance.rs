use mlua::{Function, HookTriggers, Lua, MultiValue, Table, Value, VmState};
use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use super::bindings::{HostHandle, ScriptScope};
use super::catalog::{RemoteInfo, ScriptDescriptor, ScriptKind};
use super::host::{ExecutionLimits, HostContext};
use super::sandbox::{self, SandboxPolicy};
use super::timers::TimerList;
use super::{LogCategory, FORWARDS};
use crate::cipher;
use crate::hash::fnv1a32;

/// Every shared resource a script acquired, by id, so unload can give each
/// one back exactly once.
#[derive(Default)]
pub(crate) struct OwnedResources {
    pub gui_elements: Vec<u64>,
    pub gui_callback_elements: Vec<u64>,
    pub control_callbacks: Vec<(u64, Function)>,
    pub fonts: Vec<u64>,
    pub textures: Vec<u64>,
    pub shaders: Vec<u64>,
    pub animators: Vec<u64>,
    pub timers: TimerList,
}

impl OwnedResources {
    pub fn is_empty(&self) -> bool {
        self.gui_elements.is_empty()
            && self.gui_callback_elements.is_empty()
            && self.control_callbacks.is_empty()
            && self.fonts.is_empty()
            && self.textures.is_empty()
            && self.shaders.is_empty()
            && self.animators.is_empty()
            && self.timers.len() == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    Unloaded,
    Initializing,
    Running,
    Erroring,
    Unloading,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardOutcome {
    Skipped,
    Invoked,
    Failed,
}

type StartError = (LogCategory, String);

/// Runs `f` with the panic guard and, when configured, the instruction-count
/// budget hook installed.
fn protected<T>(lua: &Lua, limits: ExecutionLimits, f: impl FnOnce() -> mlua::Result<T>) -> Result<T, String> {
    if let Some(budget) = limits.budget {
        let started = Instant::now();
        let budget_ms = budget.as_secs_f64() * 1000.0;
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(limits.instruction_interval.max(1)),
            move |_lua, _debug| {
                if started.elapsed() >= budget {
                    return Err(mlua::Error::RuntimeError(format!(
                        "Script execution budget exceeded ({budget_ms:.1}ms)"
                    )));
                }
                Ok(VmState::Continue)
            },
        );
    }
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(f));
    if limits.budget.is_some() {
        lua.remove_hook();
    }
    match outcome {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("interpreter panic: {message}"))
        }
    }
}

/// One loaded script: its own Lua state, the forwards it defines and the
/// resources it has taken from the host.
pub struct ScriptInstance {
    pub id: u32,
    pub name: String,
    pub path: PathBuf,
    pub kind: ScriptKind,
    pub remote: Option<RemoteInfo>,
    state: InstanceState,
    did_error: bool,
    env: Option<Table>,
    main: Option<Function>,
    forwards: BTreeMap<u32, String>,
    owned: Rc<RefCell<OwnedResources>>,
    // Dropped last so every handle above is released first.
    lua: Option<Lua>,
}

impl ScriptInstance {
    pub fn new(descriptor: &ScriptDescriptor) -> Self {
        Self {
            id: descriptor.id,
            name: descriptor.display_name().to_string(),
            path: descriptor.path.clone(),
            kind: descriptor.kind,
            remote: descriptor.remote.clone(),
            state: InstanceState::Unloaded,
            did_error: false,
            env: None,
            main: None,
            forwards: BTreeMap::new(),
            owned: Rc::new(RefCell::new(OwnedResources::default())),
            lua: None,
        }
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }

    pub fn did_error(&self) -> bool {
        self.did_error
    }

    pub fn has_forward(&self, name: &str) -> bool {
        self.forwards.contains_key(&fnv1a32(name))
    }

    pub(crate) fn owned(&self) -> Ref<'_, OwnedResources> {
        self.owned.borrow()
    }

    fn is_proprietary(&self) -> bool {
        self.remote.as_ref().is_some_and(|r| r.is_proprietary)
    }

    /// Initializes the state and runs the main chunk. Failures are logged
    /// and leave the instance erroring, ready to be unloaded.
    pub fn start(&mut self, host: &Rc<RefCell<HostContext>>, extra_forwards: &[String]) -> Result<(), String> {
        let result = self
            .initialize(host)
            .and_then(|()| self.call_main(host, extra_forwards));
        if let Err((category, message)) = result {
            host.borrow_mut()
                .report(self.id, &self.name, category, message.clone());
            self.did_error = true;
            self.state = InstanceState::Erroring;
            return Err(message);
        }
        Ok(())
    }

    fn read_source(&self, host: &Rc<RefCell<HostContext>>) -> Result<Vec<u8>, StartError> {
        let source = std::fs::read(&self.path)
            .map_err(|_| (LogCategory::InitError, "File not found.".to_string()))?;
        if !self.is_proprietary() && !cipher::is_sealed(&source) {
            return Ok(source);
        }
        let key = host.borrow().session_key.ok_or_else(|| {
            (
                LogCategory::InitError,
                "Session key is not available; cannot decrypt script.".to_string(),
            )
        })?;
        cipher::open(&key, &source).map_err(|e| (LogCategory::InitError, e))
    }

    fn initialize(&mut self, host: &Rc<RefCell<HostContext>>) -> Result<(), StartError> {
        self.state = InstanceState::Initializing;
        self.did_error = false;
        let source = self.read_source(host)?;

        let init_error = |e: mlua::Error| (LogCategory::InitError, e.to_string());
        let lua = sandbox::new_state().map_err(init_error)?;
        lua.set_app_data(HostHandle(host.clone()));
        lua.set_app_data(ScriptScope {
            id: self.id,
            name: self.name.clone(),
            owned: Rc::downgrade(&self.owned),
        });
        let policy = SandboxPolicy {
            allow_insecure: host.borrow().allow_insecure(),
        };
        let env = sandbox::build_environment(&lua, policy).map_err(init_error)?;
        let main = lua
            .load(source)
            .set_name(format!("={}", self.name))
            .set_environment(env.clone())
            .into_function()
            .map_err(|e| (LogCategory::SyntaxError, e.to_string()));
        self.lua = Some(lua);
        self.env = Some(env);
        self.main = Some(main?);
        Ok(())
    }

    fn call_main(&mut self, host: &Rc<RefCell<HostContext>>, extra_forwards: &[String]) -> Result<(), StartError> {
        let (Some(lua), Some(env), Some(main)) = (self.lua.clone(), self.env.clone(), self.main.clone()) else {
            return Err((LogCategory::InitError, "script state is missing".to_string()));
        };
        let limits = host.borrow().limits;
        protected(&lua, limits, || main.call::<()>(()))
            .map_err(|message| (LogCategory::RuntimeError, message))?;

        self.forwards.clear();
        let names = FORWARDS.iter().copied().chain(extra_forwards.iter().map(String::as_str));
        for name in names {
            if let Ok(Value::Function(_)) = env.get::<Value>(name) {
                self.forwards.insert(fnv1a32(name), name.to_string());
            }
        }
        self.state = InstanceState::Running;
        Ok(())
    }

    /// Records `name` as a forward if the script's environment defines it.
    pub fn register_forward(&mut self, name: &str) -> bool {
        let defined = self
            .env
            .as_ref()
            .is_some_and(|env| matches!(env.get::<Value>(name), Ok(Value::Function(_))));
        if defined {
            self.forwards.insert(fnv1a32(name), name.to_string());
        }
        defined
    }

    fn fail(&mut self, host: &Rc<RefCell<HostContext>>, message: String) {
        self.did_error = true;
        self.state = InstanceState::Erroring;
        host.borrow_mut()
            .report(self.id, &self.name, LogCategory::RuntimeError, message);
    }

    /// Calls the forward with hash `hash` if this script defines it. Results
    /// are handed to `consume` only when at least `expected` values came back.
    pub fn call_forward(
        &mut self,
        host: &Rc<RefCell<HostContext>>,
        hash: u32,
        args: &dyn Fn(&Lua) -> mlua::Result<MultiValue>,
        expected: usize,
        consume: &mut dyn FnMut(&Lua, MultiValue),
    ) -> ForwardOutcome {
        if self.state != InstanceState::Running {
            return ForwardOutcome::Skipped;
        }
        let Some(name) = self.forwards.get(&hash) else {
            return ForwardOutcome::Skipped;
        };
        let (Some(lua), Some(env)) = (self.lua.clone(), self.env.as_ref()) else {
            return ForwardOutcome::Skipped;
        };
        let Ok(Value::Function(function)) = env.get::<Value>(name.as_str()) else {
            return ForwardOutcome::Skipped;
        };
        let limits = host.borrow().limits;
        let result = protected(&lua, limits, || {
            let values = function.call::<MultiValue>(args(&lua)?)?;
            if values.len() < expected {
                return Err(mlua::Error::RuntimeError("Not enough return values.".to_string()));
            }
            Ok(values)
        });
        match result {
            Ok(values) => {
                consume(&lua, values);
                ForwardOutcome::Invoked
            }
            Err(message) => {
                self.fail(host, message);
                ForwardOutcome::Failed
            }
        }
    }

    fn call_all(&mut self, host: &Rc<RefCell<HostContext>>, callbacks: Vec<Function>) {
        let Some(lua) = self.lua.clone() else {
            return;
        };
        let limits = host.borrow().limits;
        for callback in callbacks {
            if self.state != InstanceState::Running {
                break;
            }
            if let Err(message) = protected(&lua, limits, || callback.call::<()>(())) {
                self.fail(host, message);
            }
        }
    }

    pub fn run_timers(&mut self, host: &Rc<RefCell<HostContext>>, now: f64) {
        if self.state != InstanceState::Running {
            return;
        }
        let due: Vec<Function> = self
            .owned
            .borrow_mut()
            .timers
            .take_due(now)
            .into_iter()
            .map(|(_, callback)| callback)
            .collect();
        self.call_all(host, due);
    }

    pub fn fire_control_callbacks(&mut self, host: &Rc<RefCell<HostContext>>, control_id: u64) {
        if self.state != InstanceState::Running {
            return;
        }
        let callbacks: Vec<Function> = self
            .owned
            .borrow()
            .control_callbacks
            .iter()
            .filter(|(id, _)| *id == control_id)
            .map(|(_, callback)| callback.clone())
            .collect();
        self.call_all(host, callbacks);
    }

    /// Tears the script down: `on_shutdown` (skipped after an error), then
    /// GUI controls, callbacks, render handles, animators and timers, and
    /// finally the Lua state itself.
    pub fn unload(&mut self, host: &Rc<RefCell<HostContext>>) {
        if self.state == InstanceState::Unloaded && self.lua.is_none() {
            return;
        }
        if self.state == InstanceState::Running && !self.did_error {
            let hash = fnv1a32("on_shutdown");
            let outcome = self.call_forward(host, hash, &|_| Ok(MultiValue::new()), 0, &mut |_, _| {});
            if outcome == ForwardOutcome::Failed {
                self.did_error = true;
            }
        }
        self.state = InstanceState::Unloading;

        let OwnedResources {
            gui_elements,
            gui_callback_elements,
            control_callbacks,
            fonts,
            textures,
            shaders,
            animators,
            mut timers,
        } = std::mem::take(&mut *self.owned.borrow_mut());

        {
            let mut guard = host.borrow_mut();
            let host = &mut *guard;
            for id in &gui_elements {
                host.gui.remove_hotkey(*id);
                host.gui.remove(*id);
            }
            if !gui_elements.is_empty() {
                host.gui.process_queues();
                host.gui.reset();
            }
            drop(gui_callback_elements);
            drop(control_callbacks);

            for (ids, table) in [
                (fonts, &mut host.fonts),
                (textures, &mut host.textures),
                (shaders, &mut host.shaders),
            ] {
                for id in ids {
                    if let Some(handle) = table.take(id) {
                        host.renderer.destroy(handle);
                    }
                }
            }
            for id in animators {
                host.animators.take(id);
            }
            timers.clear();
        }

        self.forwards.clear();
        self.main = None;
        self.env = None;
        if let Some(lua) = self.lua.take() {
            lua.remove_app_data::<ScriptScope>();
            lua.remove_app_data::<HostHandle>();
        }
        self.state = InstanceState::Unloaded;
    }
}
