use bevy::prelude::*;
use mlua::{Lua, MultiValue};
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;

use super::catalog::{self, ScriptDescriptor, ScriptKind};
use super::host::{GlobalVars, HostContext};
use super::instance::{ForwardOutcome, InstanceState, ScriptInstance};
use super::{LogCategory, FORWARDS};
use crate::cipher::SessionKey;
use crate::hash::fnv1a32;

#[cfg(test)]
mod tests;

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

#[derive(Serialize, Clone, Debug)]
pub struct ScriptStatus {
    pub id: u32,
    pub name: String,
    pub kind: ScriptKind,
    pub author: Option<String>,
    pub description: Option<String>,
    pub running: bool,
    pub erroring: bool,
    pub autoload: bool,
    pub proprietary: bool,
}

/// Registry of the script catalog and the running instances. Lives on the
/// main thread as a non-send resource; `&mut self` serializes every
/// mutation and every script call.
pub struct ScriptEngine {
    host: Rc<RefCell<HostContext>>,
    running: Vec<ScriptInstance>,
    catalog: Vec<ScriptDescriptor>,
    autoload: Vec<u32>,
    extra_forwards: Vec<String>,
}

impl ScriptEngine {
    pub fn new(host: HostContext) -> Self {
        let autoload = host.config.autoload.clone();
        Self {
            host: Rc::new(RefCell::new(host)),
            running: Vec::new(),
            catalog: Vec::new(),
            autoload,
            extra_forwards: Vec::new(),
        }
    }

    pub fn host(&self) -> &Rc<RefCell<HostContext>> {
        &self.host
    }

    pub fn catalog(&self) -> &[ScriptDescriptor] {
        &self.catalog
    }

    /// Rebuilds the catalog from disk, then unloads instances whose file is
    /// gone and instances that errored since the last pass.
    pub fn refresh_catalog(&mut self) {
        let data_dir = self.host.borrow().data_dir.clone();
        self.catalog = catalog::scan(&data_dir);
        let stale: Vec<u32> = self
            .running
            .iter()
            .filter(|instance| !self.catalog.iter().any(|d| d.id == instance.id))
            .map(|instance| instance.id)
            .collect();
        for id in stale {
            info!("[Lantern scripts] Unloading script {id:#010x}: its file is gone");
            self.stop_script(id);
        }
        self.maintain();
    }

    pub fn find_script_file(&self, id: u32) -> Option<&ScriptDescriptor> {
        self.catalog.iter().find(|d| d.id == id)
    }

    pub fn find_by_id(&self, id: u32) -> Option<&ScriptInstance> {
        self.running.iter().find(|instance| instance.id == id)
    }

    pub fn exists(&self, id: u32) -> bool {
        self.find_script_file(id).is_some()
    }

    /// Visits every runnable descriptor; libraries are skipped.
    pub fn for_each_script(&self, mut f: impl FnMut(&ScriptDescriptor)) {
        for descriptor in self.catalog.iter().filter(|d| d.kind != ScriptKind::Library) {
            f(descriptor);
        }
    }

    pub fn has_any_script(&self) -> bool {
        self.catalog.iter().any(|d| d.kind != ScriptKind::Library)
    }

    pub fn running_ids(&self) -> Vec<u32> {
        self.running.iter().map(|instance| instance.id).collect()
    }

    pub fn statuses(&self) -> Vec<ScriptStatus> {
        let mut statuses = Vec::new();
        self.for_each_script(|descriptor| {
            let instance = self.find_by_id(descriptor.id);
            statuses.push(ScriptStatus {
                id: descriptor.id,
                name: descriptor.display_name().to_string(),
                kind: descriptor.kind,
                author: descriptor.metadata.author.clone(),
                description: descriptor.metadata.description.clone(),
                running: instance.is_some_and(ScriptInstance::is_running),
                erroring: instance.is_some_and(|i| i.state() == InstanceState::Erroring),
                autoload: self.is_autoload_enabled(descriptor.id),
                proprietary: descriptor.is_proprietary(),
            });
        });
        statuses
    }

    pub fn run_script(&mut self, id: u32) -> Result<(), String> {
        let descriptor = self
            .find_script_file(id)
            .cloned()
            .ok_or_else(|| format!("Unknown script {id:#010x}"))?;
        if descriptor.kind == ScriptKind::Library {
            return Err("Libraries cannot be run directly.".to_string());
        }
        if !descriptor.path.is_file() {
            self.host.borrow_mut().report(
                id,
                descriptor.display_name(),
                LogCategory::InitError,
                "File not found.".to_string(),
            );
            return Err("File not found.".to_string());
        }
        self.stop_script(id);

        let mut instance = ScriptInstance::new(&descriptor);
        if let Err(message) = instance.start(&self.host, &self.extra_forwards) {
            instance.unload(&self.host);
            warn!("[Lantern scripts] {} failed to start: {message}", descriptor.display_name());
            return Err("Unable to initialize script.".to_string());
        }
        info!("[Lantern scripts] Started {}", descriptor.display_name());
        self.running.push(instance);
        Ok(())
    }

    pub fn stop_script(&mut self, id: u32) -> bool {
        let Some(position) = self.running.iter().position(|instance| instance.id == id) else {
            return false;
        };
        let mut instance = self.running.remove(position);
        instance.unload(&self.host);
        true
    }

    pub fn stop_all(&mut self) {
        for mut instance in std::mem::take(&mut self.running) {
            instance.unload(&self.host);
        }
    }

    /// Calls `event` on every running instance in start order. A failing
    /// instance is marked erroring and the loop moves on; reaping happens
    /// in [`ScriptEngine::maintain`].
    pub fn dispatch(
        &mut self,
        event: u32,
        args: &dyn Fn(&Lua) -> mlua::Result<MultiValue>,
        expected: usize,
        consume: &mut dyn FnMut(&Lua, MultiValue),
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        for instance in &mut self.running {
            match instance.call_forward(&self.host, event, args, expected, consume) {
                ForwardOutcome::Invoked => report.invoked += 1,
                ForwardOutcome::Failed => report.failed += 1,
                ForwardOutcome::Skipped => {}
            }
        }
        report
    }

    pub fn callback(&mut self, forward: &str) -> DispatchReport {
        self.dispatch(fnv1a32(forward), &|_| Ok(MultiValue::new()), 0, &mut |_, _| {})
    }

    /// Adds a forward name past the built-in list; running instances that
    /// define it start receiving it immediately.
    pub fn create_callback(&mut self, name: &str) {
        if !FORWARDS.contains(&name) && !self.extra_forwards.iter().any(|f| f == name) {
            self.extra_forwards.push(name.to_string());
        }
        for instance in &mut self.running {
            if !instance.has_forward(name) {
                instance.register_forward(name);
            }
        }
    }

    pub fn run_timers(&mut self, now: f64) {
        for instance in &mut self.running {
            instance.run_timers(&self.host, now);
        }
    }

    pub fn fire_control_callbacks(&mut self, control_id: u64) {
        for instance in &mut self.running {
            instance.fire_control_callbacks(&self.host, control_id);
        }
    }

    /// Unloads instances that errored. Never runs while a forward is on the stack.
    pub fn maintain(&mut self) {
        let erroring: Vec<u32> = self
            .running
            .iter()
            .filter(|instance| instance.state() == InstanceState::Erroring)
            .map(|instance| instance.id)
            .collect();
        for id in erroring {
            self.stop_script(id);
        }
    }

    /// One host frame: timers, then `on_paint` into a fresh draw target.
    pub fn run_frame(&mut self, globals: GlobalVars) -> DispatchReport {
        {
            let mut host = self.host.borrow_mut();
            host.globals = globals;
            let surface = host.renderer.acquire_draw_target(globals.framecount);
            host.surface = surface;
        }
        self.run_timers(globals.realtime);
        let report = self.callback("on_paint");
        {
            let mut host = self.host.borrow_mut();
            let surface = std::mem::take(&mut host.surface);
            host.renderer.submit(surface);
        }
        self.maintain();
        report
    }

    pub fn set_session_key(&mut self, key: Option<SessionKey>) {
        self.host.borrow_mut().session_key = key;
    }

    /// Converges the running set onto the configured autoload list.
    pub fn run_autoload(&mut self) {
        self.autoload = self.host.borrow().config.autoload.clone();
        let unwanted: Vec<u32> = self
            .running_ids()
            .into_iter()
            .filter(|id| !self.autoload.contains(id))
            .collect();
        for id in unwanted {
            self.stop_script(id);
        }
        for id in self.autoload.clone() {
            let Some(descriptor) = self.find_script_file(id) else {
                continue;
            };
            let name = descriptor.display_name().to_string();
            if self.find_by_id(id).is_some_and(ScriptInstance::is_running) {
                continue;
            }
            if self.run_script(id).is_ok() {
                self.host
                    .borrow_mut()
                    .gui
                    .notify("Autoload", &format!("Loaded {name}"));
            }
        }
    }

    pub fn enable_autoload(&mut self, id: u32) {
        if self.autoload.contains(&id) {
            return;
        }
        self.autoload.push(id);
        self.sync_autoload();
    }

    pub fn disable_autoload(&mut self, id: u32) {
        self.autoload.retain(|entry| *entry != id);
        self.sync_autoload();
    }

    pub fn is_autoload_enabled(&self, id: u32) -> bool {
        self.autoload.contains(&id)
    }

    pub fn autoload_ids(&self) -> &[u32] {
        &self.autoload
    }

    /// Writes the autoload list back into the configuration store.
    pub fn sync_autoload(&mut self) {
        let mut host = self.host.borrow_mut();
        host.config.autoload = self.autoload.clone();
        if let Err(err) = host.config.save() {
            warn!("[Lantern scripts] Failed to save autoload list: {err}");
        }
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        self.stop_all();
    }
}
