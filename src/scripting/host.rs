use bevy::prelude::*;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::animator::Animator;
use super::slots::ResourceTable;
use super::{LogCategory, ScriptLogEntry, DEFAULT_INTERVAL_PER_TICK};
use crate::cipher::SessionKey;
use crate::config::ConfigStore;
use crate::gui::{GuiTree, MemoryGui};
use crate::render::{DrawList, RecordingRenderer, RenderBackend, RenderHandle};

const MAX_LOG_ENTRIES: usize = 200;

#[derive(Default)]
pub struct ScriptLog {
    entries: VecDeque<ScriptLogEntry>,
}

impl ScriptLog {
    pub fn push(&mut self, entry: ScriptLogEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &ScriptLogEntry> {
        self.entries.iter()
    }

    pub fn count(&self, script_id: u32, category: LogCategory) -> usize {
        self.entries
            .iter()
            .filter(|e| e.script_id == script_id && e.category == category)
            .count()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalVars {
    pub realtime: f64,
    pub curtime: f64,
    pub frametime: f32,
    pub framecount: u64,
    pub interval_per_tick: f32,
}

#[derive(Default, Debug)]
pub struct InputState {
    pub keys: HashSet<u32>,
    pub mouse: HashSet<u32>,
    pub cursor: (f32, f32),
}

#[derive(Clone, Copy, Debug)]
pub struct ExecutionLimits {
    pub budget: Option<Duration>,
    pub instruction_interval: u32,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            budget: None,
            instruction_interval: crate::settings::DEFAULT_SCRIPT_HOOK_INSTRUCTION_INTERVAL,
        }
    }
}

/// Everything bindings may touch, built once at startup and shared with every
/// script through the engine instead of process-wide singletons.
pub struct HostContext {
    pub data_dir: PathBuf,
    pub config: ConfigStore,
    pub gui: Box<dyn GuiTree>,
    pub renderer: Box<dyn RenderBackend>,
    pub surface: DrawList,
    pub fonts: ResourceTable<RenderHandle>,
    pub textures: ResourceTable<RenderHandle>,
    pub shaders: ResourceTable<RenderHandle>,
    pub animators: ResourceTable<Animator>,
    pub log: ScriptLog,
    pub globals: GlobalVars,
    pub input: InputState,
    pub session_key: Option<SessionKey>,
    pub limits: ExecutionLimits,
    pub rng: SmallRng,
}

impl HostContext {
    pub fn new(
        data_dir: PathBuf,
        config: ConfigStore,
        gui: Box<dyn GuiTree>,
        renderer: Box<dyn RenderBackend>,
    ) -> Self {
        Self {
            data_dir,
            config,
            gui,
            renderer,
            surface: DrawList::default(),
            fonts: ResourceTable::default(),
            textures: ResourceTable::default(),
            shaders: ResourceTable::default(),
            animators: ResourceTable::default(),
            log: ScriptLog::default(),
            globals: GlobalVars {
                interval_per_tick: DEFAULT_INTERVAL_PER_TICK,
                ..Default::default()
            },
            input: InputState::default(),
            session_key: None,
            limits: ExecutionLimits::default(),
            rng: SmallRng::from_entropy(),
        }
    }

    /// In-memory GUI and recording renderer over `data_dir`.
    pub fn headless(data_dir: &Path) -> Self {
        Self::new(
            data_dir.to_path_buf(),
            ConfigStore::default(),
            Box::new(MemoryGui::with_default_layout()),
            Box::new(RecordingRenderer::default()),
        )
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.data_dir.join("storage")
    }

    pub fn database_dir(&self) -> PathBuf {
        self.data_dir.join("database")
    }

    pub fn report(&mut self, script_id: u32, script_name: &str, category: LogCategory, message: String) {
        match category {
            LogCategory::Print => info!("[Lantern scripts] {script_name}: {message}"),
            LogCategory::Warning
            | LogCategory::UsageError
            | LogCategory::PolicyDenied
            | LogCategory::ResourceExhausted => {
                warn!("[Lantern scripts] {script_name} ({}): {message}", category.tag())
            }
            _ => error!("[Lantern scripts] {script_name} ({}): {message}", category.tag()),
        }
        self.log.push(ScriptLogEntry {
            script_id,
            script_name: script_name.to_string(),
            category,
            message,
            frame: self.globals.framecount,
        });
    }

    pub fn allow_insecure(&self) -> bool {
        self.config.allow_insecure
    }
}
