pub(crate) mod animator;
pub(crate) mod bindings;
pub mod catalog;
pub mod engine;
pub mod host;
pub mod instance;
pub mod plugin;
pub(crate) mod sandbox;
pub mod slots;
pub(crate) mod timers;

use serde::Serialize;

pub use engine::{DispatchReport, ScriptEngine};
pub use plugin::ScriptingPlugin;

pub const DEFAULT_INTERVAL_PER_TICK: f32 = 1.0 / 64.0;

/// Well-known forward names scanned once after a script's main chunk runs.
pub const FORWARDS: &[&str] = &[
    "on_paint",
    "on_paint_traverse",
    "on_frame_stage_notify",
    "on_setup_move",
    "on_run_command",
    "on_create_move",
    "on_level_init",
    "on_do_post_screen_space_events",
    "on_input",
    "on_game_event",
    "on_shutdown",
    "on_config_load",
    "on_config_save",
    "on_shot_registered",
    "on_console_input",
    "on_esp_flags",
    "on_draw_model_execute",
];

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    SyntaxError,
    RuntimeError,
    UsageError,
    SandboxViolation,
    PolicyDenied,
    ResourceExhausted,
    InitError,
    Print,
    Warning,
}

impl LogCategory {
    pub fn tag(self) -> &'static str {
        match self {
            LogCategory::SyntaxError => "syntax_error",
            LogCategory::RuntimeError => "runtime_error",
            LogCategory::UsageError => "usage_error",
            LogCategory::SandboxViolation => "sandbox_violation",
            LogCategory::PolicyDenied => "policy_denied",
            LogCategory::ResourceExhausted => "resource_exhausted",
            LogCategory::InitError => "init_error",
            LogCategory::Print => "print",
            LogCategory::Warning => "warning",
        }
    }

    pub fn is_error(self) -> bool {
        !matches!(self, LogCategory::Print | LogCategory::Warning)
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct ScriptLogEntry {
    pub script_id: u32,
    pub script_name: String,
    pub category: LogCategory,
    pub message: String,
    pub frame: u64,
}
