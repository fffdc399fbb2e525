use bevy::prelude::Resource;
use serde::Deserialize;
use std::path::PathBuf;

pub const DEFAULT_API_PORT: u16 = 3917;
pub const DEFAULT_API_RATE_LIMIT_PER_SEC: u32 = 30;
pub const DEFAULT_SCRIPT_HOOK_INSTRUCTION_INTERVAL: u32 = 10_000;

/// Startup settings. `lantern.json` is read first and env vars win.
#[derive(Resource, Clone, Debug)]
pub struct LanternSettings {
    pub data_dir: PathBuf,
    pub allow_insecure: Option<bool>,
    /// Per-forward wall clock budget. Zero disables the instruction hook.
    pub script_budget_ms: u64,
    pub hook_instruction_interval: u32,
    pub api_port: u16,
    /// Bearer token required for API calls that change engine state.
    pub api_token: Option<String>,
    pub api_rate_limit_per_sec: u32,
    pub remote_feed: Option<PathBuf>,
    pub session_key: Option<String>,
    /// Forward names scanned in addition to the built-in list.
    pub extra_forwards: Vec<String>,
}

impl Default for LanternSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("lantern_data"),
            allow_insecure: None,
            script_budget_ms: 0,
            hook_instruction_interval: DEFAULT_SCRIPT_HOOK_INSTRUCTION_INTERVAL,
            api_port: DEFAULT_API_PORT,
            api_token: None,
            api_rate_limit_per_sec: DEFAULT_API_RATE_LIMIT_PER_SEC,
            remote_feed: None,
            session_key: None,
            extra_forwards: Vec::new(),
        }
    }
}

#[derive(Deserialize, Default)]
struct SettingsFile {
    data_dir: Option<String>,
    allow_insecure: Option<bool>,
    script_budget_ms: Option<u64>,
    hook_instruction_interval: Option<u32>,
    api_port: Option<u16>,
    api_token: Option<String>,
    api_rate_limit_per_sec: Option<u32>,
    remote_feed: Option<String>,
    session_key: Option<String>,
    #[serde(default)]
    extra_forwards: Vec<String>,
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|value| value.parse::<u64>().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    env_string(name).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn read_settings_file() -> SettingsFile {
    let path = env_string("LANTERN_CONFIG").unwrap_or_else(|| "lantern.json".to_string());
    match std::fs::read_to_string(&path) {
        Ok(contents) => match serde_json::from_str::<SettingsFile>(&contents) {
            Ok(file) => {
                println!("[Lantern] Loaded settings from {}", path);
                file
            }
            Err(e) => {
                eprintln!("[Lantern] Failed to parse {}: {}", path, e);
                SettingsFile::default()
            }
        },
        Err(_) => SettingsFile::default(),
    }
}

impl LanternSettings {
    pub fn load() -> Self {
        let file = read_settings_file();
        let defaults = Self::default();
        Self {
            data_dir: env_string("LANTERN_DATA_DIR")
                .or(file.data_dir)
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            allow_insecure: env_bool("LANTERN_ALLOW_INSECURE").or(file.allow_insecure),
            script_budget_ms: env_u64("LANTERN_SCRIPT_BUDGET_MS")
                .or(file.script_budget_ms)
                .unwrap_or(defaults.script_budget_ms),
            hook_instruction_interval: env_u64("LANTERN_SCRIPT_HOOK_INSTRUCTION_INTERVAL")
                .map(|v| v as u32)
                .or(file.hook_instruction_interval)
                .unwrap_or(defaults.hook_instruction_interval)
                .clamp(100, 1_000_000),
            api_port: env_u64("LANTERN_API_PORT")
                .and_then(|v| u16::try_from(v).ok())
                .or(file.api_port)
                .unwrap_or(defaults.api_port),
            api_token: env_string("LANTERN_API_TOKEN").or(file.api_token),
            api_rate_limit_per_sec: env_u64("LANTERN_API_RATE_LIMIT_PER_SEC")
                .and_then(|v| u32::try_from(v).ok())
                .or(file.api_rate_limit_per_sec)
                .unwrap_or(defaults.api_rate_limit_per_sec),
            remote_feed: env_string("LANTERN_REMOTE_FEED")
                .or(file.remote_feed)
                .map(PathBuf::from),
            session_key: env_string("LANTERN_SESSION_KEY").or(file.session_key),
            extra_forwards: env_string("LANTERN_EXTRA_FORWARDS")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(file.extra_forwards),
        }
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.data_dir.join("scripts")
    }
}
