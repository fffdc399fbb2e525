use bevy::prelude::*;
use crossbeam_channel::{Receiver, Sender};
use std::time::Duration;

use super::engine::ScriptEngine;
use super::host::{ExecutionLimits, GlobalVars, HostContext};
use crate::cipher::SessionKey;
use crate::config::ConfigStore;
use crate::remote::{self, RemoteSyncEvent};
use crate::settings::LanternSettings;

pub struct ScriptingPlugin;

#[derive(Resource)]
pub struct RemoteSyncReceiver(pub Receiver<RemoteSyncEvent>);

/// Sender side kept so callers (the API) can request another sync.
#[derive(Resource, Clone)]
pub struct RemoteSyncHandle {
    tx: Sender<RemoteSyncEvent>,
    settings: LanternSettings,
}

impl RemoteSyncHandle {
    /// Starts a sync thread. Returns false when no feed is configured.
    pub fn request(&self) -> bool {
        let Some(feed) = self.settings.remote_feed.clone() else {
            return false;
        };
        remote::spawn_sync(
            self.settings.data_dir.clone(),
            feed,
            session_key(&self.settings),
            self.tx.clone(),
        );
        true
    }
}

/// Hex keys are taken as-is; anything else is treated as a passphrase.
pub fn session_key(settings: &LanternSettings) -> Option<SessionKey> {
    settings
        .session_key
        .as_deref()
        .map(|text| SessionKey::from_hex(text).unwrap_or_else(|_| SessionKey::derive(text)))
}

pub fn execution_limits(settings: &LanternSettings) -> ExecutionLimits {
    ExecutionLimits {
        budget: (settings.script_budget_ms > 0).then(|| Duration::from_millis(settings.script_budget_ms)),
        instruction_interval: settings.hook_instruction_interval,
    }
}

pub fn build_engine(settings: &LanternSettings) -> ScriptEngine {
    let config_path = settings.data_dir.join("config.json");
    let mut config = match ConfigStore::open(&config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!("[Lantern scripts] {e}; starting with an empty configuration");
            ConfigStore::default()
        }
    };
    if let Some(allow) = settings.allow_insecure {
        config.allow_insecure = allow;
    }
    let mut host = HostContext::headless(&settings.data_dir);
    host.config = config;
    host.limits = execution_limits(settings);
    host.session_key = session_key(settings);
    let mut engine = ScriptEngine::new(host);
    for name in &settings.extra_forwards {
        engine.create_callback(name);
    }
    engine
}

impl Plugin for ScriptingPlugin {
    fn build(&self, app: &mut App) {
        let settings = app
            .world()
            .get_resource::<LanternSettings>()
            .cloned()
            .unwrap_or_else(LanternSettings::load);
        for kind in [
            super::catalog::ScriptKind::Script,
            super::catalog::ScriptKind::Library,
            super::catalog::ScriptKind::Remote,
        ] {
            if let Err(e) = std::fs::create_dir_all(kind.dir(&settings.data_dir)) {
                warn!("[Lantern scripts] Failed to create {}: {e}", kind.dir(&settings.data_dir).display());
            }
        }

        let (tx, rx) = crossbeam_channel::unbounded::<RemoteSyncEvent>();
        let sync = RemoteSyncHandle {
            tx,
            settings: settings.clone(),
        };

        app.insert_non_send_resource(build_engine(&settings))
            .insert_resource(RemoteSyncReceiver(rx))
            .insert_resource(sync)
            .add_systems(Startup, (load_scripts, start_remote_sync).chain())
            .add_systems(Update, (apply_remote_sync, run_script_frame).chain());
    }
}

fn load_scripts(mut engine: NonSendMut<ScriptEngine>) {
    engine.refresh_catalog();
    if !engine.has_any_script() {
        info!(
            "[Lantern scripts] No scripts found in {}",
            engine.host().borrow().data_dir.join("scripts").display()
        );
    }
    engine.run_autoload();
    info!(
        "[Lantern scripts] {} scripts in catalog, {} running",
        engine.catalog().len(),
        engine.running_ids().len()
    );
}

fn start_remote_sync(sync: Res<RemoteSyncHandle>) {
    if sync.request() {
        info!("[Lantern remote] Sync started");
    }
}

fn apply_remote_sync(receiver: Res<RemoteSyncReceiver>, mut engine: NonSendMut<ScriptEngine>) {
    for event in receiver.0.try_iter() {
        match event {
            RemoteSyncEvent::Finished { report, session_key } => {
                if !report.failed.is_empty() {
                    warn!("[Lantern remote] {} scripts failed to install", report.failed.len());
                }
                if session_key.is_some() {
                    engine.set_session_key(session_key);
                }
                engine.refresh_catalog();
                engine.run_autoload();
            }
            RemoteSyncEvent::Failed(e) => warn!("[Lantern remote] Sync failed: {e}"),
        }
    }
}

fn run_script_frame(time: Res<Time>, mut frames: Local<u64>, mut engine: NonSendMut<ScriptEngine>) {
    *frames += 1;
    let interval_per_tick = engine.host().borrow().globals.interval_per_tick;
    let realtime = time.elapsed_secs_f64();
    engine.run_frame(GlobalVars {
        realtime,
        curtime: realtime,
        frametime: time.delta_secs(),
        framecount: *frames,
        interval_per_tick,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::catalog::{make_id, ScriptKind};
    use crate::scripting::LogCategory;

    fn app_with(data_dir: &std::path::Path, scripts: &[(&str, &str)]) -> App {
        let scripts_dir = ScriptKind::Script.dir(data_dir);
        std::fs::create_dir_all(&scripts_dir).expect("scripts dir");
        for (name, source) in scripts {
            std::fs::write(scripts_dir.join(format!("{name}.lua")), source).expect("write");
        }
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.insert_resource(LanternSettings {
            data_dir: data_dir.to_path_buf(),
            ..Default::default()
        });
        app.add_plugins(ScriptingPlugin);
        app
    }

    #[test]
    fn autoloaded_scripts_paint_every_frame() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id = make_id("painter", ScriptKind::Script);
        std::fs::write(
            dir.path().join("config.json"),
            format!("{{\"entries\":{{}},\"autoload\":[{id}]}}"),
        )
        .expect("config");
        let mut app = app_with(
            dir.path(),
            &[("painter", "function on_paint() print(global_vars.framecount) end")],
        );

        app.update();
        app.update();

        let engine = app.world().non_send_resource::<ScriptEngine>();
        assert_eq!(engine.running_ids(), vec![id]);
        let host = engine.host().borrow();
        assert_eq!(host.log.count(id, LogCategory::Print), 2);
    }

    #[test]
    fn settings_override_stored_policy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = LanternSettings {
            data_dir: dir.path().to_path_buf(),
            allow_insecure: Some(true),
            script_budget_ms: 25,
            session_key: Some("passphrase".to_string()),
            ..Default::default()
        };
        let engine = build_engine(&settings);
        let host = engine.host().borrow();
        assert!(host.allow_insecure());
        assert_eq!(host.limits.budget, Some(Duration::from_millis(25)));
        assert_eq!(host.session_key, Some(SessionKey::derive("passphrase")));
    }

    #[test]
    fn configured_forwards_reach_started_scripts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scripts_dir = ScriptKind::Script.dir(dir.path());
        std::fs::create_dir_all(&scripts_dir).expect("scripts dir");
        std::fs::write(scripts_dir.join("hook.lua"), "function on_bomb_planted() print('planted') end")
            .expect("write");
        let settings = LanternSettings {
            data_dir: dir.path().to_path_buf(),
            extra_forwards: vec!["on_bomb_planted".to_string()],
            ..Default::default()
        };
        let mut engine = build_engine(&settings);
        engine.refresh_catalog();
        let id = make_id("hook", ScriptKind::Script);
        engine.run_script(id).expect("start");

        assert_eq!(engine.callback("on_bomb_planted").invoked, 1);
        assert_eq!(engine.host().borrow().log.count(id, LogCategory::Print), 1);
    }
}
