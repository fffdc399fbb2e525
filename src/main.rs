mod api;
mod archive;
mod cipher;
mod config;
mod file_watcher;
mod gui;
mod hash;
mod remote;
mod render;
mod scripting;
mod settings;

use bevy::app::ScheduleRunnerPlugin;
use bevy::prelude::*;
use std::time::Duration;

use scripting::DEFAULT_INTERVAL_PER_TICK;
use settings::LanternSettings;

fn main() {
    let settings = LanternSettings::load();
    println!("[Lantern] Data directory: {}", settings.data_dir.display());
    if settings.script_budget_ms > 0 {
        println!(
            "[Lantern] Script budget: {}ms (hook every {} instructions)",
            settings.script_budget_ms, settings.hook_instruction_interval
        );
    }

    let mut app = App::new();
    app.add_plugins(
        MinimalPlugins.set(ScheduleRunnerPlugin::run_loop(Duration::from_secs_f32(
            DEFAULT_INTERVAL_PER_TICK,
        ))),
    )
    .add_plugins(bevy::log::LogPlugin::default())
    .insert_resource(settings)
    .add_plugins(scripting::ScriptingPlugin)
    .add_plugins(file_watcher::FileWatcherPlugin)
    .add_plugins(api::ApiPlugin);

    app.run();
}
