use bevy::prelude::*;
use crossbeam_channel::{Receiver, Sender};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};

use crate::scripting::ScriptEngine;
use crate::settings::LanternSettings;

pub struct FileWatcherPlugin;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileWatchEvent {
    ScriptChanged(PathBuf),
    ScriptRemoved(PathBuf),
}

#[derive(Resource)]
pub struct FileWatcherReceiver(pub Receiver<FileWatchEvent>);

impl Plugin for FileWatcherPlugin {
    fn build(&self, app: &mut App) {
        let (tx, rx) = crossbeam_channel::unbounded::<FileWatchEvent>();
        app.insert_resource(FileWatcherReceiver(rx));

        let scripts_dir = app
            .world()
            .get_resource::<LanternSettings>()
            .map(LanternSettings::scripts_dir)
            .unwrap_or_else(|| LanternSettings::default().scripts_dir());
        std::thread::spawn(move || {
            run_watcher(tx, scripts_dir);
        });

        app.add_systems(Update, process_file_watch_events);
    }
}

fn run_watcher(tx: Sender<FileWatchEvent>, scripts_dir: PathBuf) {
    let mut watcher: RecommendedWatcher =
        match notify::recommended_watcher(move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                for change in classify(&event) {
                    let _ = tx.send(change);
                }
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                eprintln!("[Lantern FileWatcher] Failed to create watcher: {e}");
                return;
            }
        };

    if let Err(e) = watcher.watch(&scripts_dir, RecursiveMode::Recursive) {
        eprintln!("[Lantern FileWatcher] Failed to watch scripts dir: {e}");
        return;
    }
    println!("[Lantern FileWatcher] Watching scripts: {}", scripts_dir.display());

    // Keep thread alive; the watcher stops when dropped
    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }
}

fn is_lua(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("lua")
}

/// Maps a raw notify event to script changes. Non-Lua paths (the remote
/// cache file, editor swap files) are ignored.
fn classify(event: &NotifyEvent) -> Vec<FileWatchEvent> {
    let make: fn(PathBuf) -> FileWatchEvent = match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => FileWatchEvent::ScriptChanged,
        EventKind::Remove(_) => FileWatchEvent::ScriptRemoved,
        _ => return Vec::new(),
    };
    event
        .paths
        .iter()
        .filter(|path| is_lua(path))
        .cloned()
        .map(make)
        .collect()
}

/// Coalesces every pending change into one catalog refresh per frame.
fn process_file_watch_events(watcher: Option<Res<FileWatcherReceiver>>, mut engine: NonSendMut<ScriptEngine>) {
    let Some(watcher) = watcher else { return };

    let mut changed = false;
    for event in watcher.0.try_iter().take(64) {
        match event {
            FileWatchEvent::ScriptChanged(path) => {
                info!("[Lantern FileWatcher] Script changed: {}", path.display());
                changed = true;
            }
            FileWatchEvent::ScriptRemoved(path) => {
                info!("[Lantern FileWatcher] Script removed: {}", path.display());
                changed = true;
            }
        }
    }
    if changed {
        engine.refresh_catalog();
    }
}
