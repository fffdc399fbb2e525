
use super::*;
use crate::scripting::catalog::ScriptKind;
use crate::scripting::plugin::RemoteSyncHandle;

fn autoload_state(engine: &ScriptEngine) -> AutoloadState {
    AutoloadState {
        ids: engine.autoload_ids().to_vec(),
        running: engine.running_ids(),
    }
}

fn catalog_summary(engine: &ScriptEngine) -> CatalogSummary {
    let libraries = engine
        .catalog()
        .iter()
        .filter(|d| d.kind == ScriptKind::Library)
        .count();
    CatalogSummary {
        scripts: engine.catalog().len() - libraries,
        libraries,
        running: engine.running_ids(),
    }
}

fn script_log(engine: &ScriptEngine, query: &ScriptLogQuery) -> Vec<ScriptLogEntry> {
    let host = engine.host().borrow();
    let mut entries: Vec<ScriptLogEntry> = host
        .log
        .entries()
        .filter(|e| query.script_id.map_or(true, |id| e.script_id == id))
        .filter(|e| !query.errors_only || e.category.is_error())
        .cloned()
        .collect();
    if let Some(limit) = query.limit {
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
    }
    entries
}

/// Drains API commands once per frame. Runs on the main thread because the
/// engine is a non-send resource.
pub(super) fn process_api_commands(
    channels: Res<ApiChannels>,
    sync: Option<Res<RemoteSyncHandle>>,
    mut engine: NonSendMut<ScriptEngine>,
) {
    for command in channels.receiver.try_iter() {
        match command {
            ApiCommand::ListScripts(tx) => {
                let _ = tx.send(engine.statuses());
            }
            ApiCommand::RefreshScripts(tx) => {
                engine.refresh_catalog();
                let _ = tx.send(catalog_summary(&engine));
            }
            ApiCommand::RunScript(id, tx) => {
                let _ = tx.send(engine.run_script(id));
            }
            ApiCommand::StopScript(id, tx) => {
                let result = if engine.stop_script(id) {
                    Ok(())
                } else {
                    Err(format!("Script {id:#010x} is not running"))
                };
                let _ = tx.send(result);
            }
            ApiCommand::StopAll(tx) => {
                let stopped = engine.running_ids().len();
                engine.stop_all();
                let _ = tx.send(stopped);
            }
            ApiCommand::GetScriptLog(query, tx) => {
                let _ = tx.send(script_log(&engine, &query));
            }
            ApiCommand::GetAutoload(tx) => {
                let _ = tx.send(autoload_state(&engine));
            }
            ApiCommand::EnableAutoload(id, tx) => {
                let result = match engine.find_script_file(id).map(|d| d.kind) {
                    None => Err(format!("Unknown script {id:#010x}")),
                    Some(ScriptKind::Library) => Err("Libraries cannot be autoloaded.".to_string()),
                    Some(_) => {
                        engine.enable_autoload(id);
                        Ok(autoload_state(&engine))
                    }
                };
                let _ = tx.send(result);
            }
            ApiCommand::DisableAutoload(id, tx) => {
                engine.disable_autoload(id);
                let _ = tx.send(autoload_state(&engine));
            }
            ApiCommand::RunAutoload(tx) => {
                engine.run_autoload();
                let _ = tx.send(autoload_state(&engine));
            }
            ApiCommand::SyncRemote(tx) => {
                let started = sync.as_deref().is_some_and(RemoteSyncHandle::request);
                let result = if started {
                    Ok(())
                } else {
                    Err("No remote feed is configured".to_string())
                };
                let _ = tx.send(result);
            }
        }
    }
}
