use super::*;

type Reply<T> = tokio::sync::oneshot::Sender<T>;

/// Commands sent from API -> Bevy
pub enum ApiCommand {
    ListScripts(Reply<Vec<ScriptStatus>>),
    RefreshScripts(Reply<CatalogSummary>),
    RunScript(u32, Reply<Result<(), String>>),
    StopScript(u32, Reply<Result<(), String>>),
    StopAll(Reply<usize>),
    GetScriptLog(ScriptLogQuery, Reply<Vec<ScriptLogEntry>>),
    GetAutoload(Reply<AutoloadState>),
    EnableAutoload(u32, Reply<Result<AutoloadState, String>>),
    DisableAutoload(u32, Reply<AutoloadState>),
    RunAutoload(Reply<AutoloadState>),
    SyncRemote(Reply<Result<(), String>>),
}
