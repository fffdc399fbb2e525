use super::*;
use axum::extract::{Path, Query};

async fn request<T>(
    state: &AppState,
    make: impl FnOnce(tokio::sync::oneshot::Sender<T>) -> ApiCommand,
) -> Result<T, String> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    state
        .sender
        .send(make(tx))
        .map_err(|_| "Channel closed".to_string())?;
    rx.await.map_err(|_| "Channel closed".to_string())
}

fn respond<T: Serialize>(result: Result<T, String>) -> Json<ApiResponse<T>> {
    match result {
        Ok(data) => Json(ApiResponse::success(data)),
        Err(e) => Json(ApiResponse {
            ok: false,
            data: None,
            error: Some(e),
        }),
    }
}

fn respond_unit(result: Result<Result<(), String>, String>) -> Json<ApiResponse<String>> {
    match result.and_then(|inner| inner) {
        Ok(()) => Json(ApiResponse::ok()),
        Err(e) => Json(ApiResponse::err(e)),
    }
}

pub(super) async fn list_scripts(State(state): State<AppState>) -> Json<ApiResponse<Vec<ScriptStatus>>> {
    respond(request(&state, ApiCommand::ListScripts).await)
}

pub(super) async fn refresh_scripts(State(state): State<AppState>) -> Json<ApiResponse<CatalogSummary>> {
    respond(request(&state, ApiCommand::RefreshScripts).await)
}

pub(super) async fn run_script(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ApiResponse<String>> {
    let id = match parse_script_id(&id) {
        Ok(id) => id,
        Err(e) => return Json(ApiResponse::err(e)),
    };
    respond_unit(request(&state, |tx| ApiCommand::RunScript(id, tx)).await)
}

pub(super) async fn stop_script(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ApiResponse<String>> {
    let id = match parse_script_id(&id) {
        Ok(id) => id,
        Err(e) => return Json(ApiResponse::err(e)),
    };
    respond_unit(request(&state, |tx| ApiCommand::StopScript(id, tx)).await)
}

pub(super) async fn stop_all_scripts(State(state): State<AppState>) -> Json<ApiResponse<usize>> {
    respond(request(&state, ApiCommand::StopAll).await)
}

pub(super) async fn get_script_log(
    State(state): State<AppState>,
    Query(query): Query<ScriptLogQuery>,
) -> Json<ApiResponse<Vec<ScriptLogEntry>>> {
    respond(request(&state, |tx| ApiCommand::GetScriptLog(query, tx)).await)
}

pub(super) async fn get_autoload(State(state): State<AppState>) -> Json<ApiResponse<AutoloadState>> {
    respond(request(&state, ApiCommand::GetAutoload).await)
}

pub(super) async fn enable_autoload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ApiResponse<AutoloadState>> {
    let result = match parse_script_id(&id) {
        Ok(id) => request(&state, |tx| ApiCommand::EnableAutoload(id, tx))
            .await
            .and_then(|inner| inner),
        Err(e) => Err(e),
    };
    respond(result)
}

pub(super) async fn disable_autoload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ApiResponse<AutoloadState>> {
    let result = match parse_script_id(&id) {
        Ok(id) => request(&state, |tx| ApiCommand::DisableAutoload(id, tx)).await,
        Err(e) => Err(e),
    };
    respond(result)
}

pub(super) async fn run_autoload(State(state): State<AppState>) -> Json<ApiResponse<AutoloadState>> {
    respond(request(&state, ApiCommand::RunAutoload).await)
}

pub(super) async fn sync_remote(State(state): State<AppState>) -> Json<ApiResponse<String>> {
    respond_unit(request(&state, ApiCommand::SyncRemote).await)
}
