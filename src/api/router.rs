use super::*;

pub(super) fn build_router(state: AppState, security: ApiSecurity) -> Router {
    Router::new()
        .route("/scripts", get(list_scripts))
        .route("/scripts/refresh", post(refresh_scripts))
        .route("/scripts/stop_all", post(stop_all_scripts))
        .route("/scripts/log", get(get_script_log))
        .route("/scripts/{id}/run", post(run_script))
        .route("/scripts/{id}/stop", post(stop_script))
        .route("/autoload", get(get_autoload))
        .route("/autoload/run", post(run_autoload))
        .route("/autoload/{id}", post(enable_autoload).delete(disable_autoload))
        .route("/remote/sync", post(sync_remote))
        .with_state(state)
        .layer(middleware::from_fn_with_state(security, api_guard))
}
