mod command_runtime;
mod commands;
mod router;
mod routes_scripts;
mod security;
mod state;
pub mod types;

use axum::{
    extract::Request,
    extract::State,
    http::StatusCode,
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bevy::prelude::*;
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::sync::{Arc, Mutex};

use crate::scripting::engine::ScriptStatus;
use crate::scripting::{ScriptEngine, ScriptLogEntry};
use crate::settings::LanternSettings;
use command_runtime::*;
use commands::*;
use router::build_router;
use routes_scripts::*;
use security::*;
use state::*;
use types::*;

pub struct ApiPlugin;

impl Plugin for ApiPlugin {
    fn build(&self, app: &mut App) {
        let (tx, rx) = crossbeam_channel::unbounded::<ApiCommand>();
        let settings = app
            .world()
            .get_resource::<LanternSettings>()
            .cloned()
            .unwrap_or_default();
        let port = settings.api_port;

        app.insert_resource(ApiChannels { receiver: rx })
            .add_systems(Update, process_api_commands);

        let state = AppState { sender: tx };
        let security = ApiSecurity::from_settings(&settings);
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("[Lantern API] Failed to start runtime: {e}");
                    return;
                }
            };
            rt.block_on(async {
                let app = build_router(state, security);
                let addr = format!("127.0.0.1:{port}");
                let listener = match tokio::net::TcpListener::bind(&addr).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        eprintln!("[Lantern API] Failed to bind to {addr}: {e}");
                        return;
                    }
                };

                println!("[Lantern API] Listening on http://{addr}");

                if let Err(e) = axum::serve(listener, app).await {
                    eprintln!("[Lantern API] Server stopped: {e}");
                }
            });
        });
    }
}
