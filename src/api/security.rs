//! Guard for the local API. Reads (catalog, log, autoload list) stay open so
//! dashboards can poll freely. Anything that starts, stops or reconfigures
//! scripts needs the configured token and draws from one shared per-second
//! command budget, since every command ends up on the frame thread.

use super::*;
use axum::http::{header::AUTHORIZATION, HeaderMap, Method};
use std::sync::PoisonError;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub(super) struct ApiSecurity {
    token: Option<Arc<str>>,
    commands_per_sec: u32,
    window: Arc<Mutex<CommandWindow>>,
}

struct CommandWindow {
    started: Instant,
    count: u32,
}

impl ApiSecurity {
    pub(super) fn new(token: Option<String>, commands_per_sec: u32) -> Self {
        Self {
            token: token.map(Arc::from),
            commands_per_sec: commands_per_sec.max(1),
            window: Arc::new(Mutex::new(CommandWindow {
                started: Instant::now(),
                count: 0,
            })),
        }
    }

    pub(super) fn from_settings(settings: &LanternSettings) -> Self {
        Self::new(settings.api_token.clone(), settings.api_rate_limit_per_sec)
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.token.as_deref() else {
            return true;
        };
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().strip_prefix("Bearer "))
            .is_some_and(|presented| presented.trim() == expected)
    }

    /// Counts one command against the current one-second window.
    fn admit(&self, now: Instant) -> bool {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if now.duration_since(window.started) >= Duration::from_secs(1) {
            window.started = now;
            window.count = 0;
        }
        if window.count >= self.commands_per_sec {
            return false;
        }
        window.count += 1;
        true
    }
}

fn changes_state(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD)
}

pub(super) async fn api_guard(
    State(security): State<ApiSecurity>,
    req: Request,
    next: Next,
) -> axum::response::Response {
    if !changes_state(req.method()) {
        return next.run(req).await;
    }
    if !security.authorized(req.headers()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ApiResponse::err(
                "Unauthorized: script commands need Authorization: Bearer <api token>",
            )),
        )
            .into_response();
    }
    if !security.admit(Instant::now()) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ApiResponse::err(format!(
                "More than {} script commands per second",
                security.commands_per_sec
            ))),
        )
            .into_response();
    }
    next.run(req).await
}
