//! Local IPC surface for the editor front-end.
//!
//! The front-end is a thin shell: it registers editor commands and relays
//! change notifications here, then polls for user-facing notifications. All
//! lifecycle work happens daemon-side, serialized through the event router;
//! only report generation runs directly, independent of the session.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::router::{ChangeEvent, HostState};
use crate::session::TraceLevel;

pub struct IpcServer {
    state: Arc<HostState>,
    listen_addr: String,
}

impl IpcServer {
    pub fn new(state: Arc<HostState>, listen_addr: &str) -> Self {
        Self {
            state,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub async fn start(self) -> Result<()> {
        let router = build_router(self.state);
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);
        axum::serve(listener, router).await?;
        Ok(())
    }
}

pub fn build_router(state: Arc<HostState>) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/env/status", get(get_env_status))
        .route("/api/server/restart", post(post_restart))
        .route("/api/server/trace", post(post_trace))
        .route("/api/report", post(post_report))
        .route("/api/events/interpreter", post(post_interpreter_changed))
        .route("/api/events/configuration", post(post_configuration_changed))
        .route("/api/shutdown", post(post_shutdown))
        .route("/api/notifications", get(get_notifications))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /api/status - session state plus last resolved setup facts.
async fn get_status(State(state): State<Arc<HostState>>) -> impl IntoResponse {
    let session = state.manager.status().await;
    let interpreter = state.resolved.read().await.clone();
    let env = state.provisioner.environment();
    Json(json!({
        "session": session,
        "interpreter": interpreter.map(|i| json!({
            "path": i.path,
            "version": i.raw_version,
        })),
        "env_root": env.root,
    }))
}

/// GET /api/env/status - live environment inspection.
async fn get_env_status(State(state): State<Arc<HostState>>) -> impl IntoResponse {
    Json(state.provisioner.describe().await)
}

/// POST /api/server/restart - idempotent restart request.
async fn post_restart(State(state): State<Arc<HostState>>) -> Response {
    enqueue(&state, ChangeEvent::RestartRequested).await
}

/// POST /api/events/interpreter - the host's active interpreter changed.
async fn post_interpreter_changed(State(state): State<Arc<HostState>>) -> Response {
    enqueue(&state, ChangeEvent::InterpreterChanged).await
}

#[derive(Debug, Deserialize)]
struct ConfigurationChangedRequest {
    keys: Vec<String>,
}

/// POST /api/events/configuration - settings keys changed; the router
/// decides which of them matter.
async fn post_configuration_changed(
    State(state): State<Arc<HostState>>,
    Json(req): Json<ConfigurationChangedRequest>,
) -> Response {
    for key in req.keys {
        let response = enqueue(&state, ChangeEvent::ConfigurationChanged(key)).await;
        if response.status() != StatusCode::ACCEPTED {
            return response;
        }
    }
    accepted()
}

/// POST /api/shutdown - stop the session and end the daemon.
async fn post_shutdown(State(state): State<Arc<HostState>>) -> Response {
    enqueue(&state, ChangeEvent::ShutdownRequested).await
}

#[derive(Debug, Deserialize)]
struct TraceRequest {
    level: String,
}

/// POST /api/server/trace - propagate trace verbosity without a restart.
async fn post_trace(
    State(state): State<Arc<HostState>>,
    Json(req): Json<TraceRequest>,
) -> Response {
    let Some(level) = TraceLevel::parse(&req.level) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": format!("unknown trace level '{}' (off|messages|verbose)", req.level),
            })),
        )
            .into_response();
    };
    match state.manager.set_trace(level).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ReportRequest {
    document_path: PathBuf,
    workspace_root: PathBuf,
}

/// POST /api/report - one-shot PDF generation for the active document.
async fn post_report(
    State(state): State<Arc<HostState>>,
    Json(req): Json<ReportRequest>,
) -> Response {
    let server = state.config.read().await.server.clone();
    match state
        .reports
        .generate(&req.document_path, &req.workspace_root, &server)
        .await
    {
        Ok(outcome) => {
            let message = format!("Report generated at {}", outcome.output_dir.display());
            state.notifications.info(message.clone()).await;
            Json(json!({
                "success": true,
                "output_dir": outcome.output_dir,
                "message": message,
            }))
            .into_response()
        }
        Err(e) => {
            state.notifications.error(e.to_string()).await;
            e.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct NotificationsQuery {
    since: Option<u64>,
}

/// GET /api/notifications?since=<id> - poll user-facing messages.
async fn get_notifications(
    State(state): State<Arc<HostState>>,
    Query(query): Query<NotificationsQuery>,
) -> impl IntoResponse {
    let notifications = match query.since {
        Some(id) => state.notifications.since(id).await,
        None => state.notifications.recent(50).await,
    };
    Json(json!({ "notifications": notifications }))
}

async fn enqueue(state: &HostState, event: ChangeEvent) -> Response {
    if state.events.send(event).await.is_ok() {
        accepted()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "success": false,
                "error": "daemon is shutting down",
            })),
        )
            .into_response()
    }
}

fn accepted() -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "queued": true })),
    )
        .into_response()
}
