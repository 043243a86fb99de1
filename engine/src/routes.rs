//! HTTP surface: WebSocket channels, fallback pages, uploads and status.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::control::control_ws;
use crate::display::display_ws;
use crate::engine::Engine;
use crate::remote::{public_key, remote_ws};
use crate::show::Fallback;

#[derive(Debug, Serialize)]
pub struct Status {
    pub name: &'static str,
    pub version: &'static str,
    pub instance_id: String,
    pub hostname: Option<String>,
    pub role: &'static str,
    pub primary: Option<String>,
    pub remote_connected: bool,
    pub secondaries: usize,
    pub assets: usize,
    pub enabled: usize,
}

pub fn build_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(|| async { "OK" }))
        .route("/status", get(status))
        .route("/ws", get(control_ws))
        .route("/ui_ws", get(display_ws))
        .route("/remote", get(remote_ws))
        .route("/remote/public_key", get(public_key))
        .route("/fallback/:kind", get(fallback))
        .nest_service("/uploaded", ServeDir::new(engine.uploads.dir()))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn root() -> &'static str {
    "Signage engine is running. Control channel at /ws, display channel at /ui_ws."
}

async fn fallback(Path(kind): Path<String>) -> Response {
    match Fallback::from_slug(&kind) {
        Some(f) => Html(f.page()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn status(State(engine): State<Arc<Engine>>) -> Json<Status> {
    let remote = engine.remote().await;
    let (assets, enabled) = engine.view(|p| (p.len(), p.enabled_count())).await;
    Json(Status {
        name: "Signage Engine",
        version: env!("CARGO_PKG_VERSION"),
        instance_id: engine.instance_id().await,
        hostname: sysinfo::System::host_name(),
        role: if remote.is_secondary() { "secondary" } else { "primary" },
        primary: remote.server.map(|s| format!("{s}:{}", remote.port)),
        remote_connected: engine.remote_connected(),
        secondaries: engine.remotes.connected().await.len(),
        assets,
        enabled,
    })
}
