//! Display channel (`/ui_ws`) to the local renderer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::{debug, warn};

use crate::asset::MediaType;
use crate::engine::Engine;
use crate::hub;

/// `GET /ui_ws`. Only the renderer on this machine may attach.
pub async fn display_ws(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<Engine>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if !addr.ip().to_canonical().is_loopback() {
        warn!(%addr, "rejecting non-local display connection");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        hub::serve_socket(socket, &engine.display, None, |text| {
            let engine = engine.clone();
            async move {
                handle_report(&engine, &text).await;
                None
            }
        })
        .await
    })
}

/// Renderer → engine reports.
pub async fn handle_report(engine: &Engine, text: &str) {
    let Ok(Value::Object(mut fields)) = serde_json::from_str::<Value>(text) else {
        warn!("malformed message from renderer");
        return;
    };
    let target = fields
        .remove("target")
        .and_then(|t| t.as_str().map(str::to_ascii_lowercase))
        .unwrap_or_default();

    match target.as_str() {
        "getbounds" | "getorientation" | "getflip" => {
            engine.update_display_info(fields).await;
        }
        "setcontainer" => {
            let media_type = fields
                .get("media_type")
                .cloned()
                .and_then(|v| serde_json::from_value::<MediaType>(v).ok());
            match media_type {
                Some(mt) => engine.mutate(|p| p.set_current_media_type(mt)).await,
                None => warn!("setContainer without a usable media_type"),
            }
        }
        other => debug!(kind = other, "ignoring renderer message"),
    }
}
