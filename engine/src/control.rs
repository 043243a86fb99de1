//! Control channel (`/ws`): admin-panel commands and their broadcasts.
//!
//! Inbound messages are `{target, ...arguments}`. Targets are matched
//! case-insensitively. Unknown targets get an `Invalid command` reply and
//! known targets with unusable arguments an `Invalid arguments` reply; both
//! go to the caller only.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::asset::{is_valid_url, Asset, AssetDuration, AssetEdit, AssetInput, MediaType, FILE_SCHEME};
use crate::engine::Engine;
use crate::hub::{self, error_reply};
use crate::playlist::GotoTarget;
use crate::store::DEFAULT_REMOTE_PORT;
use crate::uploads::guess_media_type;

/// An uploaded file to add: bare name or an object with overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FileItem {
    Name(String),
    Fields {
        url: String,
        #[serde(default)]
        duration: Option<AssetDuration>,
        #[serde(default)]
        enabled: Option<bool>,
        #[serde(default)]
        media_type: Option<MediaType>,
    },
}

impl FileItem {
    fn name(&self) -> &str {
        match self {
            FileItem::Name(n) => n,
            FileItem::Fields { url, .. } => url,
        }
    }

    fn into_asset(self) -> Asset {
        let (name, duration, enabled, media_type) = match self {
            FileItem::Name(n) => (n, None, None, None),
            FileItem::Fields {
                url,
                duration,
                enabled,
                media_type,
            } => (url, duration, enabled, media_type),
        };
        let media_type = media_type.unwrap_or_else(|| guess_media_type(&name));
        Asset::new(format!("{FILE_SCHEME}{name}"))
            .with_name(name)
            .with_duration(duration.unwrap_or_default())
            .with_enabled(enabled.unwrap_or(false))
            .with_media_type(media_type)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "target")]
pub enum Command {
    #[serde(rename = "scheduler/asset")]
    Assets,
    #[serde(rename = "scheduler/add_url")]
    AddUrl {
        #[serde(default)]
        items: Vec<Value>,
    },
    #[serde(rename = "scheduler/add_file")]
    AddFile {
        #[serde(default)]
        items: Vec<Value>,
    },
    #[serde(rename = "scheduler/validate_url")]
    ValidateUrl { url: String },
    #[serde(rename = "scheduler/asset/edit", alias = "scheduler/edit")]
    Edit(AssetEdit),
    #[serde(rename = "scheduler/current", alias = "scheduler/asset/current")]
    Current,
    #[serde(rename = "scheduler/delete")]
    Delete { uuid: String },
    #[serde(rename = "scheduler/file")]
    Files,
    #[serde(rename = "scheduler/delete_file")]
    DeleteFile { files: Vec<String> },
    #[serde(rename = "scheduler/goto")]
    Goto {
        #[serde(default)]
        index: GotoTarget,
    },
    #[serde(rename = "scheduler/goto/back")]
    Back,
    #[serde(rename = "scheduler/goto/next")]
    Next,
    #[serde(rename = "scheduler/reorder")]
    Reorder { from_i: usize, to_i: usize },
    #[serde(rename = "settings/default_duration")]
    DefaultDuration {
        #[serde(default)]
        duration: Option<u32>,
    },
    #[serde(rename = "settings/remote/get")]
    RemoteGet,
    #[serde(rename = "settings/remote/set")]
    RemoteSet {
        #[serde(default)]
        remote_server: Option<String>,
        #[serde(default)]
        remote_port: Option<u16>,
    },
    #[serde(rename = "settings/remote/disconnect")]
    RemoteDisconnect { client: String },
    #[serde(rename = "settings/display/get")]
    DisplayGet,
}

impl Command {
    pub const TARGETS: &'static [&'static str] = &[
        "scheduler/asset",
        "scheduler/add_url",
        "scheduler/add_file",
        "scheduler/validate_url",
        "scheduler/asset/edit",
        "scheduler/edit",
        "scheduler/current",
        "scheduler/asset/current",
        "scheduler/delete",
        "scheduler/file",
        "scheduler/delete_file",
        "scheduler/goto",
        "scheduler/goto/back",
        "scheduler/goto/next",
        "scheduler/reorder",
        "settings/default_duration",
        "settings/remote/get",
        "settings/remote/set",
        "settings/remote/disconnect",
        "settings/display/get",
    ];

    /// Parse an inbound message, or build the error reply for the caller.
    pub fn parse(msg: &Value) -> Result<Self, Value> {
        let invalid = || error_reply("error", "Invalid command", msg.clone());
        let target = msg
            .get("target")
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase)
            .ok_or_else(invalid)?;
        if !Self::TARGETS.contains(&target.as_str()) {
            return Err(invalid());
        }
        let mut normalised = msg.clone();
        normalised["target"] = Value::String(target);
        serde_json::from_value(normalised).map_err(|e| {
            debug!("bad arguments for control command: {e}");
            error_reply("error", "Invalid arguments", msg.clone())
        })
    }
}

/// Handle one inbound text frame. Returns a reply for the caller, if any.
pub async fn handle_text(engine: &Engine, text: &str) -> Option<Value> {
    let msg: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Some(error_reply("error", "Invalid command", Value::String(text.to_string()))),
    };
    match Command::parse(&msg) {
        Ok(cmd) => execute(engine, cmd, &msg).await,
        Err(reply) => Some(reply),
    }
}

fn lookup_error(e: impl std::fmt::Display, msg: &Value) -> Value {
    error_reply("error", &e.to_string(), msg.clone())
}

pub async fn execute(engine: &Engine, cmd: Command, msg: &Value) -> Option<Value> {
    match cmd {
        Command::Assets => engine.broadcast_assets().await,
        Command::Current => engine.broadcast_current().await,
        Command::Files => engine.broadcast_files().await,
        Command::RemoteGet => engine.broadcast_remote_settings().await,
        Command::DisplayGet => engine.broadcast_display_info().await,

        Command::AddUrl { items } => {
            let mut assets = Vec::new();
            let mut invalid = Vec::new();
            for raw in items {
                match serde_json::from_value::<AssetInput>(raw.clone()) {
                    Ok(input) if is_valid_url(input.url()) => assets.push(input.into_asset()),
                    _ => invalid.push(raw),
                }
            }
            if !assets.is_empty() {
                engine
                    .mutate(|p| {
                        for a in assets {
                            p.append(a);
                        }
                    })
                    .await;
            }
            if !invalid.is_empty() {
                return Some(error_reply("scheduler/add_url", "Invalid elements", Value::Array(invalid)));
            }
        }

        Command::AddFile { items } => {
            let mut assets = Vec::new();
            let mut invalid = Vec::new();
            for raw in items {
                let Ok(item) = serde_json::from_value::<FileItem>(raw.clone()) else {
                    invalid.push(raw);
                    continue;
                };
                if engine.uploads.exists(item.name()).await {
                    assets.push(item.into_asset());
                } else {
                    invalid.push(raw);
                }
            }
            if !assets.is_empty() {
                engine
                    .mutate(|p| {
                        for a in assets {
                            p.append(a);
                        }
                    })
                    .await;
            }
            if !invalid.is_empty() {
                return Some(error_reply("scheduler/add_file", "Invalid elements", Value::Array(invalid)));
            }
        }

        Command::ValidateUrl { url } => {
            return Some(hub::message(
                "scheduler/validate_url",
                json!({ "url": url, "valid": is_valid_url(&url) }),
            ));
        }

        Command::Edit(edit) => {
            if let Err(e) = engine.mutate(|p| p.edit(edit)).await {
                return Some(lookup_error(e, msg));
            }
        }

        Command::Delete { uuid } => {
            if let Err(e) = engine.mutate(|p| p.remove(&uuid).map(drop)).await {
                return Some(lookup_error(e, msg));
            }
        }

        Command::DeleteFile { files } => {
            let mut failed = Vec::new();
            for name in files {
                if let Err(e) = engine.uploads.remove(&name).await {
                    warn!("failed to delete uploaded file {name}: {e}");
                    failed.push(Value::String(name.clone()));
                }
                engine.mutate(|p| p.remove_file(&name)).await;
            }
            engine.broadcast_files().await;
            if !failed.is_empty() {
                return Some(error_reply("scheduler/delete_file", "Invalid elements", Value::Array(failed)));
            }
        }

        Command::Goto { index } => {
            if let Err(e) = engine.mutate(|p| p.goto(index).map(drop)).await {
                return Some(lookup_error(e, msg));
            }
        }
        Command::Back => {
            engine.mutate(|p| {
                p.prev(true);
            })
            .await;
        }
        Command::Next => {
            engine.mutate(|p| {
                p.next(true);
            })
            .await;
        }

        Command::Reorder { from_i, to_i } => {
            if let Err(e) = engine.mutate(|p| p.move_item(from_i, to_i)).await {
                return Some(lookup_error(e, msg));
            }
        }

        Command::DefaultDuration { duration } => {
            if let Some(secs) = duration {
                engine.mutate(|p| p.set_default_duration(secs)).await;
            }
            engine.broadcast_default_duration().await;
        }

        Command::RemoteSet {
            remote_server,
            remote_port,
        } => {
            let server = remote_server
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            let port = remote_port.filter(|p| *p != 0).unwrap_or(DEFAULT_REMOTE_PORT);
            engine.set_remote(server, port).await;
        }

        Command::RemoteDisconnect { client } => {
            engine.unpair(&client).await;
        }
    }
    None
}

/// `GET /ws`.
pub async fn control_ws(ws: WebSocketUpgrade, State(engine): State<Arc<Engine>>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let greeting = hub::message("connected", Value::Null);
        hub::serve_socket(socket, &engine.control, Some(greeting), |text| {
            let engine = engine.clone();
            async move { handle_text(&engine, &text).await }
        })
        .await
    })
}
