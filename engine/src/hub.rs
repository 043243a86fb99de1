//! Message fan-out for the control and display channels.
//!
//! A hub is a `tokio::sync::broadcast` channel of ready-to-send JSON text.
//! It also remembers the last message per target so that a client
//! connecting late (the renderer restarting, a second admin tab) catches up
//! immediately. The cache and the live stream are handed out under the same
//! lock, so a subscriber sees every message exactly once.

use std::collections::BTreeMap;
use std::future::Future;

use axum::extract::ws::{Message, WebSocket};
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

const CHANNEL_CAPACITY: usize = 64;

/// Build `{target, ...payload}` with the target lower-cased.
pub fn message(target: &str, payload: Value) -> Value {
    let mut msg = Map::new();
    msg.insert("target".into(), Value::String(target.to_ascii_lowercase()));
    match payload {
        Value::Object(fields) => msg.extend(fields),
        Value::Null => {}
        other => {
            msg.insert("value".into(), other);
        }
    }
    Value::Object(msg)
}

/// `{target: "error", error, extra}` reply to a single caller.
pub fn error_reply(target: &str, error: &str, extra: Value) -> Value {
    let mut msg = Map::new();
    msg.insert("target".into(), Value::String(target.to_ascii_lowercase()));
    msg.insert("error".into(), Value::String(error.to_string()));
    msg.insert("extra".into(), extra);
    Value::Object(msg)
}

#[derive(Debug)]
pub struct Hub {
    tx: broadcast::Sender<String>,
    // Held while sending too, so a subscriber never misses or repeats a
    // message.
    last: Mutex<BTreeMap<String, String>>,
}

impl Hub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            last: Mutex::new(BTreeMap::new()),
        }
    }

    /// Send `{target, ...payload}` to every subscriber.
    pub async fn broadcast(&self, target: &str, payload: Value) {
        self.send(message(target, payload)).await;
    }

    /// Send an already-built message (must carry a `target`).
    pub async fn send(&self, msg: Value) {
        let target = msg
            .get("target")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let text = msg.to_string();

        let mut last = self.last.lock().await;
        last.insert(target, text.clone());
        // No receivers is fine: nobody is connected yet.
        let _ = self.tx.send(text);
    }

    /// Cached messages to replay, plus a receiver for everything after them.
    pub async fn subscribe(&self) -> (Vec<String>, broadcast::Receiver<String>) {
        let last = self.last.lock().await;
        (last.values().cloned().collect(), self.tx.subscribe())
    }

    /// Last cached message for `target`.
    pub async fn last(&self, target: &str) -> Option<String> {
        self.last
            .lock()
            .await
            .get(&target.to_ascii_lowercase())
            .cloned()
    }
}

/// Pump `hub` into a WebSocket until either side goes away.
///
/// The client first gets `greeting` (if any) and the hub's cached messages.
/// Inbound text frames go to `on_text`; its reply, if any, is sent back to
/// this client only.
pub async fn serve_socket<F, Fut>(
    mut socket: WebSocket,
    hub: &Hub,
    greeting: Option<Value>,
    mut on_text: F,
) where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Option<Value>>,
{
    let (cached, mut rx) = hub.subscribe().await;
    for text in greeting.map(|g| g.to_string()).into_iter().chain(cached) {
        if socket.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Ok(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("websocket client lagged, {n} messages skipped"),
                Err(RecvError::Closed) => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = on_text(text).await {
                        if socket.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
