//! Primary side of the pairing channel.
//!
//! Secondaries connect to `/remote` announcing `instance_id`, `hostname` and
//! `port` headers. Each connection gets its own outbound queue in the
//! [`RemoteHub`]; show-events are signed once by the scheduler and the same
//! text is fanned out to every peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::registry::RemoteClient;

/// Close code telling a secondary it has been unpaired.
pub const UNPAIR_CLOSE_CODE: u16 = 4023;
pub const UNPAIR_REASON: &str = "Server forced disconnection";

pub const INSTANCE_ID_HEADER: &str = "instance_id";
pub const HOSTNAME_HEADER: &str = "hostname";
pub const PORT_HEADER: &str = "port";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug)]
struct Peer {
    conn: u64,
    tx: mpsc::UnboundedSender<PeerMessage>,
}

#[derive(Debug, Default)]
struct Peers {
    by_id: HashMap<String, Peer>,
    /// Last signed show-event, replayed to peers as they join.
    last: Option<String>,
}

#[derive(Debug, Default)]
pub struct RemoteHub {
    peers: Mutex<Peers>,
    next_conn: AtomicU64,
}

impl RemoteHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `instance_id`, replacing any previous one.
    /// The returned queue already holds the last show-event, if any.
    pub async fn join(&self, instance_id: &str) -> (u64, mpsc::UnboundedReceiver<PeerMessage>) {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut peers = self.peers.lock().await;
        if let Some(last) = &peers.last {
            let _ = tx.send(PeerMessage::Text(last.clone()));
        }
        if peers
            .by_id
            .insert(instance_id.to_string(), Peer { conn, tx })
            .is_some()
        {
            debug!(instance_id, "secondary reconnected, dropping previous channel");
        }
        (conn, rx)
    }

    /// Forget connection `conn`; a newer connection for the same id stays.
    pub async fn leave(&self, instance_id: &str, conn: u64) {
        let mut peers = self.peers.lock().await;
        if peers.by_id.get(instance_id).is_some_and(|p| p.conn == conn) {
            peers.by_id.remove(instance_id);
        }
    }

    pub async fn broadcast(&self, text: String) {
        let mut peers = self.peers.lock().await;
        peers
            .by_id
            .retain(|_, p| p.tx.send(PeerMessage::Text(text.clone())).is_ok());
        peers.last = Some(text);
    }

    /// Close the channel of `instance_id`. Returns `false` if not connected.
    pub async fn close(&self, instance_id: &str, code: u16, reason: &str) -> bool {
        match self.peers.lock().await.by_id.remove(instance_id) {
            Some(peer) => peer
                .tx
                .send(PeerMessage::Close {
                    code,
                    reason: reason.to_string(),
                })
                .is_ok(),
            None => false,
        }
    }

    pub async fn is_connected(&self, instance_id: &str) -> bool {
        self.peers.lock().await.by_id.contains_key(instance_id)
    }

    pub async fn connected(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.lock().await.by_id.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// `GET /remote`: pairing channel for secondaries.
pub async fn remote_ws(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<Engine>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let Some(instance_id) = header_str(&headers, INSTANCE_ID_HEADER) else {
        return (StatusCode::BAD_REQUEST, "missing instance_id header").into_response();
    };
    let client = RemoteClient {
        ip: addr.ip().to_canonical().to_string(),
        port: header_str(&headers, PORT_HEADER).and_then(|p| p.parse().ok()),
        hostname: header_str(&headers, HOSTNAME_HEADER).unwrap_or_default(),
    };
    ws.on_upgrade(move |socket| serve_secondary(socket, engine, instance_id, client))
}

async fn serve_secondary(
    mut socket: WebSocket,
    engine: Arc<Engine>,
    instance_id: String,
    client: RemoteClient,
) {
    // An instance mirroring someone else cannot be a primary too.
    if engine.remote().await.is_secondary() {
        info!(instance_id, "refusing pairing: this instance is a secondary");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "This instance is a secondary".into(),
            })))
            .await;
        return;
    }

    info!(instance_id, ip = %client.ip, hostname = %client.hostname, "secondary connected");
    engine.record_client(&instance_id, client).await;
    let (conn, mut outbound) = engine.remotes.join(&instance_id).await;

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(PeerMessage::Text(text)) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(PeerMessage::Close { code, reason }) => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                        .await;
                    break;
                }
                None => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(instance_id, "pairing channel error: {e}");
                    break;
                }
                // Secondaries have nothing to say; pings are answered by axum.
                Some(Ok(_)) => {}
            },
        }
    }

    engine.remotes.leave(&instance_id, conn).await;
    info!(instance_id, "secondary disconnected");
}

/// `GET /remote/public_key`: the signing key as SubjectPublicKeyInfo PEM.
pub async fn public_key(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/x-pem-file")],
        engine.signer.public_key_pem().to_string(),
    )
}
