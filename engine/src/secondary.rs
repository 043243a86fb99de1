//! Secondary side of the pairing channel.
//!
//! Connects to the configured primary, verifies every show-event against the
//! primary's cached public key and replays it on the local renderer. The
//! local playlist is not rotated while this runs.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::SyncError;
use crate::remote::{HOSTNAME_HEADER, INSTANCE_ID_HEADER, PORT_HEADER, UNPAIR_CLOSE_CODE};
use crate::roles::RoleCommand;
use crate::show::SHOW_TARGET;
use crate::signing::Verifier;

/// How a session with the primary ended without a transport error.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Unpaired,
    Closed,
}

/// Where the primary lives.
#[derive(Debug, Clone)]
pub struct PrimaryTarget {
    pub server: String,
    pub port: u16,
    pub tls: bool,
}

impl PrimaryTarget {
    fn authority(&self) -> String {
        if self.server.contains(':') && !self.server.starts_with('[') {
            format!("[{}]:{}", self.server, self.port)
        } else {
            format!("{}:{}", self.server, self.port)
        }
    }

    pub fn public_key_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}/remote/public_key", self.authority())
    }

    pub fn pairing_url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}/remote", self.authority())
    }
}

/// Mirror `target` until cancelled or unpaired, reconnecting after a fixed
/// delay on any failure.
pub async fn run(engine: Arc<Engine>, target: PrimaryTarget, cancel: CancellationToken) {
    let delay = engine.settings.reconnect_delay;
    info!(server = %target.server, port = target.port, "mirroring primary");

    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            r = session(&engine, &target) => r,
        };
        engine.set_remote_connected(false).await;

        match outcome {
            Ok(SessionEnd::Unpaired) => {
                info!(server = %target.server, "unpaired by primary, resuming local rotation");
                engine.request_role(RoleCommand::Unpaired).await;
                break;
            }
            Ok(SessionEnd::Closed) => {
                warn!("primary closed the connection, retrying in {}s", delay.as_secs_f32())
            }
            Err(e) => warn!("remote session failed: {e}, retrying in {}s", delay.as_secs_f32()),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    engine.set_remote_connected(false).await;
    info!("stopped mirroring primary");
}

async fn fetch_key(target: &PrimaryTarget) -> Result<Verifier, SyncError> {
    let pem = reqwest::get(target.public_key_url())
        .await?
        .error_for_status()?
        .text()
        .await?;
    Verifier::from_pem(&pem)
}

/// Cached key if we have a usable one, otherwise fetch and cache it.
async fn verifier(engine: &Engine, target: &PrimaryTarget) -> Result<Verifier, SyncError> {
    if let Some(pem) = engine.remote().await.public_key {
        match Verifier::from_pem(&pem) {
            Ok(v) => return Ok(v),
            Err(e) => warn!("cached primary key unusable ({e}), fetching again"),
        }
    }
    let v = fetch_key(target).await?;
    engine.cache_public_key(&target.server, target.port, v.pem()).await;
    info!(server = %target.server, "fetched primary public key");
    Ok(v)
}

async fn pairing_request(engine: &Engine, target: &PrimaryTarget) -> Result<Request, SyncError> {
    let mut request = target.pairing_url().into_client_request()?;
    let hostname = sysinfo::System::host_name().unwrap_or_default();
    let headers = request.headers_mut();
    for (name, value) in [
        (INSTANCE_ID_HEADER, engine.instance_id().await),
        (HOSTNAME_HEADER, hostname),
        (PORT_HEADER, engine.settings.bind.port().to_string()),
    ] {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| SyncError::Transport(format!("bad {name} header: {e}")))?;
        headers.insert(name, value);
    }
    Ok(request)
}

async fn session(engine: &Engine, target: &PrimaryTarget) -> Result<SessionEnd, SyncError> {
    let mut verifier = verifier(engine, target).await?;
    let request = pairing_request(engine, target).await?;
    let (mut stream, _) = tokio_tungstenite::connect_async(request).await?;
    info!(url = %target.pairing_url(), "connected to primary");
    engine.set_remote_connected(true).await;

    // A key rotation on the primary gets one refetch per session.
    let mut refetched = false;
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(text) => {
                apply(engine, target, &mut verifier, &mut refetched, &text).await;
            }
            Message::Close(frame) => {
                let code = frame.map(|f| u16::from(f.code));
                debug!(?code, "primary closed the channel");
                return Ok(if code == Some(UNPAIR_CLOSE_CODE) {
                    SessionEnd::Unpaired
                } else {
                    SessionEnd::Closed
                });
            }
            _ => {}
        }
    }
    Ok(SessionEnd::Closed)
}

async fn apply(
    engine: &Engine,
    target: &PrimaryTarget,
    verifier: &mut Verifier,
    refetched: &mut bool,
    text: &str,
) {
    let msg: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("dropping malformed message from primary: {e}");
            return;
        }
    };
    if msg.get("target").and_then(Value::as_str) != Some(SHOW_TARGET) {
        debug!("ignoring non-show message from primary");
        return;
    }

    match verifier.verify_show(&msg) {
        Ok(show) => engine.show_mirrored(&show).await,
        Err(SyncError::BadSignature) if !*refetched => {
            *refetched = true;
            warn!("show-event signature does not verify, refetching primary key");
            match fetch_key(target).await {
                Ok(fresh) => {
                    match fresh.verify_show(&msg) {
                        Ok(show) => {
                            engine.cache_public_key(&target.server, target.port, fresh.pem()).await;
                            *verifier = fresh;
                            engine.show_mirrored(&show).await;
                        }
                        Err(e) => warn!("dropping show-event from primary: {e}"),
                    }
                }
                Err(e) => warn!("dropping show-event, key refetch failed: {e}"),
            }
        }
        Err(e) => warn!("dropping show-event from primary: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{Fit, MediaType};
    use crate::show::ShowEvent;
    use crate::testing::{engine, signer};

    fn show(src: &str) -> ShowEvent {
        ShowEvent {
            src: src.into(),
            container: MediaType::Web,
            fit: Fit::Contain,
            background_color: None,
        }
    }

    #[tokio::test]
    async fn forged_event_leaves_display_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _rx) = engine(&dir, vec![], true);
        let primary = signer();
        let mut verifier = Verifier::from_pem(primary.public_key_pem()).unwrap();
        // Unreachable primary: the one-shot refetch fails.
        let target = PrimaryTarget { server: "127.0.0.1".into(), port: 9, tls: false };

        let good = primary.sign_show(SHOW_TARGET, &show("https://example.com/ok")).unwrap();
        let mut refetched = false;
        apply(&engine, &target, &mut verifier, &mut refetched, &good.to_string()).await;
        let shown = engine.display.last(SHOW_TARGET).await.unwrap();
        assert!(shown.contains("https://example.com/ok"));
        assert!(!shown.contains("__signature__"));

        let forged = signer().sign_show(SHOW_TARGET, &show("https://evil.example")).unwrap();
        apply(&engine, &target, &mut verifier, &mut refetched, &forged.to_string()).await;
        assert!(refetched);
        assert_eq!(engine.display.last(SHOW_TARGET).await.unwrap(), shown);

        let mut unsigned = good.clone();
        unsigned["src"] = "https://evil.example/unsigned".into();
        unsigned.as_object_mut().unwrap().remove("__signature__");
        apply(&engine, &target, &mut verifier, &mut refetched, &unsigned.to_string()).await;
        assert_eq!(engine.display.last(SHOW_TARGET).await.unwrap(), shown);
    }

    #[test]
    fn default_target_fetches_key_over_tls() {
        let settings = crate::settings::EngineSettings::default();
        let remote = crate::store::RemoteSettings::default();
        let t = PrimaryTarget {
            server: "signage.example".into(),
            port: remote.port,
            tls: settings.remote_tls,
        };
        assert_eq!(t.public_key_url(), "https://signage.example:443/remote/public_key");
        assert_eq!(t.pairing_url(), "wss://signage.example:443/remote");
    }

    #[test]
    fn urls_bracket_ipv6() {
        let t = PrimaryTarget { server: "fe80::1".into(), port: 443, tls: true };
        assert_eq!(t.pairing_url(), "wss://[fe80::1]:443/remote");
        let t = PrimaryTarget { server: "10.0.0.2".into(), port: 8080, tls: false };
        assert_eq!(t.public_key_url(), "http://10.0.0.2:8080/remote/public_key");
    }
}
