//! Shared engine state handed to every handler and background task.
//!
//! The playlist is only ever changed through [`Engine::mutate`] (or
//! [`Engine::tick`] from the scheduler loop itself). Both run the change
//! under the playlist lock, drain the playlist's events, and only then
//! persist and notify, so observers never see a half-applied mutation and a
//! notification can never re-enter the playlist while it is locked.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::playlist::{Playlist, PlaylistEvent};
use crate::registry::RemoteClient;
use crate::remote::{RemoteHub, UNPAIR_CLOSE_CODE, UNPAIR_REASON};
use crate::roles::RoleCommand;
use crate::settings::EngineSettings;
use crate::show::{ShowEvent, UrlResolver, SHOW_TARGET};
use crate::signing::Signer;
use crate::store::{Document, Loaded, RemoteSettings, Store};
use crate::hub::Hub;
use crate::uploads::Uploads;

pub struct Engine {
    pub settings: EngineSettings,
    pub urls: UrlResolver,
    pub store: Store,
    pub uploads: Uploads,
    pub signer: Signer,

    /// Admin panels (`/ws`).
    pub control: Hub,
    /// The local renderer (`/ui_ws`).
    pub display: Hub,
    /// Paired secondaries (`/remote`).
    pub remotes: RemoteHub,

    /// Wakes the scheduler loop after a mutation.
    pub wake: Notify,

    playlist: Mutex<Playlist>,
    // Everything persisted except the assets, which the playlist owns.
    config: RwLock<Document>,
    display_info: Mutex<Map<String, Value>>,
    remote_connected: AtomicBool,
    roles: mpsc::Sender<RoleCommand>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        store: Store,
        loaded: Loaded,
        signer: Signer,
        roles: mpsc::Sender<RoleCommand>,
    ) -> Self {
        let Loaded {
            mut document,
            first_boot,
        } = loaded;
        let assets = std::mem::take(&mut document.assets);
        let playlist = Playlist::from_assets(assets, document.default_duration, first_boot);

        Self {
            urls: UrlResolver::new(settings.local_url.clone(), settings.public_url.clone()),
            uploads: Uploads::new(settings.uploads_dir.clone()),
            settings,
            store,
            signer,
            control: Hub::new(),
            display: Hub::new(),
            remotes: RemoteHub::new(),
            wake: Notify::new(),
            playlist: Mutex::new(playlist),
            config: RwLock::new(document),
            display_info: Mutex::new(Map::new()),
            remote_connected: AtomicBool::new(false),
            roles,
        }
    }

    // --- playlist access ------------------------------------------------

    /// Apply a change to the playlist and wake the scheduler loop.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut Playlist) -> R) -> R {
        self.apply(f, true).await
    }

    /// Scheduler-loop variant of [`Engine::mutate`] that does not wake the
    /// loop (it is the one running).
    pub async fn tick<R>(&self, f: impl FnOnce(&mut Playlist) -> R) -> R {
        self.apply(f, false).await
    }

    async fn apply<R>(&self, f: impl FnOnce(&mut Playlist) -> R, wake: bool) -> R {
        let (out, events) = {
            let mut p = self.playlist.lock().await;
            let out = f(&mut p);
            (out, p.take_events())
        };
        if wake {
            self.wake.notify_one();
        }
        self.dispatch(events).await;
        out
    }

    /// Read-only look at the playlist.
    pub async fn view<R>(&self, f: impl FnOnce(&Playlist) -> R) -> R {
        f(&*self.playlist.lock().await)
    }

    async fn dispatch(&self, events: Vec<PlaylistEvent>) {
        for ev in events {
            match ev {
                PlaylistEvent::Items => {
                    self.persist().await;
                    self.broadcast_assets().await;
                }
                PlaylistEvent::Current(uuid) => {
                    debug!(current = ?uuid, "current asset changed");
                    self.control
                        .broadcast("scheduler/current", json!({ "uuid": uuid }))
                        .await;
                }
            }
        }
    }

    // --- persistence ----------------------------------------------------

    async fn snapshot(&self) -> Document {
        let (assets, default_duration) = {
            let p = self.playlist.lock().await;
            (p.assets().to_vec(), p.default_duration())
        };
        let mut doc = self.config.read().await.clone();
        doc.assets = assets;
        doc.default_duration = default_duration;
        doc
    }

    /// Full rewrite of the persisted document. Failures are logged; the
    /// in-memory state stays authoritative.
    pub async fn persist(&self) {
        let guard = self.store.begin().await;
        let doc = self.snapshot().await;
        if let Err(e) = guard.commit(&doc).await {
            warn!("failed to persist configuration to {}: {e}", self.store.path().display());
            return;
        }
        // The first save ends first boot; the fallback page changes with it.
        if self.playlist.lock().await.mark_configured() {
            info!("configuration saved for the first time");
            self.wake.notify_one();
        }
    }

    // --- control-channel broadcasts -------------------------------------

    pub async fn broadcast_assets(&self) {
        let (items, current) = self
            .view(|p| (serde_json::to_value(p.assets()), p.current_uuid()))
            .await;
        match items {
            Ok(items) => {
                self.control
                    .broadcast("scheduler/asset", json!({ "items": items, "current": current }))
                    .await
            }
            Err(e) => warn!("failed to serialise asset list: {e}"),
        }
    }

    pub async fn broadcast_current(&self) {
        let current = self.view(|p| p.current_uuid()).await;
        self.control
            .broadcast("scheduler/current", json!({ "uuid": current }))
            .await;
    }

    pub async fn broadcast_files(&self) {
        let files = self.uploads.list().await;
        self.control
            .broadcast("scheduler/file", json!({ "files": files }))
            .await;
    }

    pub async fn broadcast_default_duration(&self) {
        let duration = self.view(|p| p.default_duration()).await;
        self.control
            .broadcast("settings/default_duration", json!({ "duration": duration }))
            .await;
    }

    pub async fn remote_settings(&self) -> Value {
        let cfg = self.config.read().await;
        json!({
            "remote_server": cfg.remote.server,
            "remote_port": cfg.remote.port,
            "remote_connected": self.remote_connected(),
            "remote_clients": cfg.remote_clients.entries(),
        })
    }

    pub async fn broadcast_remote_settings(&self) {
        let payload = self.remote_settings().await;
        self.control.broadcast("settings/remote/get", payload).await;
    }

    // --- display --------------------------------------------------------

    /// Push one show-event to the local renderer and, signed, to every
    /// paired secondary.
    pub async fn show(&self, local: &ShowEvent, remote: &ShowEvent) {
        debug!(src = %local.src, "show");
        self.display.broadcast(SHOW_TARGET, local.payload()).await;
        match self.signer.sign_show(SHOW_TARGET, remote) {
            Ok(msg) => self.remotes.broadcast(msg.to_string()).await,
            Err(e) => warn!("failed to sign show-event: {e}"),
        }
    }

    /// Replay a verified show-event from the primary on the local renderer.
    pub async fn show_mirrored(&self, show: &ShowEvent) {
        debug!(src = %show.src, "show (mirrored)");
        self.display.broadcast(SHOW_TARGET, show.payload()).await;
    }

    /// Merge a renderer geometry report and relay it to admin panels.
    pub async fn update_display_info(&self, fields: Map<String, Value>) {
        let snapshot = {
            let mut info = self.display_info.lock().await;
            info.extend(fields);
            Value::Object(info.clone())
        };
        self.control.broadcast("settings/display/get", snapshot).await;
    }

    pub async fn broadcast_display_info(&self) {
        let snapshot = Value::Object(self.display_info.lock().await.clone());
        self.control.broadcast("settings/display/get", snapshot).await;
    }

    // --- remote role ----------------------------------------------------

    pub async fn instance_id(&self) -> String {
        self.config.read().await.instance_id.clone()
    }

    pub async fn remote(&self) -> RemoteSettings {
        self.config.read().await.remote.clone()
    }

    pub fn remote_connected(&self) -> bool {
        self.remote_connected.load(Ordering::Relaxed)
    }

    pub async fn set_remote_connected(&self, connected: bool) {
        if self.remote_connected.swap(connected, Ordering::Relaxed) != connected {
            self.broadcast_remote_settings().await;
        }
    }

    pub async fn request_role(&self, cmd: RoleCommand) {
        if self.roles.send(cmd).await.is_err() {
            warn!("role supervisor is not running");
        }
    }

    /// Point this instance at a primary (`Some`) or make it primary (`None`).
    /// Returns `false` when nothing changed.
    pub async fn set_remote(&self, server: Option<String>, port: u16) -> bool {
        {
            let mut cfg = self.config.write().await;
            if cfg.remote.server == server && cfg.remote.port == port {
                return false;
            }
            info!(server = ?server, port, "remote target changed");
            cfg.remote.server = server;
            cfg.remote.port = port;
            cfg.remote.public_key = None;
        }
        self.persist().await;
        self.request_role(RoleCommand::Reconcile).await;
        self.broadcast_remote_settings().await;
        true
    }

    /// The primary unpaired us: forget it and go back to local rotation.
    pub async fn clear_remote(&self) {
        {
            let mut cfg = self.config.write().await;
            cfg.remote.server = None;
            cfg.remote.public_key = None;
        }
        self.persist().await;
        self.broadcast_remote_settings().await;
    }

    /// Cache the primary's key, unless the target changed meanwhile.
    pub async fn cache_public_key(&self, server: &str, port: u16, pem: &str) {
        {
            let mut cfg = self.config.write().await;
            if cfg.remote.server.as_deref() != Some(server) || cfg.remote.port != port {
                return;
            }
            if cfg.remote.public_key.as_deref() == Some(pem) {
                return;
            }
            cfg.remote.public_key = Some(pem.to_string());
        }
        self.persist().await;
    }

    /// Record a secondary in the registry at connect time.
    pub async fn record_client(&self, instance_id: &str, client: RemoteClient) {
        let changed = self
            .config
            .write()
            .await
            .remote_clients
            .record(instance_id, client);
        if changed {
            self.persist().await;
        }
        self.broadcast_remote_settings().await;
    }

    /// Forget a secondary and force its channel closed with the unpair code.
    pub async fn unpair(&self, instance_id: &str) -> bool {
        let removed = self
            .config
            .write()
            .await
            .remote_clients
            .remove(instance_id)
            .is_some();
        let closed = self
            .remotes
            .close(instance_id, UNPAIR_CLOSE_CODE, UNPAIR_REASON)
            .await;
        if removed {
            self.persist().await;
        }
        info!(instance_id, removed, closed, "secondary unpaired");
        self.broadcast_remote_settings().await;
        removed || closed
    }
}
