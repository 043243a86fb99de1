//! The single persisted JSON document.
//!
//! Loaded once at startup; every mutation is followed by a full rewrite
//! through [`Store::begin`], which serialises writers so a snapshot taken
//! under the guard is never overwritten by an older one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;
use uuid::Uuid;

use crate::asset::Asset;
use crate::error::StoreError;
use crate::registry::Registry;

pub const DOCUMENT_VERSION: u32 = 1;
pub const DEFAULT_DURATION_SECS: u32 = 30;
pub const DEFAULT_REMOTE_PORT: u16 = 443;

fn current_version() -> u32 {
    DOCUMENT_VERSION
}

fn new_instance_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_duration() -> u32 {
    DEFAULT_DURATION_SECS
}

fn default_remote_port() -> u16 {
    DEFAULT_REMOTE_PORT
}

/// Where this instance mirrors from, if it is a secondary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSettings {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default = "default_remote_port")]
    pub port: u16,
    /// Cached PEM public key of `server`; dropped whenever the target changes.
    #[serde(default)]
    pub public_key: Option<String>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            server: None,
            port: DEFAULT_REMOTE_PORT,
            public_key: None,
        }
    }
}

impl RemoteSettings {
    pub fn is_secondary(&self) -> bool {
        self.server.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default = "new_instance_id")]
    pub instance_id: String,
    #[serde(default = "default_duration")]
    pub default_duration: u32,
    #[serde(default, alias = "urls")]
    pub assets: Vec<Asset>,
    /// Credentials are owned by the outer auth layer and kept verbatim.
    #[serde(default)]
    pub users: Map<String, Value>,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub remote_clients: Registry,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            instance_id: new_instance_id(),
            default_duration: DEFAULT_DURATION_SECS,
            assets: Vec::new(),
            users: Map::new(),
            remote: RemoteSettings::default(),
            remote_clients: Registry::default(),
            extra: Map::new(),
        }
    }
}

/// Result of [`Store::load`].
#[derive(Debug)]
pub struct Loaded {
    pub document: Document,
    /// No document existed yet.
    pub first_boot: bool,
}

#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    write: Mutex<()>,
}

/// Exclusive right to write the document.
pub struct SaveGuard<'a> {
    store: &'a Store,
    _lock: MutexGuard<'a, ()>,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document. A missing file is a first boot with defaults; a
    /// malformed file or a newer version is an error, never silently reset.
    pub fn load(&self) -> Result<Loaded, StoreError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no configuration at {}, first boot", self.path.display());
                return Ok(Loaded {
                    document: Document::default(),
                    first_boot: true,
                });
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };

        // Check the version before the full parse so a future layout is
        // reported as such rather than as "malformed".
        let raw: Value = serde_json::from_str(&text)?;
        let found = raw
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or(u64::from(DOCUMENT_VERSION));
        if found > u64::from(DOCUMENT_VERSION) {
            return Err(StoreError::UnsupportedVersion {
                found: u32::try_from(found).unwrap_or(u32::MAX),
                supported: DOCUMENT_VERSION,
            });
        }

        let mut document: Document = serde_json::from_value(raw)?;
        document.version = DOCUMENT_VERSION;
        Ok(Loaded {
            document,
            first_boot: false,
        })
    }

    pub async fn begin(&self) -> SaveGuard<'_> {
        SaveGuard {
            store: self,
            _lock: self.write.lock().await,
        }
    }
}

impl SaveGuard<'_> {
    /// Write to a sibling temp file and rename it over the document.
    pub async fn commit(self, document: &Document) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(document)?;
        let path = self.store.path.clone();
        let res = tokio::task::spawn_blocking(move || write_atomic(&path, &bytes)).await;
        match res {
            Ok(r) => r,
            Err(e) => Err(StoreError::Io {
                path: self.store.path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            }),
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(io_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetDuration;

    #[test]
    fn missing_file_is_first_boot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("signage.json"));
        let loaded = store.load().unwrap();
        assert!(loaded.first_boot);
        assert_eq!(loaded.document.default_duration, DEFAULT_DURATION_SECS);
        assert_eq!(loaded.document.remote.port, DEFAULT_REMOTE_PORT);
    }

    #[test]
    fn malformed_document_refuses_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signage.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Store::new(&path).load(),
            Err(StoreError::Malformed(_))
        ));

        std::fs::write(&path, r#"{"assets": [{"name": "missing url"}]}"#).unwrap();
        assert!(matches!(
            Store::new(&path).load(),
            Err(StoreError::Malformed(_))
        ));
    }

    #[test]
    fn newer_version_refuses_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signage.json");
        std::fs::write(&path, r#"{"version": 7}"#).unwrap();
        assert!(matches!(
            Store::new(&path).load(),
            Err(StoreError::UnsupportedVersion { found: 7, supported: 1 })
        ));
    }

    #[test]
    fn legacy_keys_and_unknown_fields_survive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signage.json");
        std::fs::write(
            &path,
            r#"{
                "urls": [{"url": "https://example.com", "duration": 12, "enabled": true}],
                "users": {"admin": {"pass": "hash"}},
                "remote_clients": {"abc": {"ip": "10.0.0.9", "port": 443, "hostname": "hall"}},
                "hostapd": {"ssid": "kiosk"}
            }"#,
        )
        .unwrap();
        let loaded = Store::new(&path).load().unwrap();
        assert!(!loaded.first_boot);
        let doc = loaded.document;
        assert_eq!(doc.assets.len(), 1);
        assert_eq!(doc.assets[0].duration, AssetDuration::Seconds(12.0));
        assert!(doc.remote_clients.contains("abc"));
        assert_eq!(doc.extra["hostapd"]["ssid"], "kiosk");

        let out = serde_json::to_value(&doc).unwrap();
        assert_eq!(out["hostapd"]["ssid"], "kiosk");
        assert_eq!(out["users"]["admin"]["pass"], "hash");
        assert_eq!(out["version"], 1);
        assert!(out.get("urls").is_none());
    }

    #[tokio::test]
    async fn save_then_load_keeps_assets_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("nested").join("signage.json"));
        let mut doc = Document::default();
        doc.assets.push(Asset::new("file:a.png").with_name("a"));
        doc.remote.server = Some("10.0.0.1".to_string());

        store.begin().await.commit(&doc).await.unwrap();
        assert!(!dir.path().join("nested").join("signage.json.tmp").exists());

        let loaded = store.load().unwrap();
        assert_eq!(loaded.document.instance_id, doc.instance_id);
        assert_eq!(loaded.document.assets[0].uuid(), doc.assets[0].uuid());
        assert!(loaded.document.remote.is_secondary());
    }
}
