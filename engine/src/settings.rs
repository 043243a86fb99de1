//! Process settings, read once from `SIGNAGE_*` environment variables.
//!
//! Everything the admin can change at runtime lives in the persisted
//! document instead (see [`crate::store`]).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub bind: SocketAddr,
    pub config_path: PathBuf,
    pub uploads_dir: PathBuf,
    /// Base URL the local renderer uses to reach this engine.
    pub local_url: String,
    /// Base URL secondaries use to reach this engine's uploads.
    pub public_url: Option<String>,
    /// Fixed delay between secondary reconnect attempts.
    pub reconnect_delay: Duration,
    pub rsa_bits: usize,
    /// Talk `https`/`wss` to the primary. The key fetch is only as
    /// trustworthy as this transport, so plain HTTP is opt-in.
    pub remote_tls: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            config_path: PathBuf::from("/etc/signage/signage.json"),
            uploads_dir: PathBuf::from("/var/lib/signage/uploaded"),
            local_url: "http://localhost:8080".to_string(),
            public_url: None,
            reconnect_delay: Duration::from_secs(5),
            rsa_bits: 2048,
            remote_tls: true,
        }
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_flag(value: Option<&str>, default: bool) -> bool {
    match value.map(str::to_ascii_lowercase).as_deref() {
        None => default,
        Some("1" | "true" | "yes" | "on") => true,
        Some(_) => false,
    }
}

fn flag(name: &str, default: bool) -> bool {
    parse_flag(var(name).as_deref(), default)
}

impl EngineSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();

        let bind = match var("SIGNAGE_BIND") {
            Some(v) => v.parse().with_context(|| format!("SIGNAGE_BIND={v}"))?,
            None => d.bind,
        };
        let reconnect_delay = match var("SIGNAGE_RECONNECT_SECS") {
            Some(v) => Duration::from_secs(
                v.parse()
                    .with_context(|| format!("SIGNAGE_RECONNECT_SECS={v}"))?,
            ),
            None => d.reconnect_delay,
        };
        let rsa_bits = match var("SIGNAGE_RSA_BITS") {
            Some(v) => v.parse().with_context(|| format!("SIGNAGE_RSA_BITS={v}"))?,
            None => d.rsa_bits,
        };

        Ok(Self {
            bind,
            config_path: var("SIGNAGE_CONFIG_PATH").map(PathBuf::from).unwrap_or(d.config_path),
            uploads_dir: var("SIGNAGE_UPLOADS_DIR").map(PathBuf::from).unwrap_or(d.uploads_dir),
            local_url: var("SIGNAGE_LOCAL_URL").unwrap_or(d.local_url),
            public_url: var("SIGNAGE_PUBLIC_URL"),
            reconnect_delay,
            rsa_bits,
            remote_tls: flag("SIGNAGE_REMOTE_TLS", d.remote_tls),
        })
    }
}
