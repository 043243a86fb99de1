//! Error types shared by the engine components.

use thiserror::Error;

/// Errors reported to the caller of a playlist mutation.
///
/// These never reach the scheduler loop: a failed lookup leaves the
/// playlist untouched.
#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("No asset with uuid {0} in list")]
    UnknownAsset(String),

    #[error("Index {index} out of range (playlist has {len} assets)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Errors loading or saving the persisted configuration document.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Configuration version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// Errors on the primary/secondary synchronisation channel.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Could not fetch primary public key: {0}")]
    KeyFetch(String),

    #[error("Invalid public key: {0}")]
    BadKey(String),

    #[error("Show-event carries no signature")]
    MissingSignature,

    #[error("Show-event signature does not verify")]
    BadSignature,

    #[error("Signing failed: {0}")]
    Signing(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::KeyFetch(e.to_string())
    }
}

pub type PlaylistResult<T> = std::result::Result<T, PlaylistError>;
