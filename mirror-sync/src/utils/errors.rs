//! Custom error types for the mirror synchroniser.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest fetch failed: {0}")]
    ManifestFetch(String),

    #[error("Unsupported manifest version {found} in {path} (highest supported: {supported})")]
    UnsupportedManifestVersion {
        path: String,
        found: u32,
        supported: u32,
    },

    #[error("Corrupt manifest: {0}")]
    CorruptManifest(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Stale file list: {0}")]
    StaleFileList(String),

    #[error("Unexpected transfer result: {0}")]
    UnexpectedTransfer(String),

    #[error("Checkin error: {0}")]
    Checkin(String),

    #[error("Lock held: {0}")]
    LockHeld(String),

    #[error("State file error: {0}")]
    State(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(String),
}

impl MirrorError {
    /// Errors confined to one module's manifest or local tree. The run
    /// carries on without that module.
    pub fn is_module_scoped(&self) -> bool {
        matches!(self, Self::CorruptManifest(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;
