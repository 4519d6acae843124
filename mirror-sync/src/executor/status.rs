//! Status artifact written at the end of every run.

use crate::config::Config;
use crate::fs::with_suffix;
use crate::{MirrorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
    Success,
    LockHeld,
    ConfigError,
    ManifestError,
    TransferError,
    StaleFileList,
    StateError,
    /// Local filesystem or encoding failure
    IoError,
}

impl RunOutcome {
    /// Classify the error that aborted a run
    pub fn from_error(error: &MirrorError) -> Self {
        match error {
            MirrorError::Config(_) => Self::ConfigError,
            MirrorError::LockHeld(_) => Self::LockHeld,
            MirrorError::ManifestFetch(_)
            | MirrorError::UnsupportedManifestVersion { .. }
            | MirrorError::CorruptManifest(_) => Self::ManifestError,
            MirrorError::StaleFileList(_) => Self::StaleFileList,
            MirrorError::Transport(_)
            | MirrorError::UnexpectedTransfer(_)
            | MirrorError::Checkin(_)
            | MirrorError::Http(_) => Self::TransferError,
            MirrorError::State(_) => Self::StateError,
            MirrorError::Io(_) | MirrorError::Serialization(_) | MirrorError::Compression(_) => {
                Self::IoError
            }
        }
    }

    /// Process exit code; lock contention is not a failure
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success | Self::LockHeld => 0,
            _ => 1,
        }
    }
}

/// Summary of one run, serialised as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    /// State file identifying the target
    pub target: String,
    pub outcome: RunOutcome,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    pub total_file_size: u64,
    pub deleted_files: usize,
    pub deleted_dirs: usize,
    pub modules_changed: Vec<String>,
    pub modules_skipped: Vec<String>,
    pub error: Option<String>,
}

impl RunStatus {
    /// Status of a run refused because the configuration is unusable
    pub fn config_error(config: &Config, error: &MirrorError) -> Self {
        let now = Utc::now();
        let outcome = RunOutcome::ConfigError;
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            target: config.mirror.state_file.display().to_string(),
            outcome,
            exit_code: outcome.exit_code(),
            started_at: now,
            finished_at: now,
            duration_secs: 0,
            files_transferred: 0,
            bytes_transferred: 0,
            total_file_size: 0,
            deleted_files: 0,
            deleted_dirs: 0,
            modules_changed: Vec::new(),
            modules_skipped: Vec::new(),
            error: Some(error.to_string()),
        }
    }

    /// Write the artifact via a temp file and rename
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = with_suffix(path, ".tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        debug!("Wrote run status to {}", path.display());
        Ok(())
    }
}
