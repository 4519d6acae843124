//! Delta-transfer execution.
//!
//! The transfer tool (rsync) is reached through the [`TransferTool`] trait,
//! a thin adapter that only runs the tool and hands back its raw exit code
//! and output. [`classify`] turns that into a typed [`Outcome`], and
//! [`retry::TransferExecutor`] applies the retry policy on top of it.

pub mod retry;
pub mod rsync;
pub mod stats;

use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;

pub use retry::{RetryEvent, RetryPolicy, TransferExecutor, TransferReport};
pub use rsync::RsyncTool;
pub use stats::TransferStats;

/// One transfer operation: copy the listed paths from `source` into `dest`
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Short label used in log lines ("manifests", "content")
    pub label: String,

    /// Remote source, e.g. `rsync://host/module/`
    pub source: String,

    /// Local destination directory
    pub dest: PathBuf,

    /// Paths relative to `source`, transferred without recursion
    pub files: Vec<String>,

    /// Ask the tool to report what it would do without changing anything
    pub dry_run: bool,
}

/// Raw result of one tool invocation
#[derive(Debug, Clone, Default)]
pub struct RawOutput {
    /// Exit code; None when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs the external delta-transfer tool once
#[async_trait]
pub trait TransferTool: Send + Sync {
    async fn invoke(&self, request: &TransferRequest) -> Result<RawOutput>;
}

/// Why a transfer failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Error starting the client-server protocol (5)
    ProtocolStartup,
    /// Error in socket I/O (10)
    SocketIo,
    /// Error in the protocol data stream (12)
    ProtocolStream,
    /// Timeout in data send/receive (30)
    Timeout,
    /// Timeout waiting for the daemon connection (35)
    ConnectTimeout,
    /// Partial transfer due to error (23)
    PartialTransfer,
    /// Source files vanished during the transfer (24)
    Vanished,
    /// Killed by a signal
    Signal,
    /// Any other exit code
    Other(i32),
}

impl FailureKind {
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(5) => Self::ProtocolStartup,
            Some(10) => Self::SocketIo,
            Some(12) => Self::ProtocolStream,
            Some(30) => Self::Timeout,
            Some(35) => Self::ConnectTimeout,
            Some(23) => Self::PartialTransfer,
            Some(24) => Self::Vanished,
            Some(other) => Self::Other(other),
            None => Self::Signal,
        }
    }

    fn is_transport(self) -> bool {
        matches!(
            self,
            Self::ProtocolStartup
                | Self::SocketIo
                | Self::ProtocolStream
                | Self::Timeout
                | Self::ConnectTimeout
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolStartup => write!(f, "protocol startup error (5)"),
            Self::SocketIo => write!(f, "socket I/O error (10)"),
            Self::ProtocolStream => write!(f, "protocol data stream error (12)"),
            Self::Timeout => write!(f, "data timeout (30)"),
            Self::ConnectTimeout => write!(f, "connection timeout (35)"),
            Self::PartialTransfer => write!(f, "partial transfer (23)"),
            Self::Vanished => write!(f, "vanished source files (24)"),
            Self::Signal => write!(f, "killed by signal"),
            Self::Other(code) => write!(f, "exit code {}", code),
        }
    }
}

/// Typed result of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    RetryableFailure(FailureKind),
    /// The file list names entries that no longer exist remotely
    StaleFileList(FailureKind),
    FatalFailure(FailureKind),
}

/// Error output fragments that mean a listed source entry is gone
const MISSING_SOURCE_PATTERNS: &[&str] = &["No such file or directory (2)", "file has vanished"];

/// Classify a raw tool result
pub fn classify(raw: &RawOutput) -> Outcome {
    if raw.exit_code == Some(0) {
        return Outcome::Succeeded;
    }

    let kind = FailureKind::from_exit_code(raw.exit_code);
    if kind.is_transport() {
        return Outcome::RetryableFailure(kind);
    }

    match kind {
        FailureKind::PartialTransfer | FailureKind::Vanished => {
            if MISSING_SOURCE_PATTERNS
                .iter()
                .any(|p| raw.stderr.contains(p) || raw.stdout.contains(p))
            {
                Outcome::StaleFileList(kind)
            } else {
                Outcome::FatalFailure(kind)
            }
        }
        _ => Outcome::FatalFailure(kind),
    }
}
