//! Mirror Sync Library
//!
//! Incremental, file-list driven mirror synchronisation: remote manifests
//! are reconciled against the local tree and only the difference is moved
//! by a single rsync call per run.

pub mod checkin;
pub mod config;
pub mod executor;
pub mod fs;
pub mod manifest;
pub mod sync;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{RunCoordinator, RunOptions};
pub use utils::errors::{MirrorError, Result};
