//! Directory timestamp restoration.
//!
//! Deleting an entry bumps its parent's mtime; the mirror should show the
//! upstream time instead.

use crate::fs::metadata::set_mtime;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Set each listed directory (relative to `root`) to its manifest mtime.
///
/// Returns the number of directories updated. Missing directories are
/// skipped; they may have been deleted in the same run.
pub fn restore_timestamps(root: &Path, timestamps: &BTreeMap<String, i64>, dry_run: bool) -> usize {
    let mut restored = 0;

    for (dir, mtime) in timestamps {
        let path = root.join(dir);
        if !path.is_dir() {
            debug!("Skipping timestamp for missing directory {}", path.display());
            continue;
        }

        if dry_run {
            debug!("Would set mtime of {} to {}", path.display(), mtime);
            restored += 1;
            continue;
        }

        match set_mtime(&path, *mtime) {
            Ok(()) => restored += 1,
            Err(e) => warn!("Failed to restore mtime of {}: {}", path.display(), e),
        }
    }

    if restored > 0 {
        info!("Restored {} directory timestamps under {}", restored, root.display());
    }
    restored
}
