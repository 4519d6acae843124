//! Local removal of entries the remote no longer lists.
//!
//! Directories go first (recursively) so that files below them do not have
//! to be removed one by one; files already gone with their directory are
//! skipped silently.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info, warn};

/// How a deletion pass behaves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeleteMode {
    /// Remove entries
    #[default]
    Apply,
    /// Only log what would be removed
    ReportOnly,
}

impl DeleteMode {
    pub fn from_flags(report_only: bool, dry_run: bool) -> Self {
        if report_only || dry_run {
            Self::ReportOnly
        } else {
            Self::Apply
        }
    }
}

/// Outcome of one deletion pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub removed: usize,
    pub reported: usize,
    pub failed: usize,
}

impl DeleteReport {
    pub fn merge(&mut self, other: &DeleteReport) {
        self.removed += other.removed;
        self.reported += other.reported;
        self.failed += other.failed;
    }
}

/// Remove directories (relative to `root`) recursively.
///
/// Deeper entries whose ancestor is also listed are covered by the
/// ancestor's removal.
pub fn delete_dirs(root: &Path, dirs: &BTreeSet<String>, mode: DeleteMode) -> DeleteReport {
    let mut report = DeleteReport::default();
    let mut removed_prefix: Option<&str> = None;

    // BTreeSet order puts "a" before "a/b", so one remembered prefix suffices
    for dir in dirs {
        if dir.is_empty() {
            continue;
        }
        if let Some(prefix) = removed_prefix {
            if dir.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/')) {
                continue;
            }
        }

        let path = root.join(dir);
        match mode {
            DeleteMode::ReportOnly => {
                info!("Would delete directory {}", path.display());
                report.reported += 1;
                removed_prefix = Some(dir);
            }
            DeleteMode::Apply => match fs::remove_dir_all(&path) {
                Ok(()) => {
                    debug!("Deleted directory {}", path.display());
                    report.removed += 1;
                    removed_prefix = Some(dir);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    removed_prefix = Some(dir);
                }
                Err(e) => {
                    warn!("Failed to delete directory {}: {}", path.display(), e);
                    report.failed += 1;
                }
            },
        }
    }

    if report.removed > 0 || report.reported > 0 {
        info!(
            "Directory deletion under {}: {} removed, {} reported, {} failed",
            root.display(),
            report.removed,
            report.reported,
            report.failed
        );
    }
    report
}

/// Remove files and symlinks (relative to `root`)
pub fn delete_files(root: &Path, files: &BTreeSet<String>, mode: DeleteMode) -> DeleteReport {
    let mut report = DeleteReport::default();

    for file in files {
        let path = root.join(file);
        match mode {
            DeleteMode::ReportOnly => {
                info!("Would delete {}", path.display());
                report.reported += 1;
            }
            DeleteMode::Apply => match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Deleted {}", path.display());
                    report.removed += 1;
                }
                // Already removed with its directory
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to delete {}: {}", path.display(), e);
                    report.failed += 1;
                }
            },
        }
    }

    if report.removed > 0 || report.reported > 0 {
        info!(
            "File deletion under {}: {} removed, {} reported, {} failed",
            root.display(),
            report.removed,
            report.reported,
            report.failed
        );
    }
    report
}
