//! Recovery of interrupted transfers.
//!
//! rsync (with `--delay-updates`) stages incoming files in a temp directory
//! next to their final location and moves them into place at the end of the
//! run. A crash leaves those directories behind. Before the local tree is
//! trusted for reconciliation every such directory is drained: staged files
//! either take the place of a missing final file or are discarded.

use super::walker::find_dirs_named;
use crate::Result;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Recovery tunables
#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Name of the temp directory to look for
    pub temp_dir_name: String,

    /// Discard staged files smaller than this many bytes (works around the
    /// transfer tool mishandling tiny staged files); None disables it
    pub small_file_threshold: Option<u64>,

    /// Report what would happen without touching anything
    pub dry_run: bool,
}

/// What a recovery pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub temp_dirs: usize,
    /// Staged files moved up into their final location
    pub promoted: usize,
    /// Staged files deleted (small, or a final copy already exists)
    pub removed: usize,
}

/// Drain every leftover temp directory below `root`
pub fn recover_partial_transfers(root: &Path, options: &RecoveryOptions) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for temp_dir in find_dirs_named(root, &options.temp_dir_name)? {
        report.temp_dirs += 1;
        warn!("Found leftover transfer directory {}", temp_dir.display());

        let Some(parent) = temp_dir.parent() else {
            continue;
        };

        for entry in fs::read_dir(&temp_dir)? {
            let entry = entry?;
            let staged = entry.path();
            let file_type = entry.file_type()?;

            if !file_type.is_file() && !file_type.is_symlink() {
                debug!("Discarding non-file {} in temp directory", staged.display());
                if !options.dry_run {
                    remove_any(&staged)?;
                }
                report.removed += 1;
                continue;
            }

            let size = entry.metadata()?.len();
            let target = parent.join(entry.file_name());

            let too_small = options
                .small_file_threshold
                .is_some_and(|threshold| size < threshold);

            if too_small {
                debug!("Discarding small staged file {} ({} bytes)", staged.display(), size);
                if !options.dry_run {
                    fs::remove_file(&staged)?;
                }
                report.removed += 1;
            } else if fs::symlink_metadata(&target).is_err() {
                info!("Promoting staged file {} -> {}", staged.display(), target.display());
                if !options.dry_run {
                    fs::rename(&staged, &target)?;
                }
                report.promoted += 1;
            } else {
                debug!("Discarding staged file {}; final copy exists", staged.display());
                if !options.dry_run {
                    fs::remove_file(&staged)?;
                }
                report.removed += 1;
            }
        }

        if !options.dry_run {
            fs::remove_dir_all(&temp_dir)?;
        }
    }

    if report.temp_dirs > 0 {
        info!(
            "Recovered {} temp directories under {}: {} promoted, {} removed",
            report.temp_dirs,
            root.display(),
            report.promoted,
            report.removed
        );
    }
    Ok(report)
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(threshold: Option<u64>, dry_run: bool) -> RecoveryOptions {
        RecoveryOptions {
            temp_dir_name: ".~tmp~".to_string(),
            small_file_threshold: threshold,
            dry_run,
        }
    }

    fn setup() -> std::io::Result<TempDir> {
        let temp_dir = TempDir::new()?;
        let tmp = temp_dir.path().join("releases/.~tmp~");
        fs::create_dir_all(&tmp)?;
        // No final copy yet: should be promoted
        fs::write(tmp.join("new.rpm"), vec![b'n'; 100])?;
        // Final copy exists: staged copy is discarded
        fs::write(tmp.join("old.rpm"), vec![b's'; 100])?;
        fs::write(temp_dir.path().join("releases/old.rpm"), b"final")?;
        // Tiny file
        fs::write(tmp.join("tiny"), b"x")?;
        Ok(temp_dir)
    }

    #[test]
    fn test_promote_and_discard() -> std::io::Result<()> {
        let temp_dir = setup()?;
        let report = recover_partial_transfers(temp_dir.path(), &options(None, false)).unwrap();

        assert_eq!(report.temp_dirs, 1);
        assert_eq!(report.promoted, 2);
        assert_eq!(report.removed, 1);

        let releases = temp_dir.path().join("releases");
        assert_eq!(fs::read(releases.join("new.rpm"))?.len(), 100);
        assert_eq!(fs::read(releases.join("old.rpm"))?, b"final");
        assert!(releases.join("tiny").exists());
        assert!(!releases.join(".~tmp~").exists());
        Ok(())
    }

    #[test]
    fn test_small_file_workaround() -> std::io::Result<()> {
        let temp_dir = setup()?;
        let report = recover_partial_transfers(temp_dir.path(), &options(Some(10), false)).unwrap();

        assert_eq!(report.promoted, 1);
        assert_eq!(report.removed, 2);
        assert!(!temp_dir.path().join("releases/tiny").exists());
        Ok(())
    }

    #[test]
    fn test_dry_run_changes_nothing() -> std::io::Result<()> {
        let temp_dir = setup()?;
        let report = recover_partial_transfers(temp_dir.path(), &options(None, true)).unwrap();

        assert_eq!(report.promoted, 2);
        assert!(temp_dir.path().join("releases/.~tmp~/new.rpm").exists());
        assert!(!temp_dir.path().join("releases/new.rpm").exists());
        Ok(())
    }

    #[test]
    fn test_no_temp_dirs() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("a"), b"a")?;
        let report = recover_partial_transfers(temp_dir.path(), &options(None, false)).unwrap();
        assert_eq!(report, RecoveryReport::default());
        Ok(())
    }
}
