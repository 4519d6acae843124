//! Persisted run state (`LASTTIME=<epoch>`).

use crate::fs::with_suffix;
use crate::{MirrorError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const LASTTIME_KEY: &str = "LASTTIME";

/// What is remembered between runs of one target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunState {
    /// Start time of the last fully completed run, epoch seconds
    pub last_mirror_time: i64,
}

impl RunState {
    pub fn backup_path(path: &Path) -> PathBuf {
        with_suffix(path, ".prev")
    }

    /// Load the state; a missing file means a first run
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {}; treating as first run", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let mut state = Self::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key.trim() == LASTTIME_KEY {
                state.last_mirror_time = value.trim().parse().map_err(|_| {
                    MirrorError::State(format!(
                        "{}: invalid {} value {:?}",
                        path.display(),
                        LASTTIME_KEY,
                        value
                    ))
                })?;
            }
        }

        debug!("Loaded state from {}: {:?}", path.display(), state);
        Ok(state)
    }

    /// State after a run that started at `run_start`; time never goes back
    pub fn advanced_to(&self, run_start: i64) -> Self {
        Self {
            last_mirror_time: self.last_mirror_time.max(run_start),
        }
    }

    /// Replace the state file, keeping the old one as `.prev`
    pub fn persist(&self, path: &Path) -> Result<()> {
        let wrap = |e: std::io::Error| MirrorError::State(format!("{}: {}", path.display(), e));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(wrap)?;
        }
        if path.exists() {
            fs::copy(path, Self::backup_path(path)).map_err(wrap)?;
        }

        let tmp = with_suffix(path, ".tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(wrap)?;
            writeln!(file, "{}={}", LASTTIME_KEY, self.last_mirror_time).map_err(wrap)?;
            file.sync_all().map_err(wrap)?;
        }
        fs::rename(&tmp, path).map_err(wrap)?;

        info!("Saved {}={} to {}", LASTTIME_KEY, self.last_mirror_time, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_state_is_zero() -> Result<()> {
        let temp = TempDir::new()?;
        assert_eq!(RunState::load(&temp.path().join("absent"))?.last_mirror_time, 0);
        Ok(())
    }

    #[test]
    fn test_persist_keeps_previous() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("fedora.state");

        RunState { last_mirror_time: 100 }.persist(&path)?;
        assert!(!RunState::backup_path(&path).exists());
        RunState { last_mirror_time: 200 }.persist(&path)?;

        assert_eq!(fs::read_to_string(&path)?, "LASTTIME=200\n");
        assert_eq!(RunState::load(&RunState::backup_path(&path))?.last_mirror_time, 100);
        assert_eq!(RunState::load(&path)?.last_mirror_time, 200);
        Ok(())
    }

    #[test]
    fn test_unknown_keys_ignored_and_bad_value_rejected() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("fedora.state");

        fs::write(&path, "# comment\nOTHER=1\nLASTTIME=1700000000\n")?;
        assert_eq!(RunState::load(&path)?.last_mirror_time, 1_700_000_000);

        fs::write(&path, "LASTTIME=yesterday\n")?;
        assert!(matches!(RunState::load(&path), Err(MirrorError::State(_))));
        Ok(())
    }

    #[test]
    fn test_time_only_advances() {
        let state = RunState { last_mirror_time: 500 };
        assert_eq!(state.advanced_to(400).last_mirror_time, 500);
        assert_eq!(state.advanced_to(600).last_mirror_time, 600);
    }
}
