//! Per-target run lock.
//!
//! An advisory exclusive `flock` on `<state_file>.lock`, held for the whole
//! run. The state file itself is replaced by rename on every persist, so it
//! cannot carry the lock.

use crate::fs::with_suffix;
use crate::{MirrorError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Held for as long as the value lives; released on drop
#[derive(Debug)]
pub struct TargetLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl TargetLock {
    /// Lock file belonging to a state file
    pub fn path_for(state_file: &Path) -> PathBuf {
        with_suffix(state_file, ".lock")
    }

    /// Take the lock without waiting. Contention is [`MirrorError::LockHeld`].
    pub fn try_acquire(state_file: &Path) -> Result<Self> {
        let path = Self::path_for(state_file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!("Acquired lock {}", path.display());
                Ok(Self { _lock: lock, path })
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(MirrorError::LockHeld(format!(
                "{} is held by another run",
                path.display()
            ))),
            Err((_, errno)) => Err(MirrorError::Io(std::io::Error::from(errno))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_until_release() -> Result<()> {
        let temp = TempDir::new()?;
        let state = temp.path().join("fedora.state");

        let lock = TargetLock::try_acquire(&state)?;
        assert_eq!(lock.path(), temp.path().join("fedora.state.lock"));
        assert!(matches!(
            TargetLock::try_acquire(&state),
            Err(MirrorError::LockHeld(_))
        ));

        drop(lock);
        let _again = TargetLock::try_acquire(&state)?;
        Ok(())
    }

    #[test]
    fn test_distinct_targets_do_not_contend() -> Result<()> {
        let temp = TempDir::new()?;
        let _a = TargetLock::try_acquire(&temp.path().join("a.state"))?;
        let _b = TargetLock::try_acquire(&temp.path().join("b.state"))?;
        Ok(())
    }
}
