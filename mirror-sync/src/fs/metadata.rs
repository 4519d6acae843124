//! File timestamp handling.

use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Modification time of a path in seconds since the Unix epoch
pub fn file_mtime(path: &Path) -> std::io::Result<i64> {
    let modified = fs::symlink_metadata(path)?.modified()?;
    let secs = match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    };
    Ok(secs)
}

/// Set both access and modification time of a path
#[cfg(unix)]
pub fn set_mtime(path: &Path, mtime: i64) -> std::io::Result<()> {
    use nix::sys::stat::utimes;
    use nix::sys::time::{TimeVal, TimeValLike};

    let tv = TimeVal::seconds(mtime);
    utimes(path, &tv, &tv).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
pub fn set_mtime(_path: &Path, _mtime: i64) -> std::io::Result<()> {
    // Directory times are only restored on Unix mirrors
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    #[cfg(unix)]
    fn test_set_and_read_mtime() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let dir = temp_dir.path().join("releases");
        fs::create_dir(&dir)?;

        set_mtime(&dir, 1_600_000_000)?;
        assert_eq!(file_mtime(&dir)?, 1_600_000_000);

        Ok(())
    }

    #[test]
    fn test_missing_path_is_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(file_mtime(&temp_dir.path().join("absent")).is_err());
    }
}
