//! Local filesystem helpers: tree listing, timestamps and crash recovery.

pub mod metadata;
pub mod recovery;
pub mod walker;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// `path` with `suffix` appended to its file name (`state` -> `state.lock`)
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_suffix() {
        assert_eq!(
            with_suffix(Path::new("/var/lib/fedora.state"), ".lock"),
            PathBuf::from("/var/lib/fedora.state.lock")
        );
    }
}
