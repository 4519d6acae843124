//! Local tree enumeration.
//!
//! One recursive listing per module per run yields the type, relative path
//! and size of every local entry. This is the only step that scans the
//! mirror's filesystem.

use crate::manifest::EntryKind;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Directory names whose subtrees are skipped entirely (temp dirs)
    pub skip_dir_names: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            skip_dir_names: vec![".~tmp~".to_string()],
        }
    }
}

/// An entry found in the local tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub kind: EntryKind,

    /// Path relative to the walk root, `/`-separated; the root itself is `""`
    pub relative_path: String,

    /// Size in bytes (symlinks report the link size, not the target's)
    pub size: u64,
}

impl LocalEntry {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let metadata = entry.metadata()?;
        let file_type = entry.file_type();

        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            // Sockets, fifos and devices are never mirrored content
            return Ok(None);
        };

        let relative_path = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");

        Ok(Some(Self {
            kind,
            relative_path,
            size: metadata.len(),
        }))
    }
}

/// Walk `root` with a callback for each file, directory and symlink.
/// A missing `root` yields nothing.
pub fn walk_local_tree<F>(root: &Path, options: &WalkOptions, mut callback: F) -> std::io::Result<()>
where
    F: FnMut(LocalEntry),
{
    if !root.exists() {
        return Ok(());
    }

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .into_iter()
        .filter_entry(|e| !should_skip(e, &options.skip_dir_names));

    for entry in walker {
        let entry = entry?;
        if let Some(local) = LocalEntry::from_entry(&entry, root)? {
            callback(local);
        }
    }

    Ok(())
}

/// Find every directory named `name` below `root`, without descending into
/// the matches
pub fn find_dirs_named(root: &Path, name: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if !root.exists() {
        return Ok(found);
    }

    let mut walker = WalkDir::new(root).follow_links(false).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry?;
        if entry.depth() > 0 && entry.file_type().is_dir() && entry.file_name() == name {
            found.push(entry.path().to_path_buf());
            walker.skip_current_dir();
        }
    }
    Ok(found)
}

/// Check if a directory entry should be skipped based on its name
fn should_skip(entry: &DirEntry, names: &[String]) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|n| *n == file_name)
}
