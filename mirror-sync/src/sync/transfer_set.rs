//! Per-module reconciliation.
//!
//! Turns one module's manifest, its previous manifest and the real local
//! tree into a [`TransferSet`]: what to fetch, what to delete and which
//! directory timestamps to restore.

use super::checksum::verify_checksums;
use super::diff::changed_paths;
use crate::fs::walker::{walk_local_tree, WalkOptions};
use crate::manifest::reader::{self, ManifestVisitor, ScanSummary};
use crate::manifest::{ChecksumEntry, EntryKind, ManifestEntry};
use crate::{MirrorError, Result};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// Knobs for one reconciliation
#[derive(Debug, Clone)]
pub struct ReconcileOptions<'a> {
    /// Entries modified at or after this time are "new"
    pub last_mirror_time: i64,

    pub include_restricted: bool,

    /// Manifest paths matching this are excluded from the mirror
    pub filter: Option<&'a Regex>,

    /// Manifest file paths matching this are transferred unconditionally
    pub refresh: Option<&'a Regex>,

    /// Restore the timestamp of every directory, not just parents of deletions
    pub full_dir_times: bool,

    pub verify_checksums: bool,

    pub temp_dir_name: &'a str,

    /// Root-level files regenerated every run; never delete candidates
    pub control_files: &'a [String],

    /// Root-level files appended to every transfer list
    pub always_transfer: &'a [String],

    /// The module directory did not exist before this run's manifest fetch
    pub first_sync: bool,
}

/// Derived per-module sets for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSet {
    /// Files and symlinks the remote considers live
    pub all_files: BTreeSet<String>,
    /// Directories the remote considers live (module root is `""`)
    pub all_dirs: BTreeSet<String>,
    pub new_files: BTreeSet<String>,
    pub new_dirs: BTreeSet<String>,
    /// Paths whose manifest line differs from the previous manifest
    pub changed_paths: BTreeSet<String>,
    pub delete_files: BTreeSet<String>,
    pub delete_dirs: BTreeSet<String>,
    pub missing_files: BTreeSet<String>,
    pub missing_dirs: BTreeSet<String>,
    /// Same path locally and remotely, different size
    pub updated_files: BTreeSet<String>,
    pub checksum_failed: BTreeSet<String>,
    /// Files matched by the refresh pattern
    pub refreshed: BTreeSet<String>,
    /// Directory -> manifest mtime to restore after deletions
    pub update_timestamps: BTreeMap<String, i64>,
    /// Union of everything that has to be fetched
    pub transfer: BTreeSet<String>,
    /// The module had no local directory before this run
    pub first_sync: bool,
}

/// Flat remote state extracted from a single manifest pass
#[derive(Default)]
struct RemoteCollector<'a> {
    last_mirror_time: i64,
    include_restricted: bool,
    filter: Option<&'a Regex>,
    keep_checksums: bool,

    all_files: BTreeSet<String>,
    all_dirs: BTreeSet<String>,
    new_files: BTreeSet<String>,
    new_dirs: BTreeSet<String>,
    /// Regular file sizes
    file_sizes: HashMap<String, u64>,
    dir_mtimes: HashMap<String, i64>,
    checksums: Vec<ChecksumEntry>,
    skipped_restricted: usize,
    skipped_filtered: usize,
}

impl ManifestVisitor for RemoteCollector<'_> {
    fn entry(&mut self, entry: ManifestEntry) {
        if entry.restricted && !self.include_restricted {
            self.skipped_restricted += 1;
            return;
        }

        let path = entry.relative_path().to_string();
        if self.filter.is_some_and(|f| !path.is_empty() && f.is_match(&path)) {
            self.skipped_filtered += 1;
            return;
        }

        let is_new = entry.mtime >= self.last_mirror_time;
        match entry.kind {
            EntryKind::Directory => {
                self.dir_mtimes.insert(path.clone(), entry.mtime);
                if is_new {
                    self.new_dirs.insert(path.clone());
                }
                self.all_dirs.insert(path);
            }
            EntryKind::File | EntryKind::Symlink => {
                if entry.kind == EntryKind::File {
                    self.file_sizes.insert(path.clone(), entry.size);
                }
                if is_new {
                    self.new_files.insert(path.clone());
                }
                self.all_files.insert(path);
            }
        }
    }

    fn checksum(&mut self, entry: ChecksumEntry) {
        if self.keep_checksums {
            self.checksums.push(entry);
        }
    }
}

/// Every ancestor directory of a relative path, up to and including the root `""`
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut rest = Some(path);
    std::iter::from_fn(move || {
        let current = rest?;
        match current.rfind('/') {
            Some(idx) => {
                rest = Some(&current[..idx]);
                Some(&current[..idx])
            }
            None if current.is_empty() => {
                rest = None;
                None
            }
            None => {
                rest = None;
                Some("")
            }
        }
    })
}

/// Reconcile one module.
///
/// `manifest` is the freshly fetched manifest, `previous` the copy saved
/// before the fetch (if any) and `root` the module's local directory.
pub fn reconcile(
    root: &Path,
    manifest: &Path,
    previous: Option<&Path>,
    options: &ReconcileOptions<'_>,
) -> Result<TransferSet> {
    // 1. Flat remote lists in one pass
    let mut remote = RemoteCollector {
        last_mirror_time: options.last_mirror_time,
        include_restricted: options.include_restricted,
        filter: options.filter,
        keep_checksums: options.verify_checksums,
        ..Default::default()
    };
    let summary: ScanSummary = reader::scan(manifest, &mut remote)?;
    debug!(
        "Manifest {}: {} entries, {} checksums, {} restricted skipped, {} filtered",
        manifest.display(),
        summary.entries,
        summary.checksums,
        remote.skipped_restricted,
        remote.skipped_filtered
    );

    // 2. Line-level diff against the previous manifest
    let previous_lines = match previous {
        Some(path) => match reader::file_lines(path) {
            Ok(lines) => lines,
            Err(MirrorError::CorruptManifest(msg)) => {
                warn!("Ignoring unreadable previous manifest: {}", msg);
                Vec::new()
            }
            Err(e) => return Err(e),
        },
        None => Vec::new(),
    };
    let current_lines = reader::file_lines(manifest)?;
    let changed = changed_paths(previous_lines, current_lines);

    let mut set = TransferSet {
        changed_paths: changed,
        ..Default::default()
    };

    if options.first_sync || !root.exists() {
        // First mirror of this module: nothing local to compare against
        info!("{} does not exist yet; transferring the whole module", root.display());
        set.first_sync = true;
        set.transfer.extend(remote.all_files.iter().cloned());
        set.transfer.extend(remote.all_dirs.iter().cloned());
    } else {
        compare_local(root, &remote, options, &mut set)?;
    }

    if let Some(pattern) = options.refresh {
        for path in remote.all_files.iter().filter(|p| pattern.is_match(p)) {
            set.refreshed.insert(path.clone());
            for dir in ancestors(path) {
                if let Some(mtime) = remote.dir_mtimes.get(dir) {
                    set.update_timestamps.insert(dir.to_string(), *mtime);
                }
            }
        }
    }

    // Union into the transfer list; only live paths can be fetched
    set.transfer.extend(remote.new_files.iter().cloned());
    set.transfer.extend(remote.new_dirs.iter().cloned());
    set.transfer.extend(set.missing_files.iter().cloned());
    set.transfer.extend(set.missing_dirs.iter().cloned());
    set.transfer.extend(set.updated_files.iter().cloned());
    set.transfer.extend(set.checksum_failed.iter().cloned());
    set.transfer.extend(set.refreshed.iter().cloned());
    set.transfer.extend(
        set.changed_paths
            .iter()
            .filter(|p| remote.all_files.contains(*p) || remote.all_dirs.contains(*p))
            .cloned(),
    );
    set.transfer.extend(options.always_transfer.iter().cloned());

    set.new_files = remote.new_files;
    set.new_dirs = remote.new_dirs;
    set.all_files = remote.all_files;
    set.all_dirs = remote.all_dirs;

    info!(
        "Reconciled {}: {} live files, {} live dirs, {} new, {} changed, {} missing, {} updated, {} checksum failures, {} to delete, {} to transfer",
        root.display(),
        set.all_files.len(),
        set.all_dirs.len(),
        set.new_files.len() + set.new_dirs.len(),
        set.changed_paths.len(),
        set.missing_files.len() + set.missing_dirs.len(),
        set.updated_files.len(),
        set.checksum_failed.len(),
        set.delete_files.len() + set.delete_dirs.len(),
        set.transfer.len()
    );

    Ok(set)
}

/// Directories a manifest considers live, without looking at the local
/// tree. Used to check in a module that was not transferred this run.
pub fn live_dirs(manifest: &Path, include_restricted: bool, filter: Option<&Regex>) -> Result<BTreeSet<String>> {
    let mut remote = RemoteCollector {
        include_restricted,
        filter,
        ..Default::default()
    };
    reader::scan(manifest, &mut remote)?;
    Ok(remote.all_dirs)
}

/// Steps 3-8: compare remote state against the real local tree
fn compare_local(
    root: &Path,
    remote: &RemoteCollector<'_>,
    options: &ReconcileOptions<'_>,
    set: &mut TransferSet,
) -> Result<()> {
    // 3. One listing of the local tree
    let walk_options = WalkOptions {
        follow_links: false,
        skip_dir_names: vec![options.temp_dir_name.to_string()],
    };
    let mut local_files: HashMap<String, (EntryKind, u64)> = HashMap::new();
    let mut local_dirs: HashSet<String> = HashSet::new();
    walk_local_tree(root, &walk_options, |entry| match entry.kind {
        EntryKind::Directory => {
            local_dirs.insert(entry.relative_path);
        }
        kind => {
            local_files.insert(entry.relative_path, (kind, entry.size));
        }
    })?;

    let control: HashSet<&str> = options.control_files.iter().map(String::as_str).collect();

    // 4. Local entries the remote no longer has
    for path in local_files.keys() {
        if !remote.all_files.contains(path) && !control.contains(path.as_str()) {
            set.delete_files.insert(path.clone());
        }
    }
    for path in &local_dirs {
        if !path.is_empty() && !remote.all_dirs.contains(path) {
            set.delete_dirs.insert(path.clone());
        }
    }

    // 5. Remote entries missing locally
    for path in &remote.all_files {
        if !local_files.contains_key(path) {
            set.missing_files.insert(path.clone());
        }
    }
    for path in &remote.all_dirs {
        if !path.is_empty() && !local_dirs.contains(path) {
            set.missing_dirs.insert(path.clone());
        }
    }

    // 6. Size differences
    for (path, remote_size) in &remote.file_sizes {
        if let Some((EntryKind::File, local_size)) = local_files.get(path) {
            if local_size != remote_size {
                set.updated_files.insert(path.clone());
            }
        }
    }

    // 7. Checksum verification of files that otherwise look current
    if options.verify_checksums && !remote.checksums.is_empty() {
        let present: HashSet<&str> = remote
            .file_sizes
            .iter()
            .filter(|(path, size)| {
                matches!(local_files.get(*path), Some((EntryKind::File, s)) if s == *size)
            })
            .map(|(path, _)| path.as_str())
            .collect();
        set.checksum_failed
            .extend(verify_checksums(root, &remote.checksums, &present));
    }

    // 8. Directory timestamps to restore
    if options.full_dir_times {
        for dir in &remote.all_dirs {
            if let Some(mtime) = remote.dir_mtimes.get(dir) {
                set.update_timestamps.insert(dir.clone(), *mtime);
            }
        }
    } else {
        for path in set.delete_files.iter().chain(set.delete_dirs.iter()) {
            for dir in ancestors(path) {
                if let Some(mtime) = remote.dir_mtimes.get(dir) {
                    set.update_timestamps.insert(dir.to_string(), *mtime);
                }
            }
        }
    }

    Ok(())
}
