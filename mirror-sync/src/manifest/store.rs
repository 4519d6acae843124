//! Per-module manifest handling on the local mirror.
//!
//! Each module's manifest lives in the module directory. Before a fetch the
//! current copy is saved as `<manifest>.old`; it is the "previous manifest"
//! for the line diff and the restore point when a run fails.

use super::reader;
use crate::config::{Config, ModuleSpec};
use crate::fs::with_suffix;
use crate::sync::checksum::sha256_file;
use crate::transfer::{TransferExecutor, TransferRequest, TransferTool};
use crate::{MirrorError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Manifest locations for one module
#[derive(Debug, Clone)]
pub struct ModuleManifest {
    pub module: ModuleSpec,

    /// Local module directory
    pub root: PathBuf,

    /// Manifest file name inside the module directory
    pub name: String,

    /// Auxiliary list file names fetched with the manifest
    pub extra_files: Vec<String>,

    /// The module directory existed before the fetch
    pub root_existed: bool,

    /// A manifest existed before the fetch and was saved as `.old`
    pub had_previous: bool,
}

impl ModuleManifest {
    pub fn path(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    pub fn previous_path(&self) -> PathBuf {
        self.root.join(self.previous_name())
    }

    pub fn previous_name(&self) -> String {
        format!("{}.old", self.name)
    }

    /// Root-level names that are bookkeeping, not mirrored content
    pub fn control_files(&self) -> Vec<String> {
        let mut names = vec![self.name.clone(), self.previous_name()];
        names.extend(self.extra_files.iter().cloned());
        names
    }

    /// Root-level names that are refreshed on every transfer
    pub fn always_transfer(&self) -> Vec<String> {
        let mut names = vec![self.name.clone()];
        names.extend(self.extra_files.iter().cloned());
        names
    }

    /// Paths relative to the master module, as requested from the remote
    fn remote_paths(&self) -> Vec<String> {
        self.always_transfer()
            .into_iter()
            .map(|name| format!("{}/{}", self.module.dir, name))
            .collect()
    }
}

/// Module name -> sha256 of the last manifest whose content was mirrored
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumCache {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl ChecksumCache {
    /// Cache location that belongs to a state file
    pub fn path_for(state_file: &Path) -> PathBuf {
        with_suffix(state_file, ".checksums")
    }

    /// Load the cache; a missing file is an empty cache and malformed lines
    /// are dropped
    pub fn load(path: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        match fs::read_to_string(path) {
            Ok(content) => {
                for line in content.lines() {
                    if let Some((module, digest)) = line.split_once('\t') {
                        entries.insert(module.to_string(), digest.trim().to_string());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn get(&self, module: &str) -> Option<&str> {
        self.entries.get(module).map(String::as_str)
    }

    pub fn set(&mut self, module: &str, digest: String) {
        self.entries.insert(module.to_string(), digest);
    }

    /// Write the cache via a temp file and rename
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = with_suffix(&self.path, ".tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            for (module, digest) in &self.entries {
                writeln!(file, "{}\t{}", module, digest)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!("Wrote {} manifest checksums to {}", self.entries.len(), self.path.display());
        Ok(())
    }
}

/// Fetches, validates and rolls back module manifests
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dest_dir: PathBuf,
    source: String,
}

impl ManifestStore {
    pub fn new(dest_dir: PathBuf, source: String) -> Self {
        Self { dest_dir, source }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.mirror.dest_dir.clone(), config.remote_source())
    }

    /// Save the current manifest as `.old` and describe where the new one
    /// will land
    pub fn prepare(&self, config: &Config, module: &ModuleSpec) -> Result<ModuleManifest> {
        let root = self.dest_dir.join(&module.dir);
        let mut manifest = ModuleManifest {
            module: module.clone(),
            root_existed: root.is_dir(),
            root,
            name: config.manifest_name(module),
            extra_files: config.extra_files(module),
            had_previous: false,
        };

        let current = manifest.path();
        if current.is_file() {
            fs::copy(&current, manifest.previous_path())?;
            manifest.had_previous = true;
            debug!("Saved {} as {}", current.display(), manifest.previous_name());
        }

        Ok(manifest)
    }

    /// Fetch every module's manifest and auxiliary lists in one batched
    /// transfer. Any failure aborts the run.
    pub async fn fetch_all<T: TransferTool>(
        &self,
        executor: &TransferExecutor<T>,
        manifests: &[ModuleManifest],
    ) -> Result<()> {
        let files: Vec<String> = manifests.iter().flat_map(|m| m.remote_paths()).collect();
        if files.is_empty() {
            return Ok(());
        }

        let request = TransferRequest {
            label: "manifests".to_string(),
            source: self.source.clone(),
            dest: self.dest_dir.clone(),
            files,
            dry_run: false,
        };

        executor
            .run(&request)
            .await
            .map_err(|e| MirrorError::ManifestFetch(e.to_string()))?;

        for manifest in manifests {
            if !manifest.path().is_file() {
                return Err(MirrorError::ManifestFetch(format!(
                    "{} was not fetched",
                    manifest.path().display()
                )));
            }
        }
        info!("Fetched manifests for {} modules", manifests.len());
        Ok(())
    }

    /// Check version and terminator of a fetched manifest.
    ///
    /// An unsupported version is a run-wide error; a corrupt manifest only
    /// affects its module.
    pub fn validate(&self, manifest: &ModuleManifest) -> Result<u32> {
        let path = manifest.path();
        let version = reader::check_version(&path)?;
        if !reader::has_terminator(&path)? {
            return Err(MirrorError::CorruptManifest(format!(
                "{}: missing [End] marker",
                path.display()
            )));
        }
        Ok(version)
    }

    /// SHA-256 of the fetched manifest
    pub fn digest(&self, manifest: &ModuleManifest) -> Result<String> {
        Ok(sha256_file(&manifest.path())?)
    }

    /// Whether the module's content is known to match `digest` already
    pub fn is_unchanged(&self, manifest: &ModuleManifest, cache: &ChecksumCache, digest: &str) -> bool {
        manifest.root_existed && cache.get(&manifest.module.name) == Some(digest)
    }

    /// Put the pre-fetch manifest back so the next run sees this module as
    /// changed again
    pub fn rollback(&self, manifest: &ModuleManifest) {
        let current = manifest.path();
        let result = if manifest.had_previous {
            fs::copy(manifest.previous_path(), &current).map(|_| ())
        } else {
            match fs::remove_file(&current) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        };

        match result {
            Ok(()) => debug!("Rolled back manifest {}", current.display()),
            Err(e) => warn!("Failed to roll back manifest {}: {}", current.display(), e),
        }
    }
}
