//! Run coordinator - orchestrates one synchronisation run of a target.
//!
//! A run walks a fixed sequence of steps:
//! lock, fetch manifests, per-module reconcile (or skip when unchanged),
//! one merged transfer, delete, restore directory times, persist state,
//! registry checkin. Whatever happens, the run ends by writing the status
//! artifact.

pub mod lock;
pub mod state;
pub mod status;

use crate::checkin::{build_payload, encode_payload, CheckinClient};
use crate::config::{Config, ModuleSpec};
use crate::fs::recovery::{recover_partial_transfers, RecoveryOptions};
use crate::manifest::store::{ChecksumCache, ManifestStore, ModuleManifest};
use crate::sync::delete::{delete_dirs, delete_files, DeleteMode, DeleteReport};
use crate::sync::timestamps::restore_timestamps;
use crate::sync::transfer_set::{live_dirs, reconcile, ReconcileOptions, TransferSet};
use crate::transfer::stats::format_duration;
use crate::transfer::{RetryPolicy, RsyncTool, TransferExecutor, TransferRequest, TransferTool};
use crate::{MirrorError, Result};
use chrono::{DateTime, Utc};
use lock::TargetLock;
use regex::Regex;
use state::RunState;
use status::{RunOutcome, RunStatus};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Per-run switches (the command line)
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Reconcile every module even if its manifest did not change
    pub always_check: bool,

    pub dry_run: bool,

    /// Transfer only: no deletions, no state update
    pub transfer_only: bool,

    /// Use this instead of the stored last mirror time
    pub last_mirror_time: Option<i64>,

    /// Seconds subtracted from the last mirror time
    pub backdate_secs: Option<i64>,

    /// Only check in, from the manifests already on disk
    pub checkin_only: bool,

    /// Restore the timestamp of every directory
    pub dir_times: bool,

    /// Transfer every manifest path matching this pattern
    pub refresh: Option<String>,

    /// Restrict the run to these modules
    pub modules: Vec<String>,
}

/// Running totals that end up in the status artifact
#[derive(Debug, Default)]
struct RunProgress {
    files_transferred: u64,
    bytes_transferred: u64,
    total_file_size: u64,
    deleted_files: DeleteReport,
    deleted_dirs: DeleteReport,
    modules_changed: Vec<String>,
    modules_skipped: Vec<String>,
}

/// A module that went through reconciliation this run
struct PendingModule {
    manifest: ModuleManifest,
    set: TransferSet,
    digest: String,
}

/// Drives runs for one target
pub struct RunCoordinator<T> {
    config: Config,
    executor: TransferExecutor<T>,
    store: ManifestStore,
    checkin: Option<CheckinClient>,
    filter: Option<Regex>,
}

impl RunCoordinator<RsyncTool> {
    /// Coordinator that transfers with rsync
    pub fn from_config(config: Config) -> Result<Self> {
        let tool = RsyncTool::from_config(&config);
        Self::new(config, tool)
    }
}

impl<T: TransferTool> RunCoordinator<T> {
    pub fn new(config: Config, tool: T) -> Result<Self> {
        let policy = RetryPolicy::new(
            config.mirror.max_retries,
            Duration::from_secs(config.mirror.retry_base_secs),
        );
        let checkin = if config.checkin.enabled {
            Some(CheckinClient::from_config(&config.checkin)?)
        } else {
            None
        };
        let filter = match &config.mirror.filter {
            Some(pattern) => Some(
                Regex::new(pattern).map_err(|e| MirrorError::Config(format!("mirror.filter: {}", e)))?,
            ),
            None => None,
        };

        Ok(Self {
            store: ManifestStore::from_config(&config),
            executor: TransferExecutor::new(tool, policy),
            config,
            checkin,
            filter,
        })
    }

    pub fn tool(&self) -> &T {
        self.executor.tool()
    }

    /// Run once. Never fails: the outcome is in the returned status, which
    /// has also been written to the status file.
    pub async fn run(&self, options: &RunOptions) -> RunStatus {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let mut progress = RunProgress::default();

        info!(
            "Run {} starting for {} (dry run: {}, transfer only: {})",
            run_id,
            self.config.mirror.state_file.display(),
            options.dry_run,
            options.transfer_only
        );

        let mut lock = None;
        let result = self
            .execute(options, &run_id, started_at, &mut lock, &mut progress)
            .await;
        let status = self.finish(&run_id, started_at, progress, result);

        // Held until the status artifact is written and scratch is cleaned
        drop(lock);
        status
    }

    fn finish(
        &self,
        run_id: &str,
        started_at: DateTime<Utc>,
        progress: RunProgress,
        result: Result<()>,
    ) -> RunStatus {
        let finished_at = Utc::now();
        let (outcome, error) = match &result {
            Ok(()) => (RunOutcome::Success, None),
            Err(e) => (RunOutcome::from_error(e), Some(e.to_string())),
        };

        match (&result, outcome) {
            (Ok(()), _) => info!(
                "Run {} finished successfully in {}",
                run_id,
                format_duration((finished_at - started_at).num_seconds().max(0) as u64)
            ),
            (Err(e), RunOutcome::LockHeld) => info!("Run {} not started: {}", run_id, e),
            (Err(e), RunOutcome::StaleFileList) => error!(
                "Run {} aborted: {}; fetch a fresh file list before retrying",
                run_id, e
            ),
            (Err(e), _) => error!("Run {} failed: {}", run_id, e),
        }

        let status = RunStatus {
            run_id: run_id.to_string(),
            target: self.config.mirror.state_file.display().to_string(),
            outcome,
            exit_code: outcome.exit_code(),
            started_at,
            finished_at,
            duration_secs: (finished_at - started_at).num_seconds(),
            files_transferred: progress.files_transferred,
            bytes_transferred: progress.bytes_transferred,
            total_file_size: progress.total_file_size,
            deleted_files: progress.deleted_files.removed,
            deleted_dirs: progress.deleted_dirs.removed,
            modules_changed: progress.modules_changed,
            modules_skipped: progress.modules_skipped,
            error,
        };

        let status_file = self.config.status_file();
        if let Err(e) = status.write(&status_file) {
            warn!("Failed to write status file {}: {}", status_file.display(), e);
        }

        let scratch = self.run_scratch_dir(run_id);
        if scratch.exists() {
            if let Err(e) = std::fs::remove_dir_all(&scratch) {
                warn!("Failed to clean up {}: {}", scratch.display(), e);
            }
        }

        status
    }

    fn run_scratch_dir(&self, run_id: &str) -> PathBuf {
        self.config.mirror.scratch_dir.join(run_id)
    }

    async fn execute(
        &self,
        options: &RunOptions,
        run_id: &str,
        started_at: DateTime<Utc>,
        lock: &mut Option<TargetLock>,
        progress: &mut RunProgress,
    ) -> Result<()> {
        let state_file = &self.config.mirror.state_file;
        let modules = self.config.resolve_modules(&options.modules)?;
        let refresh = match &options.refresh {
            Some(pattern) => Some(
                Regex::new(pattern).map_err(|e| MirrorError::Config(format!("--refresh: {}", e)))?,
            ),
            None => None,
        };

        *lock = Some(match TargetLock::try_acquire(state_file) {
            Ok(held) => held,
            Err(e @ MirrorError::LockHeld(_)) => {
                self.check_staleness(started_at);
                return Err(e);
            }
            Err(e) => return Err(e),
        });

        let state = RunState::load(state_file)?;
        let mut last_mirror_time = options.last_mirror_time.unwrap_or(state.last_mirror_time);
        if let Some(backdate) = options.backdate_secs {
            last_mirror_time -= backdate;
        }
        info!("Last mirror time: {}", last_mirror_time);

        if options.checkin_only {
            self.checkin_from_disk(&modules, None).await;
            return Ok(());
        }

        let mut manifests = Vec::with_capacity(modules.len());
        for module in &modules {
            manifests.push(self.store.prepare(&self.config, module)?);
        }

        let result = match self.store.fetch_all(&self.executor, &manifests).await {
            Ok(()) => {
                self.sync_modules(
                    &manifests,
                    options,
                    run_id,
                    started_at,
                    last_mirror_time,
                    state,
                    refresh.as_ref(),
                    progress,
                )
                .await
            }
            Err(e) => Err(e),
        };

        if result.is_err() || options.dry_run {
            for manifest in &manifests {
                self.store.rollback(manifest);
            }
        }
        result
    }

    /// Everything after a successful manifest fetch
    #[allow(clippy::too_many_arguments)]
    async fn sync_modules(
        &self,
        manifests: &[ModuleManifest],
        options: &RunOptions,
        run_id: &str,
        started_at: DateTime<Utc>,
        last_mirror_time: i64,
        state: RunState,
        refresh: Option<&Regex>,
        progress: &mut RunProgress,
    ) -> Result<()> {
        let mirror = &self.config.mirror;

        // Validate everything before anything local changes
        let mut valid = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            match self.store.validate(manifest) {
                Ok(version) => {
                    debug!("{}: manifest version {}", manifest.module.name, version);
                    valid.push(manifest);
                }
                Err(e @ MirrorError::UnsupportedManifestVersion { .. }) => return Err(e),
                Err(e) if e.is_module_scoped() => self.skip_module(manifest, &e, progress),
                Err(e) => return Err(e),
            }
        }

        let cache_path = ChecksumCache::path_for(&mirror.state_file);
        let mut cache = ChecksumCache::load(&cache_path)?;
        let force = options.always_check || options.dir_times || refresh.is_some();

        let mut pending = Vec::new();
        for manifest in valid {
            let name = &manifest.module.name;
            let digest = match self.store.digest(manifest) {
                Ok(digest) => digest,
                Err(e) if e.is_module_scoped() => {
                    self.skip_module(manifest, &e, progress);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !force && self.store.is_unchanged(manifest, &cache, &digest) {
                info!("Module {} unchanged since the last run; skipping", name);
                progress.modules_skipped.push(name.clone());
                continue;
            }

            let recovery = RecoveryOptions {
                temp_dir_name: mirror.temp_dir_name.clone(),
                small_file_threshold: mirror
                    .partial_dir_workaround
                    .then_some(mirror.small_file_threshold),
                dry_run: options.dry_run,
            };
            if let Err(e) = recover_partial_transfers(&manifest.root, &recovery) {
                warn!("Recovery of partial transfers failed for {}", name);
                self.skip_module(manifest, &e, progress);
                continue;
            }

            let set = match self
                .reconcile_module(manifest, last_mirror_time, options.dir_times, refresh)
                .await
            {
                Ok(set) => set,
                Err(e) if e.is_module_scoped() => {
                    self.skip_module(manifest, &e, progress);
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.write_dir_list(run_id, manifest, &set);
            pending.push(PendingModule {
                manifest: manifest.clone(),
                set,
                digest,
            });
        }

        if pending.is_empty() {
            info!("No module needs a transfer");
        } else {
            self.transfer(&pending, options.dry_run, progress).await?;
        }
        progress.modules_changed = pending.iter().map(|p| p.manifest.module.name.clone()).collect();

        if options.transfer_only {
            info!("Transfer-only run: skipping deletions and state update");
            return Ok(());
        }

        let dir_mode = DeleteMode::from_flags(mirror.report_only_dirs, options.dry_run);
        let file_mode = DeleteMode::from_flags(mirror.report_only_files, options.dry_run);
        for module in &pending {
            let root = &module.manifest.root;
            progress
                .deleted_dirs
                .merge(&delete_dirs(root, &module.set.delete_dirs, dir_mode));
            progress
                .deleted_files
                .merge(&delete_files(root, &module.set.delete_files, file_mode));
            restore_timestamps(root, &module.set.update_timestamps, options.dry_run);
        }

        if options.dry_run {
            info!("Dry run: state and checksum cache left untouched");
            return Ok(());
        }

        state
            .advanced_to(started_at.timestamp())
            .persist(&mirror.state_file)?;
        for module in &pending {
            cache.set(&module.manifest.module.name, module.digest.clone());
        }
        if let Err(e) = cache.save() {
            warn!("Failed to save manifest checksums: {}", e);
        }

        let changed: Vec<ModuleSpec> = pending.iter().map(|p| p.manifest.module.clone()).collect();
        self.checkin_from_disk(&changed, Some(run_id)).await;
        Ok(())
    }

    /// Leave a module out of this run and restore its previous manifest
    fn skip_module(&self, manifest: &ModuleManifest, error: &MirrorError, progress: &mut RunProgress) {
        warn!("Skipping module {}: {}", manifest.module.name, error);
        self.store.rollback(manifest);
        progress.modules_skipped.push(manifest.module.name.clone());
    }

    async fn reconcile_module(
        &self,
        manifest: &ModuleManifest,
        last_mirror_time: i64,
        dir_times: bool,
        refresh: Option<&Regex>,
    ) -> Result<TransferSet> {
        let mirror = &self.config.mirror;
        let root = manifest.root.clone();
        let path = manifest.path();
        let previous = manifest.had_previous.then(|| manifest.previous_path());
        let control_files = manifest.control_files();
        let always_transfer = manifest.always_transfer();
        let filter = self.filter.clone();
        let refresh = refresh.cloned();
        let include_restricted = mirror.include_restricted;
        let verify_checksums = mirror.verify_checksums;
        let temp_dir_name = mirror.temp_dir_name.clone();
        let first_sync = !manifest.root_existed;

        // Manifest scan and tree walk are blocking filesystem work
        tokio::task::spawn_blocking(move || {
            let options = ReconcileOptions {
                last_mirror_time,
                include_restricted,
                filter: filter.as_ref(),
                refresh: refresh.as_ref(),
                full_dir_times: dir_times,
                verify_checksums,
                temp_dir_name: &temp_dir_name,
                control_files: &control_files,
                always_transfer: &always_transfer,
                first_sync,
            };
            reconcile(&root, &path, previous.as_deref(), &options)
        })
        .await
        .map_err(|e| MirrorError::Io(std::io::Error::other(e)))?
    }

    /// One transfer for every pending module, paths prefixed with the
    /// module directory
    async fn transfer(&self, pending: &[PendingModule], dry_run: bool, progress: &mut RunProgress) -> Result<()> {
        let mut merged = BTreeSet::new();
        for module in pending {
            let dir = &module.manifest.module.dir;
            for path in &module.set.transfer {
                if path.is_empty() {
                    merged.insert(dir.clone());
                } else {
                    merged.insert(format!("{}/{}", dir, path));
                }
            }
        }
        let files: Vec<String> = merged.into_iter().collect();

        let request = TransferRequest {
            label: "content".to_string(),
            source: self.config.remote_source(),
            dest: self.config.mirror.dest_dir.clone(),
            files,
            dry_run,
        };
        let report = self.executor.run(&request).await?;

        progress.files_transferred = report.stats.files_transferred;
        progress.bytes_transferred = report.stats.transferred_file_size;
        progress.total_file_size = report.stats.total_file_size;
        if !report.retries.is_empty() {
            info!("Content transfer needed {} retries", report.retries.len());
        }
        Ok(())
    }

    fn dir_list_path(&self, run_id: &str, module: &ModuleSpec) -> PathBuf {
        self.run_scratch_dir(run_id).join(&module.name).join("dir-list")
    }

    /// Keep the module's live directories for the checkin step. Checkin
    /// falls back to the manifest when the list is missing.
    fn write_dir_list(&self, run_id: &str, manifest: &ModuleManifest, set: &TransferSet) {
        let path = self.dir_list_path(run_id, &manifest.module);
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut content = String::new();
            for dir in &set.all_dirs {
                content.push_str(dir);
                content.push('\n');
            }
            std::fs::write(&path, content)
        };

        if let Err(e) = write() {
            warn!("Failed to write directory list for {}: {}", manifest.module.name, e);
        }
    }

    /// Directories recorded for a module earlier in this run
    fn read_dir_list(&self, run_id: &str, module: &ModuleSpec) -> std::io::Result<BTreeSet<String>> {
        let content = std::fs::read_to_string(self.dir_list_path(run_id, module))?;
        Ok(content.lines().map(str::to_string).collect())
    }

    /// Escalate when the lock is held and the last completed run is too old
    fn check_staleness(&self, now: DateTime<Utc>) {
        let state_file = &self.config.mirror.state_file;
        match RunState::load(state_file) {
            Ok(state) if state.last_mirror_time > 0 => {
                let age = now.timestamp() - state.last_mirror_time;
                if age > self.config.mirror.warn_delay_secs as i64 {
                    error!(
                        "Another run holds the lock and the last completed run was {} hours ago",
                        age / 3600
                    );
                }
            }
            Ok(_) => {}
            Err(e) => debug!("Could not read {} while checking staleness: {}", state_file.display(), e),
        }
    }

    /// Check in one module. Failures are logged, never returned.
    async fn checkin_module(&self, module: &ModuleSpec, dirs: &BTreeSet<String>) {
        let Some(client) = &self.checkin else {
            return;
        };
        let Some(category) = &module.category else {
            warn!("Module {} has no registry category; not checking in", module.name);
            return;
        };

        let payload = build_payload(&self.config, module, category, dirs);
        let result = match encode_payload(&payload) {
            Ok(encoded) => client.checkin(&module.name, &encoded).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Checkin for {} failed: {}", module.name, e);
        }
    }

    /// Check in `modules`, from this run's directory lists when `run_id`
    /// is given, otherwise from the manifests already on disk
    async fn checkin_from_disk(&self, modules: &[ModuleSpec], run_id: Option<&str>) {
        if self.checkin.is_none() {
            if run_id.is_none() {
                warn!("Checkin requested but checkin is not enabled");
            }
            return;
        }

        for module in modules {
            let recorded = run_id.and_then(|id| match self.read_dir_list(id, module) {
                Ok(dirs) => Some(dirs),
                Err(e) => {
                    debug!("No directory list for {} in this run: {}", module.name, e);
                    None
                }
            });
            let dirs = match recorded {
                Some(dirs) => dirs,
                None => {
                    let path = self.config.module_root(module).join(self.config.manifest_name(module));
                    match self.manifest_dirs(&path) {
                        Ok(dirs) => dirs,
                        Err(e) => {
                            warn!("Cannot check in {}: {}", module.name, e);
                            continue;
                        }
                    }
                }
            };
            self.checkin_module(module, &dirs).await;
        }
    }

    fn manifest_dirs(&self, path: &Path) -> Result<BTreeSet<String>> {
        live_dirs(path, self.config.mirror.include_restricted, self.filter.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::RawOutput;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Copies listed paths from a local "remote" tree
    struct LocalCopyTool {
        upstream: PathBuf,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TransferTool for LocalCopyTool {
        async fn invoke(&self, request: &TransferRequest) -> Result<RawOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut copied = 0;

            for file in &request.files {
                let src = self.upstream.join(file);
                let dst = request.dest.join(file);
                if !src.exists() {
                    return Ok(RawOutput {
                        exit_code: Some(23),
                        stdout: String::new(),
                        stderr: format!("link_stat \"{}\" failed: No such file or directory (2)", file),
                    });
                }
                if request.dry_run {
                    continue;
                }
                if src.is_dir() {
                    fs::create_dir_all(&dst)?;
                } else {
                    fs::create_dir_all(dst.parent().unwrap())?;
                    fs::copy(&src, &dst)?;
                    copied += 1;
                }
            }

            Ok(RawOutput {
                exit_code: Some(0),
                stdout: format!("Number of regular files transferred: {}\n", copied),
                stderr: String::new(),
            })
        }
    }

    struct Fixture {
        temp: TempDir,
        config: Config,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_modules(&["fedora-epel"], "")
        }

        /// Target mirroring `modules`, with `extra` appended to the config
        fn with_modules(modules: &[&str], extra: &str) -> Self {
            let temp = TempDir::new().unwrap();
            let names: Vec<String> = modules.iter().map(|m| format!("{:?}", m)).collect();
            let toml = format!(
                r#"
[mirror]
dest_dir = "{root}/mirror"
state_file = "{root}/state/epel.state"
remote = "rsync://upstream.example.org"
master_module = "fedora-buffet"
modules = [{modules}]
extra_files = []
scratch_dir = "{root}/scratch"
{extra}
"#,
                root = temp.path().display(),
                modules = names.join(", "),
                extra = extra,
            );
            let config = Config::from_toml_str(&toml).unwrap();
            fs::create_dir_all(temp.path().join("upstream/epel/sub")).unwrap();
            fs::create_dir_all(temp.path().join("upstream/archive")).unwrap();
            Self { temp, config }
        }

        fn upstream(&self) -> PathBuf {
            self.temp.path().join("upstream")
        }

        fn local(&self, path: &str) -> PathBuf {
            self.local_in("epel", path)
        }

        fn local_in(&self, dir: &str, path: &str) -> PathBuf {
            self.temp.path().join("mirror").join(dir).join(path)
        }

        fn publish(&self, version: u32, lines: &[&str]) {
            self.publish_in("epel", version, lines);
        }

        fn publish_in(&self, dir: &str, version: u32, lines: &[&str]) {
            let mut content = format!("[Version]\n{}\n\n[Files]\n", version);
            for line in lines {
                content.push_str(line);
                content.push('\n');
            }
            content.push_str("\n[End]\n");
            self.publish_raw(dir, content.as_bytes());
        }

        fn publish_raw(&self, dir: &str, content: &[u8]) {
            let name = format!("fullfiletimelist-{}", dir);
            fs::write(self.upstream().join(dir).join(name), content).unwrap();
        }

        fn coordinator(&self) -> RunCoordinator<LocalCopyTool> {
            let tool = LocalCopyTool {
                upstream: self.upstream(),
                calls: AtomicUsize::new(0),
            };
            RunCoordinator::new(self.config.clone(), tool).unwrap()
        }

        fn state(&self) -> Option<String> {
            fs::read_to_string(&self.config.mirror.state_file).ok()
        }
    }

    const LINES: &[&str] = &[
        "100\td\t0\t.",
        "100\tf\t5\ta.txt",
        "100\td\t0\tsub",
        "100\tf\t3\tsub/b.txt",
    ];

    fn seed_upstream(f: &Fixture) {
        fs::write(f.upstream().join("epel/a.txt"), b"aaaaa").unwrap();
        fs::write(f.upstream().join("epel/sub/b.txt"), b"bbb").unwrap();
        f.publish(3, LINES);
    }

    const ARCHIVE_LINES: &[&str] = &["100\td\t0\t.", "100\tf\t2\tx.txt"];

    fn seed_archive(f: &Fixture) {
        fs::write(f.upstream().join("archive/x.txt"), b"xx").unwrap();
        f.publish_in("archive", 3, ARCHIVE_LINES);
    }

    const TWO_MODULES: &[&str] = &["fedora-epel", "fedora-archive"];

    #[tokio::test]
    async fn test_first_run_mirrors_module() {
        let f = Fixture::new();
        seed_upstream(&f);

        let status = f.coordinator().run(&RunOptions::default()).await;
        assert_eq!(status.outcome, RunOutcome::Success, "{:?}", status.error);
        assert_eq!(status.modules_changed, vec!["fedora-epel".to_string()]);
        assert_eq!(fs::read(f.local("a.txt")).unwrap(), b"aaaaa");
        assert_eq!(fs::read(f.local("sub/b.txt")).unwrap(), b"bbb");

        let state = f.state().unwrap();
        assert!(state.starts_with("LASTTIME="));
        assert!(f.config.status_file().exists());
        assert!(!f.temp.path().join("scratch").join(&status.run_id).exists());
    }

    #[tokio::test]
    async fn test_unchanged_manifest_is_skipped() {
        let f = Fixture::new();
        seed_upstream(&f);
        let coordinator = f.coordinator();

        let first = coordinator.run(&RunOptions::default()).await;
        assert_eq!(first.outcome, RunOutcome::Success);
        let calls_after_first = coordinator.tool().calls.load(Ordering::SeqCst);

        let second = coordinator.run(&RunOptions::default()).await;
        assert_eq!(second.outcome, RunOutcome::Success);
        assert_eq!(second.modules_skipped, vec!["fedora-epel".to_string()]);
        assert!(second.modules_changed.is_empty());
        // Only the manifest fetch
        assert_eq!(coordinator.tool().calls.load(Ordering::SeqCst), calls_after_first + 1);

        let forced = coordinator
            .run(&RunOptions {
                always_check: true,
                ..Default::default()
            })
            .await;
        assert_eq!(forced.modules_changed, vec!["fedora-epel".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_file_is_deleted() {
        let f = Fixture::new();
        seed_upstream(&f);
        let coordinator = f.coordinator();
        coordinator.run(&RunOptions::default()).await;

        fs::write(f.local("stale.img"), b"old").unwrap();
        let status = coordinator
            .run(&RunOptions {
                always_check: true,
                ..Default::default()
            })
            .await;
        assert_eq!(status.outcome, RunOutcome::Success);
        assert_eq!(status.deleted_files, 1);
        assert!(!f.local("stale.img").exists());
        assert!(f.local("fullfiletimelist-epel").exists());
    }

    #[tokio::test]
    async fn test_transfer_only_keeps_files_and_state() {
        let f = Fixture::new();
        seed_upstream(&f);
        let coordinator = f.coordinator();
        coordinator.run(&RunOptions::default()).await;
        let state_before = f.state();

        fs::write(f.local("stale.img"), b"old").unwrap();
        let status = coordinator
            .run(&RunOptions {
                always_check: true,
                transfer_only: true,
                last_mirror_time: Some(0),
                ..Default::default()
            })
            .await;
        assert_eq!(status.outcome, RunOutcome::Success);
        assert!(f.local("stale.img").exists());
        assert_eq!(f.state(), state_before);
    }

    #[tokio::test]
    async fn test_unsupported_version_aborts_without_mutation() {
        let f = Fixture::new();
        seed_upstream(&f);
        f.publish(4, LINES);

        let status = f.coordinator().run(&RunOptions::default()).await;
        assert_eq!(status.outcome, RunOutcome::ManifestError);
        assert_eq!(status.exit_code, 1);
        assert!(f.state().is_none());
        assert!(!f.local("a.txt").exists());
        assert!(!f.local("fullfiletimelist-epel").exists());
    }

    #[tokio::test]
    async fn test_stale_file_list_rolls_back() {
        let f = Fixture::new();
        seed_upstream(&f);
        // Listed upstream but gone by the time of the transfer
        fs::remove_file(f.upstream().join("epel/sub/b.txt")).unwrap();

        let status = f.coordinator().run(&RunOptions::default()).await;
        assert_eq!(status.outcome, RunOutcome::StaleFileList);
        assert!(f.state().is_none());
        assert!(!f.local("fullfiletimelist-epel").exists());
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let f = Fixture::new();
        seed_upstream(&f);

        let status = f
            .coordinator()
            .run(&RunOptions {
                dry_run: true,
                ..Default::default()
            })
            .await;
        assert_eq!(status.outcome, RunOutcome::Success);
        assert!(f.state().is_none());
        assert!(!f.local("a.txt").exists());
        assert!(!f.local("fullfiletimelist-epel").exists());
    }

    #[tokio::test]
    async fn test_lock_held() {
        let f = Fixture::new();
        seed_upstream(&f);
        let _held = TargetLock::try_acquire(&f.config.mirror.state_file).unwrap();

        let status = f.coordinator().run(&RunOptions::default()).await;
        assert_eq!(status.outcome, RunOutcome::LockHeld);
        assert_eq!(status.exit_code, 0);
        assert!(f.state().is_none());
    }

    #[tokio::test]
    async fn test_unknown_module_is_config_error() {
        let f = Fixture::new();
        let status = f
            .coordinator()
            .run(&RunOptions {
                modules: vec!["nonexistent".to_string()],
                ..Default::default()
            })
            .await;
        assert_eq!(status.outcome, RunOutcome::ConfigError);
    }
    #[tokio::test]
    async fn test_corrupt_manifest_skips_only_its_module() {
        let f = Fixture::with_modules(TWO_MODULES, "");
        seed_upstream(&f);
        f.publish_raw("archive", b"[Version]\n3\n[Files]\n100\td\t0\t.\n");

        let status = f.coordinator().run(&RunOptions::default()).await;
        assert_eq!(status.outcome, RunOutcome::Success, "{:?}", status.error);
        assert_eq!(status.modules_changed, vec!["fedora-epel".to_string()]);
        assert_eq!(status.modules_skipped, vec!["fedora-archive".to_string()]);
        assert_eq!(fs::read(f.local("a.txt")).unwrap(), b"aaaaa");
        assert!(!f.local_in("archive", "fullfiletimelist-archive").exists());
    }

    #[tokio::test]
    async fn test_undecodable_manifest_skips_only_its_module() {
        let f = Fixture::with_modules(TWO_MODULES, "");
        seed_upstream(&f);
        f.publish_raw(
            "archive",
            b"[Version]\n3\n[Files]\n100\td\t0\t.\n100\tf\t4\tcaf\xE9.txt\n[End]\n",
        );

        let status = f.coordinator().run(&RunOptions::default()).await;
        assert_eq!(status.outcome, RunOutcome::Success, "{:?}", status.error);
        assert_eq!(status.modules_changed, vec!["fedora-epel".to_string()]);
        assert_eq!(status.modules_skipped, vec!["fedora-archive".to_string()]);
        assert!(f.local("a.txt").exists());
        assert!(f.local("sub/b.txt").exists());
        assert!(f.state().is_some());
    }

    #[tokio::test]
    async fn test_lock_outlives_execution() {
        let f = Fixture::new();
        seed_upstream(&f);
        let coordinator = f.coordinator();
        let mut lock = None;
        let mut progress = RunProgress::default();

        coordinator
            .execute(&RunOptions::default(), "run-1", Utc::now(), &mut lock, &mut progress)
            .await
            .unwrap();
        assert!(lock.is_some());
        let module = f.config.resolve_modules(&[]).unwrap().remove(0);
        let recorded = coordinator.read_dir_list("run-1", &module).unwrap();
        let expected: BTreeSet<String> = ["", "sub"].iter().map(|s| s.to_string()).collect();
        assert_eq!(recorded, expected);
        assert!(matches!(
            TargetLock::try_acquire(&f.config.mirror.state_file),
            Err(MirrorError::LockHeld(_))
        ));

        drop(lock);
        assert!(TargetLock::try_acquire(&f.config.mirror.state_file).is_ok());
    }

    mod registry_checkin {
        use super::*;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        async fn registry() -> MockServer {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/xmlrpc"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_string("<string>Checked in successfully.</string>"),
                )
                .mount(&server)
                .await;
            server
        }

        fn fixture(server: &MockServer) -> Fixture {
            let extra = format!(
                r#"
[checkin]
enabled = true
endpoint = "{}/xmlrpc"
site = "example"
password = "secret"
host = "mirror.example.org"
max_retries = 1
retry_delay_secs = 0
"#,
                server.uri()
            );
            let f = Fixture::with_modules(TWO_MODULES, &extra);
            seed_upstream(&f);
            seed_archive(&f);
            f
        }

        async fn posts(server: &MockServer) -> Vec<serde_json::Value> {
            let requests = server.received_requests().await.unwrap_or_default();
            requests
                .iter()
                .map(|request| {
                    let body = String::from_utf8_lossy(&request.body).to_string();
                    let start = body.find("<string>").unwrap() + "<string>".len();
                    let end = body.find("</string>").unwrap();
                    crate::checkin::decode_payload(&body[start..end]).unwrap()
                })
                .collect()
        }

        #[tokio::test]
        async fn test_only_reconciled_modules_check_in() {
            let server = registry().await;
            let f = fixture(&server);
            let coordinator = f.coordinator();

            let first = coordinator.run(&RunOptions::default()).await;
            assert_eq!(first.outcome, RunOutcome::Success, "{:?}", first.error);
            assert_eq!(first.modules_changed.len(), 2);
            let sent = posts(&server).await;
            assert_eq!(sent.len(), first.modules_changed.len());
            let epel = sent
                .iter()
                .find(|p| p.get("Fedora EPEL").is_some())
                .unwrap();
            let tree = epel["Fedora EPEL"]["dirtree"].as_object().unwrap();
            assert!(tree.contains_key(""));
            assert!(tree.contains_key("sub"));

            // Nothing changed: both modules skipped, nothing re-reported
            let second = coordinator.run(&RunOptions::default()).await;
            assert_eq!(second.modules_skipped.len(), 2);
            assert!(second.modules_changed.is_empty());
            assert_eq!(posts(&server).await.len(), 2);
        }

        #[tokio::test]
        async fn test_checkin_only_reports_every_module() {
            let server = registry().await;
            let f = fixture(&server);
            let coordinator = f.coordinator();
            coordinator.run(&RunOptions::default()).await;
            let calls = coordinator.tool().calls.load(Ordering::SeqCst);

            let status = coordinator
                .run(&RunOptions {
                    checkin_only: true,
                    ..Default::default()
                })
                .await;
            assert_eq!(status.outcome, RunOutcome::Success);
            assert_eq!(posts(&server).await.len(), 4);
            // No fetch and no transfer
            assert_eq!(coordinator.tool().calls.load(Ordering::SeqCst), calls);
        }

        #[tokio::test]
        async fn test_dry_run_does_not_check_in() {
            let server = registry().await;
            let f = fixture(&server);

            let status = f
                .coordinator()
                .run(&RunOptions {
                    dry_run: true,
                    ..Default::default()
                })
                .await;
            assert_eq!(status.outcome, RunOutcome::Success);
            assert!(posts(&server).await.is_empty());
        }
    }
}
