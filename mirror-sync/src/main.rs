//! Mirror Sync - Main entry point
//!
//! Runs one synchronisation of the configured target and exits.

use anyhow::Result;
use clap::Parser;
use mirror_sync::executor::status::RunStatus;
use mirror_sync::{config::Config, utils, MirrorError, RunCoordinator, RunOptions};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "/etc/mirror-sync.toml")]
    config: PathBuf,

    /// Check every module even if its file list did not change
    #[arg(short, long)]
    always_check: bool,

    /// Show what would be transferred and deleted without changing anything
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Transfer only: no deletions and no state update
    #[arg(short = 'N', long)]
    transfer_only: bool,

    /// Use this last mirror time (epoch seconds) instead of the stored one
    #[arg(short = 't', long, value_name = "EPOCH")]
    last_mirror_time: Option<i64>,

    /// Pretend the last run happened this many seconds earlier
    #[arg(short = 'T', long, value_name = "SECS")]
    backdate: Option<i64>,

    /// Only check in with the registry, without transferring
    #[arg(long)]
    checkin_only: bool,

    /// Restore the timestamp of every directory
    #[arg(long)]
    dir_times: bool,

    /// Transfer every file whose path matches this pattern
    #[arg(long, value_name = "REGEX")]
    refresh: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Restrict the run to this module (repeatable)
    #[arg(short, long = "module", value_name = "NAME")]
    modules: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load and check configuration before anything touches the mirror
    let config = Config::load(&args.config)?;

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log_level());
    utils::logger::init(&log_level, config.log.file.as_deref())?;

    if let Err(e) = config.validate() {
        refuse(&config, &e);
    }

    tracing::info!(
        "Starting mirror-sync v{} for {}",
        env!("CARGO_PKG_VERSION"),
        config.mirror.state_file.display()
    );

    let options = RunOptions {
        always_check: args.always_check,
        dry_run: args.dry_run,
        transfer_only: args.transfer_only,
        last_mirror_time: args.last_mirror_time,
        backdate_secs: args.backdate,
        checkin_only: args.checkin_only,
        dir_times: args.dir_times,
        refresh: args.refresh,
        modules: args.modules,
    };

    let coordinator = match RunCoordinator::from_config(config.clone()) {
        Ok(coordinator) => coordinator,
        Err(e) => refuse(&config, &e),
    };
    let status = coordinator.run(&options).await;

    std::process::exit(status.exit_code);
}

/// Record a config-error status and exit without running
fn refuse(config: &Config, error: &MirrorError) -> ! {
    tracing::error!("{}", error);

    let status = RunStatus::config_error(config, error);
    let status_file = config.status_file();
    if let Err(e) = status.write(&status_file) {
        tracing::warn!("Failed to write status file {}: {}", status_file.display(), e);
    }
    std::process::exit(status.exit_code);
}
