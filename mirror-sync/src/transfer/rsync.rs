//! rsync subprocess adapter.

use super::{RawOutput, TransferRequest, TransferTool};
use crate::config::Config;
use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs rsync with an explicit `--files-from` list
#[derive(Debug, Clone)]
pub struct RsyncTool {
    binary: PathBuf,
    options: Vec<String>,
    timeout_secs: u64,
    /// Where file lists are written for the duration of a call
    list_dir: PathBuf,
}

impl RsyncTool {
    pub fn new(binary: PathBuf, options: Vec<String>, timeout_secs: u64, list_dir: PathBuf) -> Self {
        Self {
            binary,
            options,
            timeout_secs,
            list_dir,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.mirror.rsync_path.clone(),
            config.mirror.rsync_options.clone(),
            config.mirror.timeout_secs,
            config.mirror.scratch_dir.clone(),
        )
    }

    /// Full argument list for one invocation
    pub fn build_args(&self, request: &TransferRequest, list_file: &Path) -> Vec<String> {
        let mut args = self.options.clone();
        args.push("--stats".to_string());
        args.push(format!("--timeout={}", self.timeout_secs));
        args.push(format!("--files-from={}", list_file.display()));
        if request.dry_run {
            args.push("--dry-run".to_string());
        }
        args.push(request.source.clone());

        let mut dest = request.dest.display().to_string();
        if !dest.ends_with('/') {
            dest.push('/');
        }
        args.push(dest);
        args
    }
}

#[async_trait]
impl TransferTool for RsyncTool {
    async fn invoke(&self, request: &TransferRequest) -> Result<RawOutput> {
        tokio::fs::create_dir_all(&self.list_dir).await?;
        let list_file = self
            .list_dir
            .join(format!("files-from-{}-{}", request.label, uuid::Uuid::new_v4()));

        let mut list = request.files.join("\n");
        list.push('\n');
        tokio::fs::write(&list_file, list).await?;

        let args = self.build_args(request, &list_file);
        debug!("Running {} {}", self.binary.display(), args.join(" "));

        let output = Command::new(&self.binary).args(&args).output().await;

        if let Err(e) = tokio::fs::remove_file(&list_file).await {
            warn!("Failed to remove file list {}: {}", list_file.display(), e);
        }
        let output = output?;

        Ok(RawOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dry_run: bool) -> TransferRequest {
        TransferRequest {
            label: "content".to_string(),
            source: "rsync://dl.example.org/fedora-buffet/".to_string(),
            dest: PathBuf::from("/srv/mirror"),
            files: vec!["fedora/a".to_string()],
            dry_run,
        }
    }

    #[test]
    fn test_build_args() {
        let tool = RsyncTool::new(
            PathBuf::from("rsync"),
            vec!["-aSH".to_string()],
            600,
            PathBuf::from("/tmp"),
        );
        let args = tool.build_args(&request(false), Path::new("/tmp/list"));
        assert_eq!(
            args,
            vec![
                "-aSH",
                "--stats",
                "--timeout=600",
                "--files-from=/tmp/list",
                "rsync://dl.example.org/fedora-buffet/",
                "/srv/mirror/",
            ]
        );

        let args = tool.build_args(&request(true), Path::new("/tmp/list"));
        assert!(args.contains(&"--dry-run".to_string()));
    }

    #[tokio::test]
    async fn test_invoke_missing_binary_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = RsyncTool::new(
            dir.path().join("no-such-rsync"),
            vec![],
            10,
            dir.path().to_path_buf(),
        );
        assert!(tool.invoke(&request(false)).await.is_err());

        // The file list is cleaned up even when the spawn fails
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
