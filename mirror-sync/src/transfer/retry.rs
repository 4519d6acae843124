//! Retry policy for transfer operations.

use super::{classify, Outcome, TransferRequest, TransferStats, TransferTool};
use crate::{MirrorError, Result};
use std::time::Duration;
use tracing::{error, info, warn};

/// Exponential backoff: `base * 2^attempt` after each retryable failure
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(1))
    }
}

/// A retryable failure that was followed by a backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEvent {
    pub attempt: u32,
    pub reason: String,
    pub delay: Duration,
}

/// Result of a successful (possibly retried) transfer
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub stats: TransferStats,
    pub attempts: u32,
    pub retries: Vec<RetryEvent>,
}

/// Runs transfer requests through a [`TransferTool`] with retry/backoff
pub struct TransferExecutor<T> {
    tool: T,
    policy: RetryPolicy,
}

impl<T: TransferTool> TransferExecutor<T> {
    pub fn new(tool: T, policy: RetryPolicy) -> Self {
        Self { tool, policy }
    }

    pub fn tool(&self) -> &T {
        &self.tool
    }

    /// Perform one transfer operation, retrying transport failures
    pub async fn run(&self, request: &TransferRequest) -> Result<TransferReport> {
        let mut retries = Vec::new();

        info!(
            "Starting {} transfer: {} entries from {}",
            request.label,
            request.files.len(),
            request.source
        );

        for attempt in 1..=self.policy.max_attempts {
            let raw = self.tool.invoke(request).await?;

            match classify(&raw) {
                Outcome::Succeeded => {
                    let stats = TransferStats::parse(&raw.stdout);
                    info!(
                        "{} transfer finished after {} attempt(s): {}",
                        request.label,
                        attempt,
                        stats.summary()
                    );
                    return Ok(TransferReport {
                        stats,
                        attempts: attempt,
                        retries,
                    });
                }
                Outcome::RetryableFailure(kind) => {
                    if attempt == self.policy.max_attempts {
                        error!(
                            "{} transfer failed with {} after {} attempts",
                            request.label, kind, attempt
                        );
                        return Err(MirrorError::Transport(format!(
                            "{} transfer: {} after {} attempts",
                            request.label, kind, attempt
                        )));
                    }

                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        "{} transfer attempt {}/{} failed with {}, retrying in {:?}",
                        request.label, attempt, self.policy.max_attempts, kind, delay
                    );
                    retries.push(RetryEvent {
                        attempt,
                        reason: kind.to_string(),
                        delay,
                    });
                    tokio::time::sleep(delay).await;
                }
                Outcome::StaleFileList(kind) => {
                    warn!(
                        "{} transfer hit missing source entries ({}); the file list is stale",
                        request.label, kind
                    );
                    return Err(MirrorError::StaleFileList(format!(
                        "{} transfer: {}: {}",
                        request.label,
                        kind,
                        last_lines(&raw.stderr, 5)
                    )));
                }
                Outcome::FatalFailure(kind) => {
                    error!(
                        "{} transfer failed with unexpected result {}\nstdout:\n{}\nstderr:\n{}",
                        request.label, kind, raw.stdout, raw.stderr
                    );
                    return Err(MirrorError::UnexpectedTransfer(format!(
                        "{} transfer: {}",
                        request.label, kind
                    )));
                }
            }
        }

        // max_attempts is at least 1, so the loop always returns
        Err(MirrorError::Transport(format!(
            "{} transfer: no attempts made",
            request.label
        )))
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
