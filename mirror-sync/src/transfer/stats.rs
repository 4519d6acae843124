//! Transfer statistics.
//!
//! Parses the summary rsync prints with `--stats` and formats the numbers
//! for log lines and the status artifact.

use serde::{Deserialize, Serialize};

/// Statistics for one successful transfer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferStats {
    /// Number of regular files transferred
    pub files_transferred: u64,

    /// Total size of all files in the file list
    pub total_file_size: u64,

    /// Total size of the files that were transferred
    pub transferred_file_size: u64,

    pub bytes_sent: u64,

    pub bytes_received: u64,

    /// File list generation time (seconds)
    pub file_list_generation_secs: f64,

    /// File list transfer time (seconds)
    pub file_list_transfer_secs: f64,

    /// Effective throughput in bytes/second
    pub bytes_per_second: f64,

    /// Size speedup ratio reported by the tool
    pub speedup: f64,
}

impl TransferStats {
    /// Parse `--stats` output. Unknown lines are ignored and missing values
    /// stay zero.
    pub fn parse(output: &str) -> Self {
        let mut stats = Self::default();

        for line in output.lines() {
            let line = line.trim();

            if let Some(rest) = line
                .strip_prefix("Number of regular files transferred:")
                .or_else(|| line.strip_prefix("Number of files transferred:"))
            {
                stats.files_transferred = parse_count(rest);
            } else if let Some(rest) = line.strip_prefix("Total file size:") {
                stats.total_file_size = parse_count(rest);
            } else if let Some(rest) = line.strip_prefix("Total transferred file size:") {
                stats.transferred_file_size = parse_count(rest);
            } else if let Some(rest) = line.strip_prefix("Total bytes sent:") {
                stats.bytes_sent = parse_count(rest);
            } else if let Some(rest) = line.strip_prefix("Total bytes received:") {
                stats.bytes_received = parse_count(rest);
            } else if let Some(rest) = line.strip_prefix("File list generation time:") {
                stats.file_list_generation_secs = parse_float(rest);
            } else if let Some(rest) = line.strip_prefix("File list transfer time:") {
                stats.file_list_transfer_secs = parse_float(rest);
            } else if line.starts_with("sent ") && line.contains("bytes/sec") {
                // sent 57 bytes  received 1,365 bytes  2,844.00 bytes/sec
                let words: Vec<&str> = line.split_whitespace().collect();
                if let Some(pos) = words.iter().position(|w| *w == "bytes/sec") {
                    if pos > 0 {
                        stats.bytes_per_second = parse_float(words[pos - 1]);
                    }
                }
            } else if let Some(pos) = line.find("speedup is") {
                stats.speedup = parse_float(&line[pos + "speedup is".len()..]);
            }
        }

        stats
    }

    /// One-line human readable summary
    pub fn summary(&self) -> String {
        format!(
            "{} files, {} of {} transferred, sent {}, received {}, {}, speedup {:.2}",
            self.files_transferred,
            format_bytes(self.transferred_file_size),
            format_bytes(self.total_file_size),
            format_bytes(self.bytes_sent),
            format_bytes(self.bytes_received),
            format_rate(self.bytes_per_second),
            self.speedup,
        )
    }
}

/// First numeric token of a stats value, with thousands separators removed
fn first_token(value: &str) -> String {
    value
        .split_whitespace()
        .next()
        .unwrap_or("")
        .chars()
        .filter(|c| *c != ',')
        .collect()
}

fn parse_count(value: &str) -> u64 {
    first_token(value).parse().unwrap_or(0)
}

fn parse_float(value: &str) -> f64 {
    first_token(value).parse().unwrap_or(0.0)
}

/// Binary-prefixed size, e.g. `1023 B` or `1.5 KiB`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let exponent = match bytes {
        0 => 0,
        n => ((63 - n.leading_zeros()) / 10).min(4) as usize,
    };
    if exponent == 0 {
        return format!("{} B", bytes);
    }
    let scaled = bytes as f64 / (1u64 << (10 * exponent)) as f64;
    format!("{:.1} {}", scaled, UNITS[exponent])
}

pub fn format_rate(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second.max(0.0) as u64))
}

/// Compact elapsed time: `42s`, `3m07s`, `2h05m00s`
pub fn format_duration(seconds: u64) -> String {
    let (hours, minutes, secs) = (seconds / 3600, seconds / 60 % 60, seconds % 60);
    match (hours, minutes) {
        (0, 0) => format!("{}s", secs),
        (0, _) => format!("{}m{:02}s", minutes, secs),
        _ => format!("{}h{:02}m{:02}s", hours, minutes, secs),
    }
}
