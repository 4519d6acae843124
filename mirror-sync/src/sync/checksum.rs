//! Content checksums.
//!
//! Verifies local files against the manifest's checksum section and hashes
//! manifests themselves for the unchanged-module check.

use crate::manifest::{ChecksumAlgorithm, ChecksumEntry};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::{debug, warn};

const READ_BUF: usize = 64 * 1024;

fn hash_reader<D: Digest, R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Hex digest of a file's content
pub fn digest_file(algorithm: ChecksumAlgorithm, path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    match algorithm {
        ChecksumAlgorithm::Sha1 => hash_reader::<Sha1, _>(file),
        ChecksumAlgorithm::Sha256 => hash_reader::<Sha256, _>(file),
    }
}

/// SHA-256 of a file, used to detect unchanged manifests
pub fn sha256_file(path: &Path) -> io::Result<String> {
    digest_file(ChecksumAlgorithm::Sha256, path)
}

/// Check every checksum entry whose path is a live, present local file.
///
/// `present` holds the local regular files eligible for verification.
/// Returns the paths whose content does not match.
pub fn verify_checksums(root: &Path, entries: &[ChecksumEntry], present: &HashSet<&str>) -> Vec<String> {
    let mut failed = Vec::new();

    for entry in entries {
        if !present.contains(entry.path.as_str()) {
            continue;
        }

        let path = root.join(&entry.path);
        match digest_file(entry.algorithm, &path) {
            Ok(digest) if digest == entry.digest => {}
            Ok(digest) => {
                warn!(
                    "Checksum mismatch for {}: expected {}, found {}",
                    path.display(),
                    entry.digest,
                    digest
                );
                failed.push(entry.path.clone());
            }
            Err(e) => {
                debug!("Could not checksum {}: {}", path.display(), e);
                failed.push(entry.path.clone());
            }
        }
    }

    failed
}
