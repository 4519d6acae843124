//! Manifest (file list) types.
//!
//! A manifest lists every entry of a remote module with its modification
//! time, size and type, followed by a checksum section and an `[End]`
//! sentinel. Manifests for large modules run to millions of lines, so they
//! are only ever read as a stream (see [`reader`]).

pub mod reader;
pub mod store;

use std::fmt;

/// Highest manifest format version this crate understands
pub const SUPPORTED_VERSION: u32 = 3;

/// Type of a manifest entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    fn from_code(code: char) -> Option<Self> {
        match code {
            'f' => Some(Self::File),
            'd' => Some(Self::Directory),
            'l' => Some(Self::Symlink),
            _ => None,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::File => "f",
            Self::Directory => "d",
            Self::Symlink => "l",
        };
        f.write_str(code)
    }
}

/// One line of the `[Files]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub kind: EntryKind,

    /// Pre-release content, only mirrored when explicitly enabled
    pub restricted: bool,

    /// Last modification time (seconds since Unix epoch)
    pub mtime: i64,

    pub size: u64,

    /// Path relative to the module root; the root itself is `.`
    pub path: String,
}

impl ManifestEntry {
    /// Parse a tab-separated `mtime<TAB>type<TAB>size<TAB>path` line.
    /// Returns None for malformed lines.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.splitn(4, '\t');
        let mtime = fields.next()?.trim().parse().ok()?;

        let type_field = fields.next()?;
        let mut chars = type_field.chars();
        let kind = EntryKind::from_code(chars.next()?)?;
        let restricted = match chars.as_str() {
            "" => false,
            "-" => true,
            _ => return None,
        };

        let size = fields.next()?.trim().parse().ok()?;
        let path = fields.next()?;
        if path.is_empty() {
            return None;
        }

        Some(Self {
            kind,
            restricted,
            mtime,
            size,
            path: path.to_string(),
        })
    }

    /// Path relative to the module root, with the root itself as `""`
    pub fn relative_path(&self) -> &str {
        normalize_path(&self.path)
    }
}

/// Strip `./` prefixes and map `.` to the empty root path
pub fn normalize_path(path: &str) -> &str {
    let mut p = path;
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    if p == "." {
        ""
    } else {
        p.trim_end_matches('/')
    }
}

/// Digest algorithm declared by a `[Checksums <ALGO>]` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "SHA1" => Some(Self::Sha1),
            "SHA256" => Some(Self::Sha256),
            _ => None,
        }
    }
}

/// One line of the checksum section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    pub algorithm: ChecksumAlgorithm,
    pub digest: String,
    pub path: String,
}

impl ChecksumEntry {
    pub fn parse_line(algorithm: ChecksumAlgorithm, line: &str) -> Option<Self> {
        let (digest, path) = line.split_once('\t')?;
        if digest.is_empty() || path.is_empty() {
            return None;
        }
        Some(Self {
            algorithm,
            digest: digest.trim().to_ascii_lowercase(),
            path: normalize_path(path).to_string(),
        })
    }
}
