//! Streaming manifest reader.
//!
//! Walks a manifest one line at a time, tracking which bracketed section it
//! is in. Nothing beyond the current line is held in memory; callers decide
//! what to keep.

use super::{ChecksumAlgorithm, ChecksumEntry, ManifestEntry, SUPPORTED_VERSION};
use crate::{MirrorError, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::debug;

/// Section a line belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    Version,
    Files,
    Checksums(ChecksumAlgorithm),
    /// A section this reader does not interpret (including unknown digests)
    Other(String),
}

impl Section {
    fn from_header(name: &str) -> Section {
        let name = name.trim();
        if name.eq_ignore_ascii_case("version") {
            return Section::Version;
        }
        if name.eq_ignore_ascii_case("files") {
            return Section::Files;
        }
        if let Some(algo) = name
            .strip_prefix("Checksums")
            .and_then(ChecksumAlgorithm::from_name)
        {
            return Section::Checksums(algo);
        }
        Section::Other(name.to_string())
    }
}

/// Event produced by [`SectionReader::next_event`]
#[derive(Debug)]
pub enum Event<'a> {
    /// A bracketed section header
    Header(&'a Section),
    /// A non-blank line inside a section
    Line(&'a Section, &'a str),
}

/// Line-by-line reader with before-section / in-section / after-end state
pub struct SectionReader<R> {
    inner: R,
    raw: Vec<u8>,
    buf: String,
    section: Option<Section>,
    terminated: bool,
    line_no: usize,
}

impl<R: BufRead> SectionReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            raw: Vec::new(),
            buf: String::new(),
            section: None,
            terminated: false,
            line_no: 0,
        }
    }

    /// Read the next event; returns None at `[End]` or end of input.
    /// A line that is not valid UTF-8 makes the manifest corrupt.
    pub fn next_event(&mut self) -> Result<Option<Event<'_>>> {
        let produced = loop {
            if self.terminated {
                return Ok(None);
            }

            self.raw.clear();
            if self.inner.read_until(b'\n', &mut self.raw)? == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let text = std::str::from_utf8(&self.raw).map_err(|_| {
                MirrorError::CorruptManifest(format!("line {} is not valid UTF-8", self.line_no))
            })?;
            self.buf.clear();
            self.buf.push_str(text);

            match classify_line(&self.buf) {
                LineKind::Blank => continue,
                LineKind::End => {
                    self.terminated = true;
                    self.section = None;
                    return Ok(None);
                }
                LineKind::Header(section) => {
                    self.section = Some(section);
                    break Produced::Header;
                }
                // Lines before the first header carry no meaning
                LineKind::Content if self.section.is_none() => continue,
                LineKind::Content => break Produced::Line,
            }
        };

        let Some(section) = self.section.as_ref() else {
            return Ok(None);
        };
        Ok(Some(match produced {
            Produced::Header => Event::Header(section),
            Produced::Line => Event::Line(section, self.buf.trim_end_matches(['\n', '\r'])),
        }))
    }

    /// Whether the `[End]` sentinel has been reached
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn line_number(&self) -> usize {
        self.line_no
    }
}

enum LineKind {
    Blank,
    End,
    Header(Section),
    Content,
}

enum Produced {
    Header,
    Line,
}

fn classify_line(raw: &str) -> LineKind {
    let line = raw.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() {
        return LineKind::Blank;
    }
    match line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        Some(name) if name.trim().eq_ignore_ascii_case("end") => LineKind::End,
        Some(name) => LineKind::Header(Section::from_header(name)),
        None => LineKind::Content,
    }
}

/// Receives the interesting parts of a manifest during a scan
pub trait ManifestVisitor {
    fn entry(&mut self, entry: ManifestEntry);

    fn checksum(&mut self, _entry: ChecksumEntry) {}
}

/// Summary of a complete manifest scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub version: u32,
    pub entries: usize,
    pub checksums: usize,
    pub malformed: usize,
}

/// Prefix reader errors that lack a location with the manifest path
fn located(path: &Path) -> impl Fn(MirrorError) -> MirrorError + '_ {
    move |e| match e {
        MirrorError::CorruptManifest(msg) if !msg.starts_with(&*path.to_string_lossy()) => {
            MirrorError::CorruptManifest(format!("{}: {}", path.display(), msg))
        }
        other => other,
    }
}

fn open(path: &Path) -> Result<SectionReader<BufReader<File>>> {
    let file = File::open(path).map_err(|e| {
        MirrorError::CorruptManifest(format!("{}: {}", path.display(), e))
    })?;
    Ok(SectionReader::new(BufReader::new(file)))
}

/// Read the declared format version. A manifest without a `[Version]`
/// section is version 1.
pub fn read_version(path: &Path) -> Result<u32> {
    let mut reader = open(path)?;
    let mut in_version = false;

    while let Some(event) = reader.next_event().map_err(located(path))? {
        match event {
            Event::Header(Section::Version) => in_version = true,
            Event::Header(_) => break,
            Event::Line(Section::Version, text) => {
                return text.trim().parse().map_err(|_| {
                    MirrorError::CorruptManifest(format!(
                        "{}: invalid version line {:?}",
                        path.display(),
                        text
                    ))
                });
            }
            Event::Line(_, _) => {}
        }
    }

    if in_version {
        return Err(MirrorError::CorruptManifest(format!(
            "{}: empty [Version] section",
            path.display()
        )));
    }
    Ok(1)
}

/// Read the version and refuse anything newer than [`SUPPORTED_VERSION`]
pub fn check_version(path: &Path) -> Result<u32> {
    let version = read_version(path)?;
    if version > SUPPORTED_VERSION {
        return Err(MirrorError::UnsupportedManifestVersion {
            path: path.display().to_string(),
            found: version,
            supported: SUPPORTED_VERSION,
        });
    }
    Ok(version)
}

/// Stream every file entry and checksum to `visitor`. A manifest without
/// the `[End]` sentinel is corrupt.
pub fn scan<V: ManifestVisitor>(path: &Path, visitor: &mut V) -> Result<ScanSummary> {
    let mut reader = open(path)?;
    let mut summary = ScanSummary {
        version: 1,
        entries: 0,
        checksums: 0,
        malformed: 0,
    };

    while let Some(event) = reader.next_event().map_err(located(path))? {
        let Event::Line(section, text) = event else {
            continue;
        };
        match section {
            Section::Version => {
                if let Ok(v) = text.trim().parse() {
                    summary.version = v;
                }
            }
            Section::Files => match ManifestEntry::parse_line(text) {
                Some(entry) => {
                    summary.entries += 1;
                    visitor.entry(entry);
                }
                None => summary.malformed += 1,
            },
            Section::Checksums(algo) => match ChecksumEntry::parse_line(*algo, text) {
                Some(entry) => {
                    summary.checksums += 1;
                    visitor.checksum(entry);
                }
                None => summary.malformed += 1,
            },
            Section::Other(_) => {}
        }
    }

    if !reader.is_terminated() {
        return Err(MirrorError::CorruptManifest(format!(
            "{}: missing [End] marker after line {}",
            path.display(),
            reader.line_number()
        )));
    }

    if summary.malformed > 0 {
        debug!(
            "Skipped {} malformed lines in {}",
            summary.malformed,
            path.display()
        );
    }
    Ok(summary)
}

/// Raw `[Files]` section lines, used for the line-level manifest diff
pub fn file_lines(path: &Path) -> Result<Vec<String>> {
    let mut reader = open(path)?;
    let mut lines = Vec::new();

    while let Some(event) = reader.next_event().map_err(located(path))? {
        if let Event::Line(Section::Files, text) = event {
            lines.push(text.to_string());
        }
    }

    if !reader.is_terminated() {
        return Err(MirrorError::CorruptManifest(format!(
            "{}: missing [End] marker",
            path.display()
        )));
    }
    Ok(lines)
}

/// Whether the manifest ends with the `[End]` sentinel
pub fn has_terminator(path: &Path) -> Result<bool> {
    let mut reader = open(path)?;
    while reader.next_event().map_err(located(path))?.is_some() {}
    Ok(reader.is_terminated())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    const SAMPLE: &str = "[Version]\n3\n\n[Files]\n100\td\t0\t.\n200\tf\t10\ta.txt\n300\td-\t0\tbeta\nbroken line\n\n[Checksums SHA1]\nda39a3ee5e6b4b0d3255bfef95601890afd80709\ta.txt\n\n[End]\n";

    #[derive(Default)]
    struct Collect {
        entries: Vec<ManifestEntry>,
        checksums: Vec<ChecksumEntry>,
    }

    impl ManifestVisitor for Collect {
        fn entry(&mut self, entry: ManifestEntry) {
            self.entries.push(entry);
        }

        fn checksum(&mut self, entry: ChecksumEntry) {
            self.checksums.push(entry);
        }
    }

    fn write(dir: &TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("fullfiletimelist-test");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_section_reader_events() {
        let mut reader = SectionReader::new(Cursor::new("junk\n[Files]\n1\tf\t1\tx\n[End]\ntrailing\n"));

        match reader.next_event().unwrap() {
            Some(Event::Header(Section::Files)) => {}
            other => panic!("unexpected event: {:?}", other),
        }
        match reader.next_event().unwrap() {
            Some(Event::Line(Section::Files, text)) => assert_eq!(text, "1\tf\t1\tx"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(reader.next_event().unwrap().is_none());
        assert!(reader.is_terminated());
        assert!(reader.next_event().unwrap().is_none());
    }

    #[test]
    fn test_scan_collects_entries_and_checksums() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, SAMPLE);

        let mut collect = Collect::default();
        let summary = scan(&path, &mut collect).unwrap();

        assert_eq!(summary.version, 3);
        assert_eq!(summary.entries, 3);
        assert_eq!(summary.checksums, 1);
        assert_eq!(summary.malformed, 1);
        assert!(collect.entries[2].restricted);
        assert_eq!(collect.checksums[0].path, "a.txt");
    }

    #[test]
    fn test_scan_without_terminator_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "[Version]\n3\n[Files]\n1\tf\t1\tx\n");

        let mut collect = Collect::default();
        let result = scan(&path, &mut collect);
        assert!(matches!(result, Err(MirrorError::CorruptManifest(_))));
        assert!(!has_terminator(&path).unwrap());
    }

    #[test]
    fn test_version_checks() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, SAMPLE);
        assert_eq!(check_version(&path).unwrap(), 3);

        let path = write(&dir, "[Files]\n1\tf\t1\tx\n[End]\n");
        assert_eq!(read_version(&path).unwrap(), 1);

        let path = write(&dir, "[Version]\n4\n[Files]\n[End]\n");
        match check_version(&path) {
            Err(MirrorError::UnsupportedManifestVersion { found, supported, .. }) => {
                assert_eq!(found, 4);
                assert_eq!(supported, SUPPORTED_VERSION);
            }
            other => panic!("expected unsupported version, got {:?}", other),
        }

        let path = write(&dir, "[Version]\nthree\n[End]\n");
        assert!(matches!(read_version(&path), Err(MirrorError::CorruptManifest(_))));
    }

    #[test]
    fn test_file_lines() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, SAMPLE);
        let lines = file_lines(&path).unwrap();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "200\tf\t10\ta.txt");
    }

    #[test]
    fn test_undecodable_line_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fullfiletimelist-latin1");
        std::fs::write(&path, b"[Version]\n3\n[Files]\n100\tf\t4\tcaf\xE9.txt\n[End]\n").unwrap();

        // The version lives before the bad line
        assert_eq!(check_version(&path).unwrap(), 3);
        match has_terminator(&path) {
            Err(MirrorError::CorruptManifest(msg)) => {
                assert!(msg.contains("line 4"), "{}", msg);
                assert!(msg.contains("fullfiletimelist-latin1"), "{}", msg);
            }
            other => panic!("expected corrupt manifest, got {:?}", other),
        }
        let mut collect = Collect::default();
        assert!(matches!(scan(&path, &mut collect), Err(MirrorError::CorruptManifest(_))));
    }

    #[test]
    fn test_missing_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let result = read_version(&dir.path().join("absent"));
        assert!(matches!(result, Err(MirrorError::CorruptManifest(_))));
    }
}
