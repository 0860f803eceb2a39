use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Returns the final component of a `/`-separated path.
///
/// Mirrors POSIX `basename` semantics on the raw string: a trailing slash
/// yields an empty name. Hash content depends on this, so it must not go
/// through `Path::file_name`, which normalises trailing separators away.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// A source file referenced by diagnostics.
///
/// Immutable once constructed. Diagnostics share one `File` through `Arc`
/// rather than copying it, so two references to the same file compare equal
/// by pointer as well as by path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    path: String,
    content_hash: Option<String>, // SHA-256 hex of the file bytes, when known
}

impl File {
    /// A file known only by its path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content_hash: None,
        }
    }

    /// A file whose content is known; the content hash is computed eagerly.
    pub fn from_bytes(path: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            path: path.into(),
            content_hash: Some(format!("{:x}", Sha256::digest(bytes))),
        }
    }

    /// Reads `path` from disk and hashes its content.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the file cannot be read.
    pub fn load(path: impl Into<String>) -> std::io::Result<Self> {
        let path = path.into();
        let bytes = std::fs::read(&path)?;
        Ok(Self::from_bytes(path, &bytes))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    pub fn basename(&self) -> &str {
        basename(&self.path)
    }

    /// Path equality: both files were referenced by the same path string.
    pub fn same_path(&self, other: &File) -> bool {
        self.path == other.path
    }

    /// Content equality: both files have a known content hash and they match.
    ///
    /// Returns `false` when either side was constructed without content.
    pub fn same_content(&self, other: &File) -> bool {
        match (&self.content_hash, &other.content_hash) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// A point in a source file. Lines and columns are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub col: u32,
}

/// An inclusive `[begin, end]` span, as analyzers report token ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRange {
    pub begin: Position,
    pub end: Position,
}

/// One control-flow edge: execution jumps from the `start` range to the `end` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub start: SourceRange,
    pub end: SourceRange,
}

/// A location inside a diagnostic: the main report point or a bug-path step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: Arc<File>,
    pub line: u32,
    pub col: u32,
    pub end_line: Option<u32>,
    pub end_col: Option<u32>,
}

/// Discriminant of a [`PathElement`], used where only the kind matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Event,
    Control,
    Note,
    MacroExpansion,
}

/// One ordered step of a bug path.
///
/// Order within `Diagnostic::bug_path` is execution order and is preserved
/// exactly as the parser produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathElement {
    /// A described step ("Assuming 'x' is null").
    Event { location: Location, message: String },
    /// A branch taken; only the edges carry location information.
    Control { edges: Vec<Edge> },
    /// Additional context attached to the report.
    Note { location: Location, message: String },
    /// A macro expanded somewhere along the path.
    MacroExpansion {
        location: Location,
        name: String,
        expansion: String,
    },
}

impl PathElement {
    pub fn kind(&self) -> PathKind {
        match self {
            PathElement::Event { .. } => PathKind::Event,
            PathElement::Control { .. } => PathKind::Control,
            PathElement::Note { .. } => PathKind::Note,
            PathElement::MacroExpansion { .. } => PathKind::MacroExpansion,
        }
    }

    /// The element's own location; control elements have none.
    pub fn location(&self) -> Option<&Location> {
        match self {
            PathElement::Event { location, .. }
            | PathElement::Note { location, .. }
            | PathElement::MacroExpansion { location, .. } => Some(location),
            PathElement::Control { .. } => None,
        }
    }
}

/// One analyzer finding in canonical form.
///
/// A value object: parsers build it once, the hash engine fills `report_hash`
/// once, and nothing mutates it afterwards. Detection status lives in the
/// storage layer, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub location: Location,
    pub checker_name: String,
    pub analyzer_name: String,
    pub message: String,
    pub bug_path: Vec<PathElement>,
    pub report_hash: Option<String>,
}

impl Diagnostic {
    /// Iterates over the event elements of the bug path, in path order.
    pub fn events(&self) -> impl Iterator<Item = (&Location, &str)> {
        self.bug_path.iter().filter_map(|e| match e {
            PathElement::Event { location, message } => Some((location, message.as_str())),
            _ => None,
        })
    }

    /// True when the analyzer supplied any event or control step.
    pub fn has_path(&self) -> bool {
        self.bug_path
            .iter()
            .any(|e| matches!(e.kind(), PathKind::Event | PathKind::Control))
    }
}

/// Checker severity, taken from checker metadata rather than from each report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Unspecified,
    Style,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Unspecified => "unspecified",
            Severity::Style => "style",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unspecified" => Ok(Severity::Unspecified),
            "style" => Ok(Severity::Style),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(Error::InvalidBatch(format!("unknown severity '{other}'"))),
        }
    }
}

/// Lifecycle state of a finding within a Run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DetectionStatus {
    New,
    Unresolved,
    Resolved,
    Reopened,
    /// The producing checker was explicitly disabled for the latest batch.
    Off,
    /// The producing checker did not run at all (analyzer missing or unsupported).
    Unavailable,
}

impl DetectionStatus {
    pub const ALL: [DetectionStatus; 6] = [
        DetectionStatus::New,
        DetectionStatus::Unresolved,
        DetectionStatus::Resolved,
        DetectionStatus::Reopened,
        DetectionStatus::Off,
        DetectionStatus::Unavailable,
    ];

    /// Wire/storage name, as kept in the `detection_status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            DetectionStatus::New => "new",
            DetectionStatus::Unresolved => "unresolved",
            DetectionStatus::Resolved => "resolved",
            DetectionStatus::Reopened => "reopened",
            DetectionStatus::Off => "off",
            DetectionStatus::Unavailable => "unavailable",
        }
    }

    /// Live findings are the ones the latest batch considers present.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            DetectionStatus::New | DetectionStatus::Unresolved | DetectionStatus::Reopened
        )
    }
}

impl fmt::Display for DetectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DetectionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DetectionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::UnknownStatus(s.to_owned()))
    }
}

/// A named, long-lived container of reports for one analysed target.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: String,           // UUID v4 text
    pub name: String,
    pub created_at: i64,      // Unix timestamp seconds
    pub updated_at: i64,      // Unix timestamp seconds
}

/// One storage event within a Run. Entries are never modified after insert.
#[derive(Debug, Clone)]
pub struct RunHistory {
    pub id: String,           // UUID v4 text
    pub run_id: String,
    pub time: i64,
    pub analyzer_commands: Vec<String>,
    pub version_tag: Option<String>,
}

/// The persisted state of one `bug_hash` within a Run.
///
/// `first_seen_history` and `last_seen_history` bracket the storage events in
/// which the finding was observed.
#[derive(Debug, Clone)]
pub struct DetectionRecord {
    pub id: String,
    pub run_id: String,
    pub bug_hash: String,
    pub path_hash: String,
    pub file_path: String,
    pub line: u32,
    pub col: u32,
    pub checker_name: String,
    pub analyzer_name: String,
    pub message: String,
    pub severity: Severity,
    pub detection_status: DetectionStatus,
    pub detected_at: i64,
    pub fixed_at: Option<i64>,
    pub first_seen_history: String,
    pub last_seen_history: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basename_keeps_trailing_slash_semantics() {
        assert_eq!(basename("/src/lib/div.c"), "div.c");
        assert_eq!(basename("div.c"), "div.c");
        assert_eq!(basename("/src/lib/"), "");
    }

    #[test]
    fn test_same_content_needs_both_hashes() {
        let a = File::from_bytes("/a/x.c", b"int x;");
        let b = File::from_bytes("/b/x.c", b"int x;");
        let unknown = File::new("/a/x.c");

        assert!(a.same_content(&b));
        assert!(!a.same_path(&b));
        assert!(a.same_path(&unknown));
        assert!(!a.same_content(&unknown));
        assert_eq!(a.content_hash().map(str::len), Some(64));
    }

    #[test]
    fn test_load_hashes_file_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("x.c");
        std::fs::write(&path, b"int x;").unwrap();

        let loaded = File::load(path.to_string_lossy().to_string()).unwrap();
        assert!(loaded.same_content(&File::from_bytes("other.c", b"int x;")));
    }

    #[test]
    fn test_detection_status_names() {
        for status in DetectionStatus::ALL {
            assert_eq!(status.as_str().parse::<DetectionStatus>().unwrap(), status);
        }
        assert!(matches!(
            "fixed".parse::<DetectionStatus>(),
            Err(Error::UnknownStatus(_))
        ));
        assert_eq!(format!("{:>8}", DetectionStatus::Off), "     off");
    }
}
