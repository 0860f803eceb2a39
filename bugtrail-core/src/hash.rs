//! Report identity hashes.
//!
//! A report hash is the MD5 of a list of content fields joined with `|||`.
//! Fields are not escaped, so a field containing the separator can make two
//! different lists hash alike. Historical hashes were built this way and every
//! stored finding is keyed by them, so the format stays as it is.
//!
//! Computing a hash never fails. When the source line cannot be read or the
//! bug path is malformed, [`hash_content`] returns [`Degraded`]: the content
//! that could be assembled plus the reasons it is less precise than usual.
//! [`get_report_hash`] logs those reasons and hashes the content anyway.

use std::fmt::{self, Write as _};
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::error::Error;
use crate::source::{read_line, remove_whitespace};
use crate::types::{basename, Diagnostic, PathElement, SourceRange};

/// Separator placed between hash content fields.
pub const SEPARATOR: &str = "|||";

/// Which fields of a diagnostic feed the report hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashType {
    /// File name, message, and the whitespace-free source line with mapped columns.
    ContextFree,
    /// The main path point plus the columns of the control-flow edges.
    PathSensitive,
    /// `ContextFree` plus every event message along the bug path.
    DiagnosticMessage,
}

impl HashType {
    pub fn as_str(self) -> &'static str {
        match self {
            HashType::ContextFree => "context-free",
            HashType::PathSensitive => "path-sensitive",
            HashType::DiagnosticMessage => "diagnostic-message",
        }
    }

    /// Picks the variant for `diag`.
    ///
    /// Diagnostics without any event or control step (clang-tidy style output)
    /// always use `ContextFree`; the others use `path_aware`.
    pub fn for_diagnostic(diag: &Diagnostic, path_aware: HashType) -> HashType {
        if diag.has_path() {
            path_aware
        } else {
            HashType::ContextFree
        }
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for HashType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "context-free" | "context_free" => Ok(HashType::ContextFree),
            "path-sensitive" | "path_sensitive" => Ok(HashType::PathSensitive),
            "diagnostic-message" | "diagnostic_message" => Ok(HashType::DiagnosticMessage),
            other => Err(Error::UnknownHashType(other.to_owned())),
        }
    }
}

/// Why a hash is less precise than it should be.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DegradedReason {
    #[error("source file {0} does not exist")]
    SourceMissing(String),

    #[error("source file {path} could not be read: {reason}")]
    SourceUnreadable { path: String, reason: String },

    #[error("line {line} is past the end of {path}")]
    LineOutOfRange { path: String, line: u32 },

    #[error("{path} is not valid UTF-8; invalid bytes were dropped")]
    InvalidEncoding { path: String },

    #[error("diagnostic has no bug path")]
    MissingBugPath,

    #[error("last bug path element has no location")]
    MissingMainLocation,

    #[error("a control element has no edges; event columns were hashed instead")]
    MissingControlEdges,
}

/// Ordered fields a report hash is computed from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashContent(Vec<String>);

impl HashContent {
    pub fn fields(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// MD5 hex digest of the fields joined with [`SEPARATOR`].
    pub fn digest(&self) -> String {
        str_to_hash(&self.0.join(SEPARATOR))
    }
}

/// Content assembled despite one or more problems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Degraded {
    pub content: HashContent,
    pub reasons: Vec<DegradedReason>,
}

impl Degraded {
    pub(crate) fn log(&self, diag: &Diagnostic) {
        for reason in &self.reasons {
            match reason {
                DegradedReason::SourceMissing(_)
                | DegradedReason::MissingBugPath
                | DegradedReason::MissingMainLocation => error!(
                    checker = %diag.checker_name,
                    "failed to generate a precise report hash: {}",
                    reason
                ),
                _ => warn!(
                    checker = %diag.checker_name,
                    "report hash degraded: {}",
                    reason
                ),
            }
        }
    }
}

fn str_to_hash(content: &str) -> String {
    format!("{:x}", md5::compute(content.as_bytes()))
}

/// Assembles the hash content of `diag` for `hash_type`.
///
/// `file_path` is the on-disk path of the file the diagnostic points into;
/// only its base name becomes part of the content, so moving a tree does not
/// change hashes.
///
/// # Errors
///
/// Returns [`Degraded`] when the content could only be assembled partially.
/// Its `content` is still deterministic for the same inputs.
pub fn hash_content(
    diag: &Diagnostic,
    file_path: &str,
    hash_type: HashType,
) -> Result<HashContent, Degraded> {
    let mut reasons = Vec::new();
    let fields = match hash_type {
        HashType::ContextFree => context_free_fields(diag, file_path, &mut reasons),
        HashType::PathSensitive => path_sensitive_fields(diag, file_path, &mut reasons),
        HashType::DiagnosticMessage => {
            let mut fields = context_free_fields(diag, file_path, &mut reasons);
            fields.extend(diag.events().map(|(_, message)| message.to_owned()));
            fields
        }
    };

    let content = HashContent(fields);
    if reasons.is_empty() {
        Ok(content)
    } else {
        Err(Degraded { content, reasons })
    }
}

/// Computes the report hash of `diag`.
///
/// Never fails: degraded content is logged and hashed. A diagnostic with a
/// malformed path hashes to the digest of the empty string, which makes it
/// collide with every other malformed report of the same kind.
pub fn get_report_hash(diag: &Diagnostic, file_path: &str, hash_type: HashType) -> String {
    match hash_content(diag, file_path, hash_type) {
        Ok(content) => content.digest(),
        Err(degraded) => {
            degraded.log(diag);
            degraded.content.digest()
        }
    }
}

/// Reads the source line for hashing, recording why it may be empty.
fn line_for_hash(path: &str, line: u32, reasons: &mut Vec<DegradedReason>) -> String {
    match read_line(path, line) {
        Ok(source) => {
            if source.had_invalid_utf8 {
                reasons.push(DegradedReason::InvalidEncoding {
                    path: path.to_owned(),
                });
            }
            source.text
        }
        Err(reason) => {
            reasons.push(reason);
            String::new()
        }
    }
}

fn context_free_fields(
    diag: &Diagnostic,
    file_path: &str,
    reasons: &mut Vec<DegradedReason>,
) -> Vec<String> {
    let location = &diag.location;
    let line = line_for_hash(file_path, location.line, reasons);

    // Both columns derive from the start column; the end column never took part.
    let (stripped, from_col) = remove_whitespace(&line, location.col);
    let (_, until_col) = remove_whitespace(&line, location.col);

    vec![
        basename(file_path).to_owned(),
        diag.message.clone(),
        stripped,
        from_col.to_string(),
        until_col.to_string(),
    ]
}

fn path_sensitive_fields(
    diag: &Diagnostic,
    file_path: &str,
    reasons: &mut Vec<DegradedReason>,
) -> Vec<String> {
    let Some(main) = diag.bug_path.last() else {
        reasons.push(DegradedReason::MissingBugPath);
        return Vec::new();
    };
    let Some(location) = main.location() else {
        reasons.push(DegradedReason::MissingMainLocation);
        return Vec::new();
    };

    let line = line_for_hash(file_path, location.line, reasons);
    let mut fields = vec![
        basename(file_path).to_owned(),
        diag.checker_name.clone(),
        diag.message.clone(),
        line,
        location.col.to_string(),
        location.col.to_string(),
    ];

    let controls: Vec<_> = diag
        .bug_path
        .iter()
        .filter_map(|element| match element {
            PathElement::Control { edges } => Some(edges.first()),
            _ => None,
        })
        .collect();

    // One control element without edges switches the whole diagnostic over
    // to event columns.
    if controls.iter().any(Option::is_none) {
        reasons.push(DegradedReason::MissingControlEdges);
        fields.extend(diag.events().map(|(location, _)| location.col.to_string()));
        return fields;
    }

    let mut prev_end: Option<&SourceRange> = None;
    for edge in controls.into_iter().flatten() {
        if prev_end != Some(&edge.start) {
            push_range_cols(&mut fields, &edge.start);
        }
        push_range_cols(&mut fields, &edge.end);
        prev_end = Some(&edge.end);
    }

    fields
}

fn push_range_cols(fields: &mut Vec<String>, range: &SourceRange) {
    fields.push(range.begin.col.to_string());
    fields.push(range.end.col.to_string());
}

/// Computes the path hash of `diag`: an MD5 over every event step and the
/// checker name.
///
/// Events contribute `line|col|message|file-name` each, written back to back
/// with no separator between events or before the checker name. The
/// resulting ambiguity can only merge paths that should have stayed apart,
/// which over-deduplicates rather than duplicating.
pub fn get_report_path_hash(diag: &Diagnostic) -> String {
    let mut content = String::new();
    for (location, message) in diag.events() {
        let _ = write!(
            content,
            "{}|{}|{}|{}",
            location.line,
            location.col,
            message,
            location.file.basename()
        );
    }
    content.push_str(&diag.checker_name);

    if content.is_empty() {
        error!("failed to generate report path hash: no events and no checker name");
    }
    debug!(path_hash_content = %content);

    str_to_hash(&content)
}

impl Diagnostic {
    /// Returns the report hash, computing it from the diagnostic's own file
    /// when the parser did not supply one.
    pub fn ensure_report_hash(&mut self, hash_type: HashType) -> &str {
        self.fill_report_hash(hash_type);
        self.report_hash.as_deref().unwrap_or_default()
    }

    /// Sets `report_hash` unless the parser supplied one, logging any
    /// degradation. Returns the degradation reasons; empty for a precise or
    /// precomputed hash.
    pub(crate) fn fill_report_hash(&mut self, hash_type: HashType) -> Vec<DegradedReason> {
        if self.report_hash.is_some() {
            return Vec::new();
        }
        let file_path = self.location.file.path().to_owned();
        let (hash, reasons) = match hash_content(self, &file_path, hash_type) {
            Ok(content) => (content.digest(), Vec::new()),
            Err(degraded) => {
                degraded.log(self);
                (degraded.content.digest(), degraded.reasons)
            }
        };
        self.report_hash = Some(hash);
        reasons
    }
}
