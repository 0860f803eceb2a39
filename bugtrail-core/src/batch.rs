//! One analysis batch: the reports a store operation receives, the files that
//! were analysed to produce them, and which checkers ran.
//!
//! Parsers for plist, SARIF, and clang-tidy output live outside this crate.
//! They hand over a JSON document in the `Raw*` shape below; [`Batch::from_json`]
//! validates it and interns file paths into shared [`File`] values, so the
//! hash engine only ever sees well-formed [`Diagnostic`]s.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::hash::DegradedReason;
use crate::types::{DetectionStatus, Diagnostic, Edge, File, Location, PathElement, Severity};

/// A location as written by a parser: file referenced by path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLocation {
    pub file: String,
    pub line: u32,
    pub col: u32,
    #[serde(default)]
    pub end_line: Option<u32>,
    #[serde(default)]
    pub end_col: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawPathElement {
    Event {
        location: RawLocation,
        message: String,
    },
    Control {
        #[serde(default)]
        edges: Vec<Edge>,
    },
    Note {
        location: RawLocation,
        message: String,
    },
    MacroExpansion {
        location: RawLocation,
        name: String,
        expansion: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDiagnostic {
    pub location: RawLocation,
    pub checker_name: String,
    #[serde(default)]
    pub analyzer_name: String,
    pub message: String,
    #[serde(default)]
    pub bug_path: Vec<RawPathElement>,
    #[serde(default)]
    pub report_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBatch {
    pub analyzed_files: Vec<String>,
    #[serde(default)]
    pub checkers: Checkers,
    #[serde(default)]
    pub analyzer_commands: Vec<String>,
    #[serde(default)]
    pub reports: Vec<RawDiagnostic>,
}

/// The files a batch analysed. Reconciliation never touches findings outside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileScope(BTreeSet<String>);

impl FileScope {
    pub fn contains(&self, path: &str) -> bool {
        self.0.contains(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for FileScope {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// How a batch ran a given checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enablement {
    Enabled,
    /// Explicitly turned off for this batch.
    Disabled,
    /// Not mentioned by any analyzer of this batch.
    Unknown,
}

/// Checker metadata shipped with a batch.
///
/// An empty `enabled` list means every checker ran except the ones listed in
/// `disabled`. Older producers ship no metadata at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkers {
    #[serde(default)]
    pub enabled: BTreeSet<String>,
    #[serde(default)]
    pub disabled: BTreeSet<String>,
    #[serde(default)]
    pub severities: BTreeMap<String, Severity>,
}

impl Checkers {
    /// Metadata of a batch that ran every checker.
    pub fn all_enabled() -> Self {
        Self::default()
    }

    pub fn classify(&self, checker: &str) -> Enablement {
        if self.disabled.contains(checker) {
            Enablement::Disabled
        } else if self.enabled.is_empty() || self.enabled.contains(checker) {
            Enablement::Enabled
        } else {
            Enablement::Unknown
        }
    }

    pub fn severity(&self, checker: &str) -> Severity {
        self.severities.get(checker).copied().unwrap_or_default()
    }
}

/// A validated batch ready to be hashed and stored.
#[derive(Debug, Clone)]
pub struct Batch {
    pub analyzed_files: FileScope,
    pub checkers: Checkers,
    pub analyzer_commands: Vec<String>,
    pub reports: Vec<Diagnostic>,
}

impl Batch {
    /// Parses and validates a JSON batch document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Json` for malformed JSON and `Error::InvalidBatch` when a
    /// report lacks a checker name or points at line/column zero.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawBatch = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawBatch) -> Result<Self> {
        let mut files = FileInterner::default();
        let reports = raw
            .reports
            .into_iter()
            .enumerate()
            .map(|(index, report)| files.diagnostic(index, report))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            analyzed_files: raw.analyzed_files.into_iter().collect(),
            checkers: raw.checkers,
            analyzer_commands: raw.analyzer_commands,
            reports,
        })
    }
}

/// Hands out one shared `File` per distinct path.
#[derive(Default)]
struct FileInterner {
    files: HashMap<String, Arc<File>>,
}

impl FileInterner {
    fn file(&mut self, path: String) -> Arc<File> {
        self.files
            .entry(path)
            .or_insert_with_key(|path| Arc::new(File::new(path.clone())))
            .clone()
    }

    fn location(&mut self, raw: RawLocation) -> Location {
        Location {
            file: self.file(raw.file),
            line: raw.line,
            col: raw.col,
            end_line: raw.end_line,
            end_col: raw.end_col,
        }
    }

    fn diagnostic(&mut self, index: usize, raw: RawDiagnostic) -> Result<Diagnostic> {
        if raw.checker_name.trim().is_empty() {
            return Err(Error::InvalidBatch(format!(
                "report #{index} has no checker name"
            )));
        }
        if raw.location.line == 0 || raw.location.col == 0 {
            return Err(Error::InvalidBatch(format!(
                "report #{index} points at line {} column {}; both are 1-based",
                raw.location.line, raw.location.col
            )));
        }

        let bug_path = raw
            .bug_path
            .into_iter()
            .map(|element| match element {
                RawPathElement::Event { location, message } => PathElement::Event {
                    location: self.location(location),
                    message,
                },
                RawPathElement::Control { edges } => PathElement::Control { edges },
                RawPathElement::Note { location, message } => PathElement::Note {
                    location: self.location(location),
                    message,
                },
                RawPathElement::MacroExpansion {
                    location,
                    name,
                    expansion,
                } => PathElement::MacroExpansion {
                    location: self.location(location),
                    name,
                    expansion,
                },
            })
            .collect();

        Ok(Diagnostic {
            location: self.location(raw.location),
            checker_name: raw.checker_name,
            analyzer_name: raw.analyzer_name,
            message: raw.message,
            bug_path,
            report_hash: raw.report_hash,
        })
    }
}

/// A diagnostic with both identity hashes computed.
#[derive(Debug, Clone)]
pub struct HashedReport {
    pub diagnostic: Diagnostic,
    pub report_hash: String,
    pub path_hash: String,
    /// Empty unless the report hash was computed from partial content.
    pub degraded: Vec<DegradedReason>,
}

impl HashedReport {
    pub fn file_path(&self) -> &str {
        self.diagnostic.location.file.path()
    }
}

/// Counters for one store operation.
///
/// Passed by `&mut` through the collection and reconciliation passes instead
/// of living in process-wide state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub received: usize,
    pub out_of_scope: usize,
    /// Same report hash and same path hash: one header seen from several TUs.
    pub duplicates: usize,
    /// Same report hash reached over a different path; folded into one finding.
    pub collapsed_paths: usize,
    pub degraded: usize,
    pub transitions: BTreeMap<DetectionStatus, usize>,
}

impl StoreStats {
    pub fn record_transition(&mut self, status: DetectionStatus) {
        *self.transitions.entry(status).or_default() += 1;
    }

    pub fn count(&self, status: DetectionStatus) -> usize {
        self.transitions.get(&status).copied().unwrap_or(0)
    }
}

/// Filters hashed reports down to the findings a batch actually stores.
///
/// Reports outside `scope` are dropped. Of several reports sharing a report
/// hash only the first survives; later ones are counted as exact duplicates
/// when their path hash was already seen, and as collapsed paths otherwise.
/// Input order is preserved.
pub fn collect(
    hashed: Vec<HashedReport>,
    scope: &FileScope,
    stats: &mut StoreStats,
) -> Vec<HashedReport> {
    let mut seen: HashMap<String, HashSet<String>> = HashMap::new();
    let mut findings = Vec::with_capacity(hashed.len());

    for report in hashed {
        stats.received += 1;
        if !report.degraded.is_empty() {
            stats.degraded += 1;
        }

        if !scope.contains(report.file_path()) {
            stats.out_of_scope += 1;
            debug!(
                file = report.file_path(),
                hash = %report.report_hash,
                "report outside the analysed files, skipped"
            );
            continue;
        }

        match seen.get_mut(&report.report_hash) {
            Some(paths) => {
                if paths.insert(report.path_hash.clone()) {
                    stats.collapsed_paths += 1;
                } else {
                    stats.duplicates += 1;
                }
            }
            None => {
                seen.insert(
                    report.report_hash.clone(),
                    HashSet::from([report.path_hash.clone()]),
                );
                findings.push(report);
            }
        }
    }

    findings
}
