//! Detection-status reconciliation.
//!
//! Given the persisted state of every `bug_hash` in a Run and the findings of
//! a new batch, [`reconcile`] decides each hash's next status. It is a pure
//! function: the storage layer reads `previous` and applies the returned
//! transitions inside one transaction, so a failure anywhere leaves the Run
//! exactly as it was.
//!
//! Rules, for hashes whose file is inside the batch scope:
//!
//! | previous          | found | checker            | next        |
//! |-------------------|-------|--------------------|-------------|
//! | none              | yes   |                    | new         |
//! | new/unresolved/reopened | yes |              | unresolved  |
//! | resolved          | yes   |                    | reopened    |
//! | off/unavailable   | yes   |                    | unresolved  |
//! | live              | no    | enabled            | resolved    |
//! | live              | no    | disabled           | off         |
//! | live              | no    | unknown            | unavailable |
//! | off/unavailable   | no    | enabled            | resolved    |
//! | unavailable       | no    | disabled           | off         |
//!
//! Anything else is left untouched, as is every hash outside the scope. A
//! hash is outside the scope when its stored row points into a file the batch
//! did not analyse, even if the batch found the same hash in another file.

use std::collections::{BTreeMap, BTreeSet};

use crate::batch::{Checkers, Enablement, FileScope, HashedReport};
use crate::types::DetectionStatus;

/// What the storage layer knows about a hash before the batch is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousFinding {
    pub bug_hash: String,
    pub status: DetectionStatus,
    pub checker_name: String,
    pub file_path: String,
    pub detected_at: i64,
    pub fixed_at: Option<i64>,
}

/// One status change to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub bug_hash: String,
    /// `None` when the hash has never been stored in this Run.
    pub old_status: Option<DetectionStatus>,
    pub new_status: DetectionStatus,
    pub detected_at: i64,
    pub fixed_at: Option<i64>,
    /// True when the batch observed the finding; its report row is refreshed.
    pub seen: bool,
}

impl Transition {
    pub fn is_insert(&self) -> bool {
        self.old_status.is_none()
    }
}

/// Computes the transitions one batch causes, ordered by `bug_hash`.
///
/// `found` may contain reports outside `scope`; they are ignored, and so is a
/// found hash whose stored finding lives outside `scope`. Each hash in
/// `found` is expected once (see [`crate::batch::collect`]); later repeats are
/// ignored.
pub fn reconcile(
    previous: &BTreeMap<String, PreviousFinding>,
    found: &[HashedReport],
    scope: &FileScope,
    checkers: &Checkers,
    now: i64,
) -> Vec<Transition> {
    let mut found_in_scope: BTreeMap<&str, &HashedReport> = BTreeMap::new();
    for report in found.iter().filter(|r| scope.contains(r.file_path())) {
        found_in_scope
            .entry(report.report_hash.as_str())
            .or_insert(report);
    }

    // A checker that produced a report in this batch evidently ran.
    let observed: BTreeSet<&str> = found_in_scope
        .values()
        .map(|r| r.diagnostic.checker_name.as_str())
        .collect();

    let mut transitions = Vec::new();

    for &bug_hash in found_in_scope.keys() {
        let stored = previous.get(bug_hash);
        if stored.is_some_and(|prev| !scope.contains(&prev.file_path)) {
            continue;
        }
        let transition = match stored {
            None => Transition {
                bug_hash: bug_hash.to_owned(),
                old_status: None,
                new_status: DetectionStatus::New,
                detected_at: now,
                fixed_at: None,
                seen: true,
            },
            Some(prev) => {
                let new_status = match prev.status {
                    DetectionStatus::Resolved => DetectionStatus::Reopened,
                    _ => DetectionStatus::Unresolved,
                };
                Transition {
                    bug_hash: bug_hash.to_owned(),
                    old_status: Some(prev.status),
                    new_status,
                    detected_at: prev.detected_at,
                    fixed_at: None,
                    seen: true,
                }
            }
        };
        transitions.push(transition);
    }

    for prev in previous.values() {
        if found_in_scope.contains_key(prev.bug_hash.as_str()) || !scope.contains(&prev.file_path)
        {
            continue;
        }

        let enablement = match checkers.classify(&prev.checker_name) {
            Enablement::Unknown if observed.contains(prev.checker_name.as_str()) => {
                Enablement::Enabled
            }
            other => other,
        };

        let Some(new_status) = unseen_status(prev.status, enablement) else {
            continue;
        };
        let fixed_at = match new_status {
            DetectionStatus::Resolved => Some(now),
            _ => prev.fixed_at,
        };
        transitions.push(Transition {
            bug_hash: prev.bug_hash.clone(),
            old_status: Some(prev.status),
            new_status,
            detected_at: prev.detected_at,
            fixed_at,
            seen: false,
        });
    }

    transitions.sort_by(|a, b| a.bug_hash.cmp(&b.bug_hash));
    transitions
}

/// Next status of an in-scope finding the batch did not observe.
fn unseen_status(status: DetectionStatus, enablement: Enablement) -> Option<DetectionStatus> {
    use DetectionStatus::*;

    match (status, enablement) {
        (s, Enablement::Enabled) if s.is_live() => Some(Resolved),
        (s, Enablement::Disabled) if s.is_live() => Some(Off),
        (s, Enablement::Unknown) if s.is_live() => Some(Unavailable),
        (Off | Unavailable, Enablement::Enabled) => Some(Resolved),
        (Unavailable, Enablement::Disabled) => Some(Off),
        _ => None,
    }
}
