//! Tests for the detection-status rules and batch collection.
//!
//! Everything here is pure: no database, no source files.

use std::collections::BTreeMap;
use std::sync::Arc;

use bugtrail_core::batch::{collect, Checkers, Enablement, FileScope, HashedReport, StoreStats};
use bugtrail_core::reconcile::{reconcile, PreviousFinding};
use bugtrail_core::types::{Diagnostic, File, Location};
use bugtrail_core::DetectionStatus;

const NOW: i64 = 2_000;

fn report(hash: &str, path_hash: &str, file: &str, checker: &str) -> HashedReport {
    HashedReport {
        diagnostic: Diagnostic {
            location: Location {
                file: Arc::new(File::new(file)),
                line: 1,
                col: 1,
                end_line: None,
                end_col: None,
            },
            checker_name: checker.to_owned(),
            analyzer_name: "clangsa".to_owned(),
            message: "m".to_owned(),
            bug_path: vec![],
            report_hash: Some(hash.to_owned()),
        },
        report_hash: hash.to_owned(),
        path_hash: path_hash.to_owned(),
        degraded: vec![],
    }
}

fn prev(
    hash: &str,
    status: DetectionStatus,
    file: &str,
    checker: &str,
) -> (String, PreviousFinding) {
    (
        hash.to_owned(),
        PreviousFinding {
            bug_hash: hash.to_owned(),
            status,
            checker_name: checker.to_owned(),
            file_path: file.to_owned(),
            detected_at: 1_000,
            fixed_at: (status == DetectionStatus::Resolved).then_some(1_500),
        },
    )
}

fn scope(files: &[&str]) -> FileScope {
    files.iter().copied().collect()
}

fn checkers(enabled: &[&str], disabled: &[&str]) -> Checkers {
    Checkers {
        enabled: enabled.iter().map(|s| s.to_string()).collect(),
        disabled: disabled.iter().map(|s| s.to_string()).collect(),
        ..Checkers::default()
    }
}

fn statuses(
    previous: &BTreeMap<String, PreviousFinding>,
    found: &[HashedReport],
    scope: &FileScope,
    checkers: &Checkers,
) -> BTreeMap<String, (Option<DetectionStatus>, DetectionStatus)> {
    reconcile(previous, found, scope, checkers, NOW)
        .into_iter()
        .map(|t| (t.bug_hash, (t.old_status, t.new_status)))
        .collect()
}

#[test]
fn first_store_marks_everything_new() {
    let found = vec![report("h1", "p1", "a.c", "c1"), report("h2", "p2", "b.c", "c1")];
    let transitions = reconcile(
        &BTreeMap::new(),
        &found,
        &scope(&["a.c", "b.c"]),
        &Checkers::all_enabled(),
        NOW,
    );

    assert_eq!(transitions.len(), 2);
    for t in &transitions {
        assert!(t.is_insert());
        assert_eq!(t.new_status, DetectionStatus::New);
        assert_eq!(t.detected_at, NOW);
        assert_eq!(t.fixed_at, None);
        assert!(t.seen);
    }
}

#[test]
fn seen_again_is_unresolved_and_keeps_detection_time() {
    let previous: BTreeMap<_, _> = [
        prev("h1", DetectionStatus::New, "a.c", "c1"),
        prev("h2", DetectionStatus::Reopened, "a.c", "c1"),
        prev("h3", DetectionStatus::Off, "a.c", "c1"),
        prev("h4", DetectionStatus::Unavailable, "a.c", "c1"),
    ]
    .into();
    let found = vec![
        report("h1", "p", "a.c", "c1"),
        report("h2", "p", "a.c", "c1"),
        report("h3", "p", "a.c", "c1"),
        report("h4", "p", "a.c", "c1"),
    ];

    let all = Checkers::all_enabled();
    let transitions = reconcile(&previous, &found, &scope(&["a.c"]), &all, NOW);
    assert_eq!(transitions.len(), 4);
    for t in &transitions {
        assert_eq!(t.new_status, DetectionStatus::Unresolved, "{}", t.bug_hash);
        assert_eq!(t.detected_at, 1_000);
    }
}

#[test]
fn resolved_then_found_reopens_and_clears_fix_time() {
    let previous: BTreeMap<_, _> = [prev("h1", DetectionStatus::Resolved, "a.c", "c1")].into();
    let found = vec![report("h1", "p", "a.c", "c1")];

    let transitions = reconcile(&previous, &found, &scope(&["a.c"]), &Checkers::all_enabled(), NOW);
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].old_status, Some(DetectionStatus::Resolved));
    assert_eq!(transitions[0].new_status, DetectionStatus::Reopened);
    assert_eq!(transitions[0].fixed_at, None);
}

#[test]
fn unseen_in_scope_depends_on_checker_state() {
    let previous: BTreeMap<_, _> = [
        prev("enabled", DetectionStatus::Unresolved, "a.c", "on"),
        prev("disabled", DetectionStatus::New, "a.c", "off"),
        prev("unknown", DetectionStatus::Reopened, "a.c", "gone"),
        prev("was-off", DetectionStatus::Off, "a.c", "on"),
        prev("was-unavailable", DetectionStatus::Unavailable, "a.c", "off"),
        prev("already-resolved", DetectionStatus::Resolved, "a.c", "on"),
    ]
    .into();
    let got = statuses(&previous, &[], &scope(&["a.c"]), &checkers(&["on"], &["off"]));

    use DetectionStatus::*;
    assert_eq!(got["enabled"], (Some(Unresolved), Resolved));
    assert_eq!(got["disabled"], (Some(New), Off));
    assert_eq!(got["unknown"], (Some(Reopened), Unavailable));
    assert_eq!(got["was-off"], (Some(Off), Resolved));
    assert_eq!(got["was-unavailable"], (Some(Unavailable), Off));
    assert!(!got.contains_key("already-resolved"));
}

#[test]
fn resolution_records_fix_time() {
    let previous: BTreeMap<_, _> = [prev("h1", DetectionStatus::Unresolved, "a.c", "c1")].into();
    let transitions = reconcile(&previous, &[], &scope(&["a.c"]), &Checkers::all_enabled(), NOW);

    assert_eq!(transitions[0].new_status, DetectionStatus::Resolved);
    assert_eq!(transitions[0].fixed_at, Some(NOW));
    assert_eq!(transitions[0].detected_at, 1_000);
    assert!(!transitions[0].seen);
}

#[test]
fn findings_outside_scope_are_untouched() {
    let previous: BTreeMap<_, _> = [
        prev("in", DetectionStatus::Unresolved, "a.c", "c1"),
        prev("out", DetectionStatus::Unresolved, "b.c", "c1"),
    ]
    .into();
    let got = statuses(&previous, &[], &scope(&["a.c"]), &Checkers::all_enabled());

    assert_eq!(got.len(), 1);
    assert_eq!(got["in"].1, DetectionStatus::Resolved);
}

#[test]
fn found_reports_outside_scope_are_ignored() {
    let found = vec![report("h1", "p", "header.h", "c1")];
    let transitions = reconcile(
        &BTreeMap::new(),
        &found,
        &scope(&["a.c"]),
        &Checkers::all_enabled(),
        NOW,
    );
    assert!(transitions.is_empty());
}

#[test]
fn found_hash_stored_in_another_file_outside_scope_is_untouched() {
    // The same snippet exists in two libraries; only lib2 was re-analysed.
    let previous: BTreeMap<_, _> =
        [prev("shared", DetectionStatus::Resolved, "lib1/util.c", "c1")].into();
    let found = vec![report("shared", "p", "lib2/util.c", "c1")];

    let got = statuses(&previous, &found, &scope(&["lib2/util.c"]), &Checkers::all_enabled());
    assert!(got.is_empty());
}

#[test]
fn disabled_list_alone_leaves_other_checkers_enabled() {
    let previous: BTreeMap<_, _> = [
        prev("a", DetectionStatus::Unresolved, "a.c", "A"),
        prev("b", DetectionStatus::New, "a.c", "B"),
    ]
    .into();
    let got = statuses(&previous, &[], &scope(&["a.c"]), &checkers(&[], &["B"]));

    assert_eq!(got["a"], (Some(DetectionStatus::Unresolved), DetectionStatus::Resolved));
    assert_eq!(got["b"], (Some(DetectionStatus::New), DetectionStatus::Off));
}

#[test]
fn checker_seen_in_batch_counts_as_enabled() {
    let previous: BTreeMap<_, _> = [prev("old", DetectionStatus::New, "a.c", "c1")].into();
    let found = vec![report("fresh", "p", "a.c", "c1")];
    // c1 is missing from both lists but evidently ran.
    let got = statuses(&previous, &found, &scope(&["a.c"]), &checkers(&["other"], &[]));

    assert_eq!(got["old"].1, DetectionStatus::Resolved);
    assert_eq!(got["fresh"].1, DetectionStatus::New);
}

#[test]
fn reconcile_is_ordered_by_hash() {
    let found = vec![
        report("c", "p", "a.c", "k"),
        report("a", "p", "a.c", "k"),
        report("b", "p", "a.c", "k"),
    ];
    let hashes: Vec<_> = reconcile(
        &BTreeMap::new(),
        &found,
        &scope(&["a.c"]),
        &Checkers::all_enabled(),
        NOW,
    )
    .into_iter()
    .map(|t| t.bug_hash)
    .collect();
    assert_eq!(hashes, ["a", "b", "c"]);
}

#[test]
fn classify_prefers_disabled() {
    let c = checkers(&["both", "on"], &["both"]);
    assert_eq!(c.classify("both"), Enablement::Disabled);
    assert_eq!(c.classify("on"), Enablement::Enabled);
    assert_eq!(c.classify("neither"), Enablement::Unknown);
    assert_eq!(Checkers::all_enabled().classify("anything"), Enablement::Enabled);

    let only_disabled = checkers(&[], &["off"]);
    assert_eq!(only_disabled.classify("off"), Enablement::Disabled);
    assert_eq!(only_disabled.classify("anything"), Enablement::Enabled);
}

#[test]
fn collect_drops_out_of_scope_and_folds_duplicates() {
    let hashed = vec![
        report("h1", "p1", "a.c", "c1"),
        report("h1", "p1", "a.c", "c1"),
        report("h1", "p2", "a.c", "c1"),
        report("h2", "p1", "lib.h", "c1"),
        report("h3", "p3", "a.c", "c1"),
    ];
    let mut stats = StoreStats::default();
    let findings = collect(hashed, &scope(&["a.c"]), &mut stats);

    let hashes: Vec<_> = findings.iter().map(|f| f.report_hash.as_str()).collect();
    assert_eq!(hashes, ["h1", "h3"]);
    assert_eq!(findings[0].path_hash, "p1");
    assert_eq!(stats.received, 5);
    assert_eq!(stats.out_of_scope, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.collapsed_paths, 1);
    assert_eq!(stats.degraded, 0);
}
