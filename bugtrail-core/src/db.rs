use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tokio_rusqlite::Connection;
use tracing::debug;

use crate::batch::{Checkers, FileScope, HashedReport};
use crate::error::{Error, Result};
use crate::reconcile::{reconcile, PreviousFinding, Transition};
use crate::types::{DetectionRecord, DetectionStatus, Run, RunHistory, Severity};

impl ToSql for DetectionStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DetectionStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: Error| FromSqlError::Other(e.to_string().into()))
    }
}

impl ToSql for Severity {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Severity {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: Error| FromSqlError::Other(e.to_string().into()))
    }
}

/// Opens (or creates) the SQLite database at `path`, configures WAL mode,
/// and applies schema migrations via the `schema_version` table.
///
/// This function is the single entry point for all database connections.
/// It sets `busy_timeout` via the `Connection` method (not a PRAGMA string) so
/// a second process storing into the same file waits for the first one's
/// write transaction instead of failing immediately.
///
/// # Errors
///
/// Returns an error if the file cannot be opened, WAL configuration fails, or
/// schema DDL fails.
pub async fn open_db(path: &str) -> Result<Connection> {
    let conn = Connection::open(path).await?;

    conn.call(|db| -> rusqlite::Result<()> {
        db.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;
        db.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    })
    .await?;

    conn.call(|db| -> rusqlite::Result<()> { crate::schema::migrate(db) })
        .await?;

    Ok(conn)
}

/// Returns the current Unix timestamp in seconds.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn run_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: r.get(0)?,
        name: r.get(1)?,
        created_at: r.get(2)?,
        updated_at: r.get(3)?,
    })
}

fn select_run(db: &rusqlite::Connection, name: &str) -> rusqlite::Result<Option<Run>> {
    db.query_row(
        "SELECT id, name, created_at, updated_at FROM runs WHERE name = ?1",
        params![name],
        run_from_row,
    )
    .optional()
}

/// Finds the run called `name` or creates it; bumps `updated_at` either way.
fn upsert_run(db: &rusqlite::Connection, name: &str, now: i64) -> rusqlite::Result<Run> {
    if let Some(mut run) = select_run(db, name)? {
        db.execute(
            "UPDATE runs SET updated_at = ?1 WHERE id = ?2",
            params![now, &run.id],
        )?;
        run.updated_at = now;
        return Ok(run);
    }

    let id = uuid::Uuid::new_v4().to_string();
    db.execute(
        "INSERT INTO runs (id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
        params![&id, name, now],
    )?;
    Ok(Run {
        id,
        name: name.to_owned(),
        created_at: now,
        updated_at: now,
    })
}

/// Looks up a run by name without creating it.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn find_run(conn: &Connection, name: &str) -> Result<Option<Run>> {
    let name = name.to_owned();
    Ok(conn
        .call(move |db| -> rusqlite::Result<Option<Run>> { select_run(db, &name) })
        .await?)
}

/// Finds the run called `name`, or creates it inside `BEGIN IMMEDIATE`.
///
/// # Errors
///
/// Returns an error if the query or write transaction fails.
pub async fn get_or_create_run(conn: &Connection, name: &str) -> Result<Run> {
    let name = name.to_owned();
    Ok(conn
        .call(move |db| -> rusqlite::Result<Run> {
            let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let run = upsert_run(&tx, &name, now_secs())?;
            tx.commit()?;
            Ok(run)
        })
        .await?)
}

fn select_previous(
    db: &rusqlite::Connection,
    run_id: &str,
) -> rusqlite::Result<BTreeMap<String, PreviousFinding>> {
    let mut stmt = db.prepare(
        "SELECT bug_hash, detection_status, checker_name, file_path, detected_at, fixed_at
         FROM reports WHERE run_id = ?1",
    )?;
    let rows = stmt
        .query_map(params![run_id], |r| {
            Ok(PreviousFinding {
                bug_hash: r.get(0)?,
                status: r.get(1)?,
                checker_name: r.get(2)?,
                file_path: r.get(3)?,
                detected_at: r.get(4)?,
                fixed_at: r.get(5)?,
            })
        })?
        .map(|row| row.map(|p| (p.bug_hash.clone(), p)))
        .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
    Ok(rows)
}

/// Loads the stored state of every hash in `run_id`, whatever its status.
///
/// # Errors
///
/// Returns an error if the query fails or a row holds an unknown status.
pub async fn load_previous_findings(
    conn: &Connection,
    run_id: &str,
) -> Result<BTreeMap<String, PreviousFinding>> {
    let run_id = run_id.to_owned();
    Ok(conn
        .call(move |db| -> rusqlite::Result<_> { select_previous(db, &run_id) })
        .await?)
}

/// Returns `bug_hash -> status` for the live findings of `run_id` whose file
/// lies inside `scope`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn get_live_findings(
    conn: &Connection,
    run_id: &str,
    scope: &FileScope,
) -> Result<BTreeMap<String, DetectionStatus>> {
    let previous = load_previous_findings(conn, run_id).await?;
    Ok(previous
        .into_values()
        .filter(|p| p.status.is_live() && scope.contains(&p.file_path))
        .map(|p| (p.bug_hash, p.status))
        .collect())
}

/// Metadata of the storage event a set of transitions belongs to.
#[derive(Debug, Clone)]
pub struct NewRunHistory {
    pub time: i64,
    pub analyzer_commands: Vec<String>,
    pub version_tag: Option<String>,
}

fn insert_history(
    db: &rusqlite::Connection,
    run_id: &str,
    time: i64,
    commands_json: &str,
    version_tag: Option<&str>,
) -> rusqlite::Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    db.execute(
        "INSERT INTO run_history (id, run_id, time, analyzer_commands, version_tag)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![&id, run_id, time, commands_json, version_tag],
    )?;
    Ok(id)
}

fn insert_report(
    db: &rusqlite::Connection,
    run_id: &str,
    history_id: &str,
    transition: &Transition,
    finding: &HashedReport,
    checkers: &Checkers,
) -> rusqlite::Result<String> {
    let diag = &finding.diagnostic;
    let id = uuid::Uuid::new_v4().to_string();
    db.execute(
        "INSERT INTO reports (id, run_id, bug_hash, path_hash, file_path, line, col,
                              checker_name, analyzer_name, message, severity,
                              detection_status, detected_at, fixed_at,
                              first_seen_history, last_seen_history)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
        params![
            &id,
            run_id,
            &transition.bug_hash,
            &finding.path_hash,
            diag.location.file.path(),
            diag.location.line,
            diag.location.col,
            &diag.checker_name,
            &diag.analyzer_name,
            &diag.message,
            checkers.severity(&diag.checker_name),
            transition.new_status,
            transition.detected_at,
            transition.fixed_at,
            history_id,
        ],
    )?;
    Ok(id)
}

/// Updates a finding the batch observed again: status plus its latest location.
fn refresh_report(
    db: &rusqlite::Connection,
    run_id: &str,
    history_id: &str,
    transition: &Transition,
    finding: &HashedReport,
    checkers: &Checkers,
) -> rusqlite::Result<String> {
    let diag = &finding.diagnostic;
    db.query_row(
        "UPDATE reports
         SET detection_status = ?1, detected_at = ?2, fixed_at = ?3,
             path_hash = ?4, file_path = ?5, line = ?6, col = ?7,
             analyzer_name = ?8, message = ?9, severity = ?10,
             last_seen_history = ?11
         WHERE run_id = ?12 AND bug_hash = ?13
         RETURNING id",
        params![
            transition.new_status,
            transition.detected_at,
            transition.fixed_at,
            &finding.path_hash,
            diag.location.file.path(),
            diag.location.line,
            diag.location.col,
            &diag.analyzer_name,
            &diag.message,
            checkers.severity(&diag.checker_name),
            history_id,
            run_id,
            &transition.bug_hash,
        ],
        |r| r.get(0),
    )
}

fn update_status(
    db: &rusqlite::Connection,
    run_id: &str,
    transition: &Transition,
) -> rusqlite::Result<String> {
    db.query_row(
        "UPDATE reports SET detection_status = ?1, fixed_at = ?2
         WHERE run_id = ?3 AND bug_hash = ?4
         RETURNING id",
        params![
            transition.new_status,
            transition.fixed_at,
            run_id,
            &transition.bug_hash,
        ],
        |r| r.get(0),
    )
}

/// Writes exactly one report mutation and one detection event per transition.
fn apply_transitions(
    db: &rusqlite::Connection,
    run_id: &str,
    history_id: &str,
    transitions: &[Transition],
    findings: &[HashedReport],
    checkers: &Checkers,
) -> rusqlite::Result<()> {
    let by_hash: HashMap<&str, &HashedReport> = findings
        .iter()
        .map(|f| (f.report_hash.as_str(), f))
        .collect();

    for transition in transitions {
        let finding = by_hash.get(transition.bug_hash.as_str()).copied();
        let report_id = match (transition.old_status, finding) {
            (None, Some(finding)) => {
                insert_report(db, run_id, history_id, transition, finding, checkers)?
            }
            (None, None) => {
                return Err(rusqlite::Error::ToSqlConversionFailure(
                    format!("no report to insert for new hash {}", transition.bug_hash).into(),
                ))
            }
            (Some(_), Some(finding)) if transition.seen => {
                refresh_report(db, run_id, history_id, transition, finding, checkers)?
            }
            (Some(_), _) => update_status(db, run_id, transition)?,
        };

        db.execute(
            "INSERT INTO detection_events (history_id, report_id, old_status, new_status)
             VALUES (?1, ?2, ?3, ?4)",
            params![history_id, &report_id, transition.old_status, transition.new_status],
        )?;
        debug!(
            hash = %transition.bug_hash,
            from = ?transition.old_status,
            to = %transition.new_status,
            "detection status transition"
        );
    }
    Ok(())
}

/// Persists precomputed transitions for `run_id` as one storage event.
///
/// `findings` must contain every report a `seen` transition refers to. The
/// run-history row, report rows, and detection events are written inside one
/// `BEGIN IMMEDIATE` transaction: either all of them land or none does.
///
/// Returns the id of the new run-history entry.
///
/// # Errors
///
/// Returns an error if any write fails; nothing is committed in that case.
pub async fn commit_detection_transitions(
    conn: &Connection,
    run_id: &str,
    history: NewRunHistory,
    transitions: Vec<Transition>,
    findings: Vec<HashedReport>,
    checkers: Checkers,
) -> Result<String> {
    let run_id = run_id.to_owned();
    let commands_json = serde_json::to_string(&history.analyzer_commands)?;

    Ok(conn
        .call(move |db| -> rusqlite::Result<String> {
            let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let history_id = insert_history(
                &tx,
                &run_id,
                history.time,
                &commands_json,
                history.version_tag.as_deref(),
            )?;
            apply_transitions(&tx, &run_id, &history_id, &transitions, &findings, &checkers)?;
            tx.execute(
                "UPDATE runs SET updated_at = ?1 WHERE id = ?2",
                params![history.time, &run_id],
            )?;
            tx.commit()?;
            Ok(history_id)
        })
        .await?)
}

/// Everything the store pipeline hands to [`commit_batch`].
pub(crate) struct CommitPlan {
    pub run_name: String,
    pub findings: Vec<HashedReport>,
    pub scope: FileScope,
    pub checkers: Checkers,
    pub history: NewRunHistory,
}

pub(crate) struct CommitOutcome {
    pub run: Run,
    pub history_id: String,
    pub transitions: Vec<Transition>,
}

/// Reads the previous state, reconciles, and writes the result in a single
/// `BEGIN IMMEDIATE` transaction.
///
/// Holding the write lock from the snapshot read to the commit means no other
/// writer can change the run's findings in between. `cancel` is checked just
/// before committing; when set, the transaction is rolled back.
pub(crate) async fn commit_batch(
    conn: &Connection,
    plan: CommitPlan,
    cancel: Arc<AtomicBool>,
) -> Result<CommitOutcome> {
    let commands_json = serde_json::to_string(&plan.history.analyzer_commands)?;

    let outcome = conn
        .call(move |db| -> rusqlite::Result<Option<CommitOutcome>> {
            let now = plan.history.time;
            let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let run = upsert_run(&tx, &plan.run_name, now)?;
            let previous = select_previous(&tx, &run.id)?;
            let transitions =
                reconcile(&previous, &plan.findings, &plan.scope, &plan.checkers, now);

            let history_id = insert_history(
                &tx,
                &run.id,
                now,
                &commands_json,
                plan.history.version_tag.as_deref(),
            )?;
            apply_transitions(
                &tx,
                &run.id,
                &history_id,
                &transitions,
                &plan.findings,
                &plan.checkers,
            )?;

            if cancel.load(Ordering::SeqCst) {
                // Dropping `tx` rolls everything back.
                return Ok(None);
            }
            tx.commit()?;

            Ok(Some(CommitOutcome {
                run,
                history_id,
                transitions,
            }))
        })
        .await?;

    outcome.ok_or(Error::Cancelled)
}

/// Loads every detection record of `run_id`, ordered by file and line.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn load_records(conn: &Connection, run_id: &str) -> Result<Vec<DetectionRecord>> {
    let run_id = run_id.to_owned();

    Ok(conn
        .call(move |db| -> rusqlite::Result<Vec<DetectionRecord>> {
            let mut stmt = db.prepare(
                "SELECT id, run_id, bug_hash, path_hash, file_path, line, col,
                        checker_name, analyzer_name, message, severity,
                        detection_status, detected_at, fixed_at,
                        first_seen_history, last_seen_history
                 FROM reports WHERE run_id = ?1
                 ORDER BY file_path, line, col, bug_hash",
            )?;
            let rows = stmt
                .query_map(params![&run_id], |r| {
                    Ok(DetectionRecord {
                        id: r.get(0)?,
                        run_id: r.get(1)?,
                        bug_hash: r.get(2)?,
                        path_hash: r.get(3)?,
                        file_path: r.get(4)?,
                        line: r.get(5)?,
                        col: r.get(6)?,
                        checker_name: r.get(7)?,
                        analyzer_name: r.get(8)?,
                        message: r.get(9)?,
                        severity: r.get(10)?,
                        detection_status: r.get(11)?,
                        detected_at: r.get(12)?,
                        fixed_at: r.get(13)?,
                        first_seen_history: r.get(14)?,
                        last_seen_history: r.get(15)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await?)
}

/// Counts the findings of `run_id` per detection status.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn status_counts(
    conn: &Connection,
    run_id: &str,
) -> Result<BTreeMap<DetectionStatus, usize>> {
    let run_id = run_id.to_owned();

    Ok(conn
        .call(move |db| -> rusqlite::Result<BTreeMap<DetectionStatus, usize>> {
            let mut stmt = db.prepare(
                "SELECT detection_status, COUNT(*) FROM reports
                 WHERE run_id = ?1 GROUP BY detection_status",
            )?;
            let counts = stmt
                .query_map(params![&run_id], |r| {
                    let status: DetectionStatus = r.get(0)?;
                    let count: i64 = r.get(1)?;
                    Ok((status, count as usize))
                })?
                .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
            Ok(counts)
        })
        .await?)
}

/// Lists the storage events of `run_id`, oldest first.
///
/// # Errors
///
/// Returns an error if the query fails or a stored command list is not JSON.
pub async fn list_run_history(conn: &Connection, run_id: &str) -> Result<Vec<RunHistory>> {
    let run_id = run_id.to_owned();

    Ok(conn
        .call(move |db| -> rusqlite::Result<Vec<RunHistory>> {
            let mut stmt = db.prepare(
                "SELECT id, run_id, time, analyzer_commands, version_tag
                 FROM run_history WHERE run_id = ?1
                 ORDER BY time, rowid",
            )?;
            let rows = stmt
                .query_map(params![&run_id], |r| {
                    let commands: String = r.get(3)?;
                    let analyzer_commands = serde_json::from_str(&commands).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
                    })?;
                    Ok(RunHistory {
                        id: r.get(0)?,
                        run_id: r.get(1)?,
                        time: r.get(2)?,
                        analyzer_commands,
                        version_tag: r.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Diagnostic, File, Location};
    use tempfile::TempDir;

    fn hashed(hash: &str, file: &str) -> HashedReport {
        HashedReport {
            diagnostic: Diagnostic {
                location: Location {
                    file: Arc::new(File::new(file)),
                    line: 3,
                    col: 5,
                    end_line: None,
                    end_col: None,
                },
                checker_name: "core.DivideZero".to_owned(),
                analyzer_name: "clangsa".to_owned(),
                message: format!("finding {hash}"),
                bug_path: vec![],
                report_hash: Some(hash.to_owned()),
            },
            report_hash: hash.to_owned(),
            path_hash: format!("path-{hash}"),
            degraded: vec![],
        }
    }

    fn plan(findings: Vec<HashedReport>, time: i64) -> CommitPlan {
        CommitPlan {
            run_name: "nightly".to_owned(),
            findings,
            scope: ["a.c"].into_iter().collect(),
            checkers: Checkers::all_enabled(),
            history: NewRunHistory {
                time,
                analyzer_commands: vec!["clang --analyze".to_owned()],
                version_tag: None,
            },
        }
    }

    #[tokio::test]
    async fn test_cancel_after_hashing_rolls_back_commit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.db");
        let conn = open_db(path.to_str().unwrap()).await.unwrap();

        let not_cancelled = Arc::new(AtomicBool::new(false));
        let first = commit_batch(&conn, plan(vec![hashed("h1", "a.c")], 100), not_cancelled)
            .await
            .unwrap();

        // The flag is raised once hashing is over, so every write of this
        // batch has already happened when it is observed.
        let cancelled = Arc::new(AtomicBool::new(true));
        let second = plan(vec![hashed("h2", "a.c")], 200);
        let result = commit_batch(&conn, second, cancelled).await;
        assert!(matches!(result, Err(Error::Cancelled)));

        let history = list_run_history(&conn, &first.run.id).await.unwrap();
        assert_eq!(history.len(), 1);
        let previous = load_previous_findings(&conn, &first.run.id).await.unwrap();
        assert_eq!(previous.len(), 1);
        assert_eq!(previous["h1"].status, DetectionStatus::New);
        assert_eq!(previous["h1"].fixed_at, None);
    }
}
