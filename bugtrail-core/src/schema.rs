/// DDL to create the schema_version tracking table.
///
/// Applied unconditionally on every DB open (before checking the version),
/// using `IF NOT EXISTS` so it is safe to run multiple times.
pub const SCHEMA_VERSION_DDL: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    ) STRICT;
";

/// DDL for the full v1 schema.
///
/// Contains four tables:
/// - `runs`: one row per named analysis target, keyed by UUID v4 text.
/// - `run_history`: one immutable row per storage event.
/// - `reports`: the current detection record of every `bug_hash` ever stored
///   in a run. `UNIQUE(run_id, bug_hash)` means a hash has exactly one row,
///   so a live finding can never be duplicated within a run.
/// - `detection_events`: every status transition, keyed by the storage event
///   that caused it.
///
/// All tables use `STRICT` mode for type enforcement.
pub const SCHEMA_V1_SQL: &str = "
    CREATE TABLE IF NOT EXISTS runs (
        id          TEXT    PRIMARY KEY,
        name        TEXT    NOT NULL UNIQUE,
        created_at  INTEGER NOT NULL,
        updated_at  INTEGER NOT NULL
    ) STRICT;

    CREATE TABLE IF NOT EXISTS run_history (
        id                TEXT    PRIMARY KEY,
        run_id            TEXT    NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
        time              INTEGER NOT NULL,
        analyzer_commands TEXT    NOT NULL DEFAULT '[]',
        version_tag       TEXT
    ) STRICT;

    CREATE TABLE IF NOT EXISTS reports (
        id                 TEXT    PRIMARY KEY,
        run_id             TEXT    NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
        bug_hash           TEXT    NOT NULL,
        path_hash          TEXT    NOT NULL,
        file_path          TEXT    NOT NULL,
        line               INTEGER NOT NULL,
        col                INTEGER NOT NULL,
        checker_name       TEXT    NOT NULL,
        analyzer_name      TEXT    NOT NULL DEFAULT '',
        message            TEXT    NOT NULL,
        severity           TEXT    NOT NULL
                                   CHECK(severity IN
                                         ('unspecified','style','low','medium','high','critical')),
        detection_status   TEXT    NOT NULL
                                   CHECK(detection_status IN
                                         ('new','unresolved','resolved','reopened',
                                          'off','unavailable')),
        detected_at        INTEGER NOT NULL,
        fixed_at           INTEGER,
        first_seen_history TEXT    NOT NULL REFERENCES run_history(id) ON DELETE CASCADE,
        last_seen_history  TEXT    NOT NULL REFERENCES run_history(id) ON DELETE CASCADE,
        UNIQUE (run_id, bug_hash)
    ) STRICT;

    CREATE INDEX IF NOT EXISTS idx_reports_run_file ON reports (run_id, file_path);

    CREATE TABLE IF NOT EXISTS detection_events (
        history_id  TEXT NOT NULL REFERENCES run_history(id) ON DELETE CASCADE,
        report_id   TEXT NOT NULL REFERENCES reports(id) ON DELETE CASCADE,
        old_status  TEXT,
        new_status  TEXT NOT NULL,
        PRIMARY KEY (history_id, report_id)
    ) STRICT;
";

/// Runs forward-only schema migration to migrate the DB to the latest version.
///
/// This function is idempotent: safe to call on every open regardless of
/// whether the schema has already been applied.
///
/// # Process
///
/// 1. Creates the `schema_version` table if it does not exist.
/// 2. Reads the current version (`0` if the table is empty).
/// 3. If the version is below 1, applies `SCHEMA_V1_SQL` inside a
///    `BEGIN IMMEDIATE` transaction and records `version = 1`.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the DDL fails or the version row cannot be read.
pub fn migrate(db: &mut rusqlite::Connection) -> rusqlite::Result<()> {
    db.execute_batch(SCHEMA_VERSION_DDL)?;

    let version: i64 = db.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute_batch(SCHEMA_V1_SQL)?;
        tx.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
        tx.commit()?;
    }

    Ok(())
}
