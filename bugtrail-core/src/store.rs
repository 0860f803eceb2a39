//! The store pipeline: hash a batch, collect its findings, and reconcile them
//! into a Run.
//!
//! At most one store per Run runs at a time. Inside this process that is a
//! per-run async mutex ([`RunLocks`]); across processes the `BEGIN IMMEDIATE`
//! transaction in [`crate::db`] serialises writers on the database file.
//! Stores into different Runs proceed in parallel.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::sync::OwnedMutexGuard;
use tokio_rusqlite::Connection;
use tracing::info;

use crate::batch::{collect, Batch, StoreStats};
use crate::db::{self, CommitPlan, NewRunHistory};
use crate::error::{Error, Result};
use crate::hash::HashType;
use crate::pool::hash_batch;
use crate::reconcile::Transition;
use crate::types::{DetectionStatus, Run};

/// What a store does when its Run is already being stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPolicy {
    /// Wait for the running store to finish.
    #[default]
    Block,
    /// Fail immediately with `Error::RunBusy`.
    Reject,
}

/// One async mutex per run name.
#[derive(Debug, Default)]
pub struct RunLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RunLocks {
    /// Takes the lock of `run`, waiting or failing according to `policy`.
    ///
    /// # Errors
    ///
    /// Returns `Error::RunBusy` under `LockPolicy::Reject` when the lock is held.
    pub async fn acquire(&self, run: &str, policy: LockPolicy) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(run.to_owned()).or_default().clone()
        };

        match policy {
            LockPolicy::Block => Ok(lock.lock_owned().await),
            LockPolicy::Reject => lock
                .try_lock_owned()
                .map_err(|_| Error::RunBusy(run.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Variant used for diagnostics that carry a bug path.
    pub hash_type: HashType,
    pub workers: usize,
    pub lock_policy: LockPolicy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            hash_type: HashType::ContextFree,
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            lock_policy: LockPolicy::Block,
        }
    }
}

/// Result of one successful store.
#[derive(Debug, Clone)]
pub struct StoreSummary {
    pub run: Run,
    pub history_id: String,
    pub stats: StoreStats,
    pub transitions: Vec<Transition>,
}

/// Stores batches into the runs of one database.
pub struct Store {
    conn: Connection,
    locks: RunLocks,
    options: StoreOptions,
    cancel: Arc<AtomicBool>,
}

impl Store {
    pub fn new(conn: Connection, options: StoreOptions) -> Self {
        Self {
            conn,
            locks: RunLocks::default(),
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Opens the database at `path` and wraps it in a `Store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open(path: &str, options: StoreOptions) -> Result<Self> {
        Ok(Self::new(db::open_db(path).await?, options))
    }

    /// Uses `flag` to abort in-flight stores; set it from a signal handler.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Stores `batch` into the run called `run_name`, creating the run on
    /// first use.
    ///
    /// # Errors
    ///
    /// Any error rejects the whole batch and leaves the run unchanged:
    /// `Error::InvalidBatch` for a batch without scope, `Error::RunBusy` under
    /// the reject policy, `Error::Cancelled` when the cancel flag was set, or
    /// the storage error that aborted the transaction.
    pub async fn store_batch(
        &self,
        run_name: &str,
        batch: Batch,
        version_tag: Option<String>,
    ) -> Result<StoreSummary> {
        self.store_batch_at(run_name, batch, version_tag, db::now_secs())
            .await
    }

    /// [`Store::store_batch`] with an explicit storage timestamp.
    pub async fn store_batch_at(
        &self,
        run_name: &str,
        batch: Batch,
        version_tag: Option<String>,
        now: i64,
    ) -> Result<StoreSummary> {
        if run_name.trim().is_empty() {
            return Err(Error::InvalidBatch("run name is empty".to_owned()));
        }
        if batch.analyzed_files.is_empty() && !batch.reports.is_empty() {
            return Err(Error::InvalidBatch(
                "batch has reports but lists no analyzed files".to_owned(),
            ));
        }

        let _guard = self
            .locks
            .acquire(run_name, self.options.lock_policy)
            .await?;

        let Batch {
            analyzed_files,
            checkers,
            analyzer_commands,
            reports,
        } = batch;
        info!(
            run = run_name,
            reports = reports.len(),
            files = analyzed_files.len(),
            "storing batch"
        );

        let StoreOptions {
            hash_type, workers, ..
        } = self.options;
        let cancel = self.cancel.clone();
        let hashed =
            tokio::task::spawn_blocking(move || hash_batch(reports, hash_type, workers, &cancel))
                .await??;

        let mut stats = StoreStats::default();
        let findings = collect(hashed, &analyzed_files, &mut stats);

        let plan = CommitPlan {
            run_name: run_name.to_owned(),
            findings,
            scope: analyzed_files,
            checkers,
            history: NewRunHistory {
                time: now,
                analyzer_commands,
                version_tag,
            },
        };
        let outcome = db::commit_batch(&self.conn, plan, self.cancel.clone()).await?;

        for transition in &outcome.transitions {
            stats.record_transition(transition.new_status);
        }
        info!(
            run = run_name,
            new = stats.count(DetectionStatus::New),
            unresolved = stats.count(DetectionStatus::Unresolved),
            reopened = stats.count(DetectionStatus::Reopened),
            resolved = stats.count(DetectionStatus::Resolved),
            off = stats.count(DetectionStatus::Off),
            unavailable = stats.count(DetectionStatus::Unavailable),
            duplicates = stats.duplicates,
            degraded = stats.degraded,
            "batch stored"
        );

        Ok(StoreSummary {
            run: outcome.run,
            history_id: outcome.history_id,
            stats,
            transitions: outcome.transitions,
        })
    }
}
