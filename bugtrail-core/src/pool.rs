//! Parallel hashing of a batch of diagnostics.
//!
//! Hashing is pure apart from reading source lines, so the batch is spread
//! over a dedicated rayon pool with no shared mutable state. The indexed
//! collect keeps results in input order.

use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use tracing::debug;

use crate::batch::HashedReport;
use crate::error::{Error, Result};
use crate::hash::{get_report_path_hash, HashType};
use crate::types::Diagnostic;

/// Hashes every diagnostic in `reports` on `workers` threads.
///
/// `hash_type` is the variant for diagnostics that carry a bug path; the
/// others always use [`HashType::ContextFree`]. A hash supplied by the parser
/// is kept as is. `cancel` is polled before each item.
///
/// # Errors
///
/// Returns `Error::Cancelled` when `cancel` was set, and `Error::Worker` if
/// the thread pool could not be built.
pub fn hash_batch(
    reports: Vec<Diagnostic>,
    hash_type: HashType,
    workers: usize,
    cancel: &AtomicBool,
) -> Result<Vec<HashedReport>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("bugtrail-hash-{i}"))
        .build()
        .map_err(|e| Error::Worker(e.to_string()))?;

    pool.install(|| {
        reports
            .into_par_iter()
            .map(|diag| {
                if cancel.load(Ordering::Relaxed) {
                    Err(Error::Cancelled)
                } else {
                    Ok(hash_one(diag, hash_type))
                }
            })
            .collect::<Result<Vec<_>>>()
    })
}

fn hash_one(mut diag: Diagnostic, hash_type: HashType) -> HashedReport {
    let effective = HashType::for_diagnostic(&diag, hash_type);
    let degraded = diag.fill_report_hash(effective);
    let report_hash = diag.report_hash.clone().unwrap_or_default();
    let path_hash = get_report_path_hash(&diag);

    debug!(
        file = diag.location.file.path(),
        line = diag.location.line,
        hash = %report_hash,
        hash_type = %effective,
        "hashed report"
    );

    HashedReport {
        diagnostic: diag,
        report_hash,
        path_hash,
        degraded,
    }
}
