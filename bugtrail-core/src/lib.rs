//! bugtrail-core: identity hashing and detection-status tracking for static
//! analyzer findings.
//!
//! Data flows leaf-first through the modules:
//!
//! 1. [`batch`] validates a parser's JSON into [`types::Diagnostic`]s.
//! 2. [`pool`] computes each report's identity ([`hash`]) on worker threads.
//! 3. [`batch::collect`] drops out-of-scope and duplicate reports.
//! 4. [`reconcile`] decides every finding's next detection status.
//! 5. [`db`] applies the outcome atomically; [`store`] wires it all together
//!    under a per-run lock.

pub mod batch;
pub mod db;
pub mod error;
pub mod hash;
pub mod pool;
pub mod reconcile;
pub mod schema;
pub mod source;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use hash::{get_report_hash, get_report_path_hash, HashType};
pub use store::{LockPolicy, Store, StoreOptions, StoreSummary};
pub use types::DetectionStatus;
