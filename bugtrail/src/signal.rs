//! Shutdown signal handling.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag::register;

/// Returns a flag that becomes `true` when the process receives SIGTERM or
/// SIGINT.
///
/// The store pipeline polls it between hashing steps and once more right
/// before committing, so an interrupted store is rolled back as a whole
/// instead of being cut off midway.
///
/// # Errors
///
/// Returns `Err` if the OS refuses to register either handler.
pub fn register_shutdown() -> std::io::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    // The handler only performs an atomic store, which is async-signal-safe.
    register(SIGTERM, Arc::clone(&flag))?;
    register(SIGINT, Arc::clone(&flag))?;
    Ok(flag)
}
