//! Version tags for run-history entries.

use std::path::Path;

use tracing::debug;

/// Returns the commit id HEAD points at in the repository containing `path`.
///
/// `None` when `path` is not inside a git repository or HEAD is unborn; a
/// missing tag never blocks a store.
pub fn head_revision(path: &Path) -> Option<String> {
    let repo = match git2::Repository::discover(path) {
        Ok(repo) => repo,
        Err(e) => {
            debug!(path = %path.display(), "no git repository: {}", e);
            return None;
        }
    };
    let commit = repo.head().ok()?.peel_to_commit().ok()?;
    Some(commit.id().to_string())
}
