//! Run-level mutual exclusion.
//!
//! Branch switches and merges assume exclusive access to the working tree,
//! so two crawl runs against the same repository must never overlap.
//! "Another run is in progress" is a hard precondition failure — it is
//! never queued or retried.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use alluvium_shared::{AlluviumError, METADATA_DIR, Result, RunId};

/// Lock file path relative to the working tree root. Stores that snapshot
/// the tree must exclude this path from version tracking.
pub const RUN_LOCK_REL: &str = ".alluvium/run.lock";

/// Exclusive lock over one repository's working tree, held for the duration
/// of a crawl run. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    run_id: RunId,
}

impl RunLock {
    /// Acquire the lock, failing immediately if another run holds it.
    pub fn acquire(repo_root: &Path) -> Result<Self> {
        let dir = repo_root.join(METADATA_DIR);
        std::fs::create_dir_all(&dir).map_err(|e| AlluviumError::io(&dir, e))?;

        let path = repo_root.join(RUN_LOCK_REL);
        let run_id = RunId::new();

        // create_new is the atomicity guarantee: exactly one run wins.
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(AlluviumError::RunInProgress { path });
            }
            Err(e) => return Err(AlluviumError::io(&path, e)),
        };

        writeln!(file, "{run_id}").map_err(|e| AlluviumError::io(&path, e))?;
        debug!(?path, %run_id, "run lock acquired");
        Ok(Self { path, run_id })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = ?self.path, error = %e, "failed to release run lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RunLock::acquire(dir.path()).expect("first acquire");

        let err = RunLock::acquire(dir.path()).expect_err("held");
        assert!(matches!(err, AlluviumError::RunInProgress { .. }));

        drop(lock);
        RunLock::acquire(dir.path()).expect("released");
    }

    #[test]
    fn lock_file_carries_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RunLock::acquire(dir.path()).unwrap();

        let content = std::fs::read_to_string(dir.path().join(RUN_LOCK_REL)).unwrap();
        assert_eq!(content.trim(), lock.run_id().to_string());
    }
}
