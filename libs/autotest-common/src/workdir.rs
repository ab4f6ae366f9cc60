//! Working directory reclamation

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Remove `path` and everything below it.
///
/// Returns `Ok(false)` when the directory was already gone, so two racing
/// cleanups of the same path both succeed.
pub fn remove_dir_idempotent(path: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Scoped ownership of a job's working directory during setup.
///
/// The directory is deleted when the guard drops, unless `disarm` was called
/// after the job was handed off to the queue runtime.
#[derive(Debug)]
pub struct WorkDirGuard {
    path: Option<PathBuf>,
}

impl WorkDirGuard {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Give up ownership; the directory survives the guard.
    pub fn disarm(mut self) -> Option<PathBuf> {
        self.path.take()
    }
}

impl Drop for WorkDirGuard {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match remove_dir_idempotent(&path) {
            Ok(true) => debug!(path = %path.display(), "Removed working directory of rejected job"),
            Ok(false) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove working directory"),
        }
    }
}
