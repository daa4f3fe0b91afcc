//! Cross-process build lock
//!
//! The image tool attaches loop devices and edits shared state under
//! `/dev`; two builds at once corrupt each other. Every dispatcher process
//! on the host takes an exclusive `flock(2)` on the same file for the
//! duration of one build.

use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Named lock file shared by all dispatcher processes on a host
#[derive(Debug, Clone)]
pub struct BuildLock {
    path: PathBuf,
}

/// Held lock; released when dropped
pub struct BuildLockGuard {
    path: PathBuf,
    _lock: Flock<File>,
}

impl BuildLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is ours
    pub async fn acquire(&self) -> Result<BuildLockGuard> {
        let path = self.path.clone();
        debug!("Waiting for build lock {}", path.display());

        let guard = tokio::task::spawn_blocking(move || -> Result<BuildLockGuard> {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
                Error::Other(format!("failed to lock {}: {}", path.display(), errno))
            })?;
            Ok(BuildLockGuard { path, _lock: lock })
        })
        .await
        .map_err(|e| Error::Other(format!("build lock task failed: {}", e)))??;

        debug!("Acquired build lock {}", guard.path.display());
        Ok(guard)
    }

    /// Take the lock only if nobody holds it
    pub fn try_acquire(&self) -> Result<Option<BuildLockGuard>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(BuildLockGuard {
                path: self.path.clone(),
                _lock: lock,
            })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(Error::Other(format!(
                "failed to lock {}: {}",
                self.path.display(),
                errno
            ))),
        }
    }
}

impl BuildLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BuildLockGuard {
    fn drop(&mut self) {
        debug!("Released build lock {}", self.path.display());
    }
}
