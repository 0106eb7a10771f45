//! One-launcher-per-node lock file.
//!
//! The lock file keeps two launcher processes from managing the same node at
//! once; hard reset removes it unconditionally as its final purge step, so a
//! crashed holder never wedges the node.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

/// Errors from lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {path} is already held")]
    Held { path: PathBuf },

    #[error("unable to create lock {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Held launcher lock.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock, creating the lock directory if needed.
    ///
    /// Fails if another launcher already holds it.
    pub fn acquire(lock_dir: &Path, lock_file: &str) -> Result<Self, LockError> {
        fs::create_dir_all(lock_dir).map_err(|source| LockError::Io {
            path: lock_dir.to_path_buf(),
            source,
        })?;

        let path = lock_dir.join(lock_file);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(LockError::Held { path }),
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    /// Path of the held lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock.
    ///
    /// The file may already be gone (hard reset deletes it); absence is not
    /// an error.
    pub fn release(self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "unable to remove lock file");
            }
        }
    }
}
