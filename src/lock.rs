//! Readers-writer coordination between tests sharing the device.
//!
//! Most tests can interleave against the shared device and build directory;
//! a few must run alone. Both cases go through one advisory lock file:
//! ordinary tests take it shared, exclusive tests take it exclusively and
//! block until every other holder is gone.

use crate::error::{Error, Result};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// How the lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Any number of shared holders may coexist
    Shared,
    /// Excludes all other holders, shared or exclusive
    Exclusive,
}

impl LockMode {
    fn operation(self) -> libc::c_int {
        match self {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        }
    }
}

/// An acquired advisory lock on the shared test resource.
///
/// Released when dropped, whatever the test outcome. The lock file itself
/// is never deleted: unlinking it would race against a concurrent holder
/// re-creating it and silently split the lock.
pub struct ExclusivityLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl ExclusivityLock {
    /// Acquires the lock, blocking until it is granted.
    pub fn acquire(path: impl Into<PathBuf>, mode: LockMode) -> Result<Self> {
        let path = path.into();
        let file = open_lock_file(&path).map_err(Error::Io)?;

        flock(&file, mode.operation()).map_err(Error::Io)?;

        debug!("acquired {:?} lock on {}", mode, path.display());
        Ok(Self { file, path, mode })
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// Returns `Ok(None)` when another holder is in the way.
    pub fn try_acquire(path: impl Into<PathBuf>, mode: LockMode) -> Result<Option<Self>> {
        let path = path.into();
        let file = open_lock_file(&path).map_err(Error::Io)?;

        match flock(&file, mode.operation() | libc::LOCK_NB) {
            Ok(()) => {
                debug!("acquired {:?} lock on {}", mode, path.display());
                Ok(Some(Self { file, path, mode }))
            }
            Err(e) if e.raw_os_error() == Some(libc::EWOULDBLOCK) => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ExclusivityLock {
    fn drop(&mut self) {
        // Closing the descriptor would release the lock as well; the
        // explicit unlock keeps the release visible at one place.
        // SAFETY: the fd is valid for the lifetime of `self.file`.
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        debug!("released {:?} lock on {}", self.mode, self.path.display());
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    loop {
        // SAFETY: the fd is valid for the lifetime of `file`.
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shared_holders_coexist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exclusive.test.lock");

        let first = ExclusivityLock::acquire(&path, LockMode::Shared).unwrap();
        let second = ExclusivityLock::try_acquire(&path, LockMode::Shared).unwrap();
        assert!(second.is_some());

        drop(first);
        drop(second);
    }

    #[test]
    fn test_exclusive_excludes_shared_and_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exclusive.test.lock");

        let writer = ExclusivityLock::acquire(&path, LockMode::Exclusive).unwrap();
        assert!(ExclusivityLock::try_acquire(&path, LockMode::Shared)
            .unwrap()
            .is_none());
        assert!(ExclusivityLock::try_acquire(&path, LockMode::Exclusive)
            .unwrap()
            .is_none());

        drop(writer);
        assert!(ExclusivityLock::try_acquire(&path, LockMode::Shared)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_shared_holder_blocks_writer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exclusive.test.lock");

        let reader = ExclusivityLock::acquire(&path, LockMode::Shared).unwrap();
        assert!(ExclusivityLock::try_acquire(&path, LockMode::Exclusive)
            .unwrap()
            .is_none());

        drop(reader);
        assert!(ExclusivityLock::try_acquire(&path, LockMode::Exclusive)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_lock_file_survives_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exclusive.test.lock");

        let lock = ExclusivityLock::acquire(&path, LockMode::Exclusive).unwrap();
        drop(lock);

        assert!(path.exists());
    }
}
