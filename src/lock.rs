//! Invocation lock
//!
//! Two concurrent invocations would interleave kernel edits, so the binary
//! holds an exclusive `flock(2)` on a lock file for its whole run. The lock
//! is released when the file is closed.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// Held exclusive lock
#[derive(Debug)]
pub struct InvocationLock {
    _file: File,
    path: PathBuf,
}

impl InvocationLock {
    /// Block until the lock at `path` is acquired.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of opening or locking the file.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        Self::lock(path, libc::LOCK_EX)
    }

    /// Acquire without blocking; `WouldBlock` if another invocation holds it.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of opening or locking the file.
    pub fn try_acquire(path: &Path) -> io::Result<Self> {
        Self::lock(path, libc::LOCK_EX | libc::LOCK_NB)
    }

    /// [`try_acquire`](Self::try_acquire), then block with a notice if
    /// another invocation holds the lock.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of opening or locking the file.
    pub fn acquire_or_wait(path: &Path) -> io::Result<Self> {
        match Self::try_acquire(path) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                info!("Another tpgate invocation holds {}, waiting", path.display());
                Self::acquire(path)
            }
            other => other,
        }
    }

    fn lock(path: &Path, operation: libc::c_int) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).truncate(false).write(true).open(path)?;

        loop {
            // SAFETY: the descriptor is owned by `file` and stays open for the call
            let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
            if rc == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        debug!("Acquired lock {}", path.display());
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    /// Lock file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
