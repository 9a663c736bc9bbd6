//! Filesystem-wide cleaner lock and termination signal masking
//!
//! Only one reclaim may run against a filesystem at a time, whichever
//! process starts it. The lock is an exclusive `flock` on a file named by
//! `FsControl::cleaner_lock_path`. While it is held, termination signals
//! are blocked so a clean-segments call is never abandoned halfway.

use crate::error::ControlError;
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Exclusive cleaner lock, released on drop
pub struct CleanerLock {
    path: PathBuf,
    file: File,
}

impl CleanerLock {
    /// Block until the lock is ours
    pub fn acquire(path: &Path) -> Result<Self, ControlError> {
        let file = Self::open(path)?;
        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusive) {
                Ok(()) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ControlError::Os(e)),
            }
        }
        tracing::trace!(path = %path.display(), "cleaner lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Take the lock only if nobody holds it
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, ControlError> {
        let file = Self::open(path)?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(Some(Self {
                path: path.to_path_buf(),
                file,
            })),
            Err(Errno::EWOULDBLOCK) => Ok(None),
            Err(e) => Err(ControlError::Os(e)),
        }
    }

    fn open(path: &Path) -> Result<File, ControlError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CleanerLock {
    fn drop(&mut self) {
        // The file stays: another cleaner may already be waiting on it.
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}

/// Termination signals held back while a reclaim is in progress
pub const BLOCKED_SIGNALS: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
];

/// Blocks termination signals on the current thread until dropped
pub struct SignalBlock {
    previous: SigSet,
}

impl SignalBlock {
    pub fn new() -> Result<Self, ControlError> {
        let mut set = SigSet::empty();
        for signal in BLOCKED_SIGNALS {
            set.add(signal);
        }
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut previous))?;
        Ok(Self { previous })
    }
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
    }
}

/// Signals blocked and cleaner lock held, undone in reverse on drop
pub struct ReclaimSection {
    // Field order is drop order: unlock first, then unblock signals.
    _lock: CleanerLock,
    _signals: SignalBlock,
}

impl ReclaimSection {
    pub fn enter(lock_path: &Path) -> Result<Self, ControlError> {
        let signals = SignalBlock::new()?;
        let lock = CleanerLock::acquire(lock_path)?;
        Ok(Self {
            _lock: lock,
            _signals: signals,
        })
    }
}
