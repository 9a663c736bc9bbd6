//! Errors reported by the kernel control interface

use nix::errno::Errno;
use thiserror::Error;

/// Failure of a control call against a mounted filesystem
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("device or resource busy")]
    Busy,

    #[error("no space left on device")]
    NoSpace,

    #[error("out of memory")]
    NoMemory,

    #[error("not found")]
    NotFound,

    #[error("operation not supported")]
    Unsupported,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("control call failed: {0}")]
    Os(Errno),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// Map a raw errno onto the error kinds the cleaner reacts to
    pub fn from_errno(errno: Errno) -> Self {
        match errno {
            Errno::EBUSY => Self::Busy,
            Errno::ENOSPC => Self::NoSpace,
            Errno::ENOMEM => Self::NoMemory,
            Errno::ENOENT => Self::NotFound,
            Errno::ENOTTY | Errno::EOPNOTSUPP | Errno::ENOSYS => Self::Unsupported,
            other => Self::Os(other),
        }
    }

    /// Busy, out of space and out of memory clear up on their own
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::NoSpace | Self::NoMemory)
    }

    /// Errno to report back to IPC clients
    pub fn errno(&self) -> Errno {
        match self {
            Self::Busy => Errno::EBUSY,
            Self::NoSpace => Errno::ENOSPC,
            Self::NoMemory => Errno::ENOMEM,
            Self::NotFound => Errno::ENOENT,
            Self::Unsupported => Errno::ENOTTY,
            Self::InvalidArgument(_) => Errno::EINVAL,
            Self::Os(errno) => *errno,
            Self::Io(err) => err
                .raw_os_error()
                .map(Errno::from_i32)
                .unwrap_or(Errno::EIO),
        }
    }
}

impl From<Errno> for ControlError {
    fn from(errno: Errno) -> Self {
        Self::from_errno(errno)
    }
}
