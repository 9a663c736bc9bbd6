//! Cleaner errors

use lfsgc_core::ControlError;
use lfsgc_journal::TrackBackError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CleanerError {
    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    TrackBack(#[from] TrackBackError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CleanerError {
    /// Worth retrying after a pause with a smaller batch
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Control(err) => err.is_transient(),
            Self::TrackBack(TrackBackError::Control(err)) => err.is_transient(),
            _ => false,
        }
    }
}
