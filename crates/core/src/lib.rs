//! Core primitives for the log-structured filesystem cleaner
//!
//! This crate provides:
//! - On-disk layout constants and record parsing
//! - A resumable decoder for segment logs
//! - The kernel control interface (`FsControl`) and its Linux implementation
//! - The filesystem-wide cleaner lock and signal masking
//! - An in-memory filesystem for tests (feature `testing`)

pub mod checksum;
pub mod control;
pub mod decoder;
pub mod error;
pub mod layout;
pub mod lock;

#[cfg(target_os = "linux")]
pub mod ioctl;

#[cfg(any(test, feature = "testing"))]
pub mod sim;

// Re-exports
pub use control::{
    BlockDesc, CheckpointInfo, CheckpointStat, CleanRequest, CpMode, FsControl, Period,
    SegmentBuf, SegmentUsage, UsageStat, VirtualBlockDesc, VirtualBlockInfo,
};
pub use decoder::{Block, FileRecord, PartialSegment, SegmentLog};
pub use error::ControlError;
pub use layout::{seq_cmp, BlockInfo, FileInfo, Geometry, SegmentSummary, CNO_MAX};
pub use lock::{CleanerLock, ReclaimSection, SignalBlock};

/// Result type for control operations
pub type Result<T> = std::result::Result<T, ControlError>;
