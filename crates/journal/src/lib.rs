//! Checkpoint history helpers
//!
//! This crate provides:
//! - Monotonic and wall clocks behind an injectable trait
//! - Snapshot list scanning
//! - The checkpoint reverse mapper (seconds of history to checkpoint number)

pub mod checkpoint;
pub mod clock;
pub mod cnormap;

// Re-exports
pub use checkpoint::snapshot_numbers;
pub use clock::{Clock, ClockReading, ManualClock, SystemClock};
pub use cnormap::{CheckpointMark, CheckpointSpan, ReverseMapper, TrackBackError};
