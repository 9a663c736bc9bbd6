//! Segment cleaning: liveness, reclaim and scheduling
//!
//! This crate provides:
//! - Block accounting over decoded segments
//! - Liveness classification against checkpoints and snapshots
//! - The reclaim orchestrator (one atomic clean-segments call per batch)
//! - The cleaner state machine and scheduler driven by the daemon

pub mod accounting;
pub mod config;
pub mod error;
pub mod liveness;
pub mod policy;
pub mod reclaim;
pub mod scheduler;
pub mod state;

// Re-exports
pub use config::{CleanerConfig, Threshold};
pub use error::CleanerError;
pub use policy::{SelectionPolicy, TimestampPolicy};
pub use reclaim::{ReclaimParams, ReclaimStats, Reclaimer};
pub use scheduler::{CycleOutcome, Scheduler, StatusReport};
pub use state::{CleanerState, DaemonStatus, ManualJob, RunArgs};

/// Result type for cleaner operations
pub type Result<T> = std::result::Result<T, CleanerError>;
