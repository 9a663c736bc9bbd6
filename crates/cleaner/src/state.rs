//! Cleaner state machine
//!
//! Transitions are pure: each consumes the current state and returns the
//! next one, so the scheduler writes `state = state.suspend()` and the
//! rules can be tested without a filesystem.

use serde::{Deserialize, Serialize};

/// Overrides for a manual run or for tuning automatic cleaning
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunArgs {
    pub protection_period: Option<u64>,
    pub nsegments_per_clean: Option<u32>,
    /// Seconds between cleaning steps
    pub cleaning_interval: Option<u64>,
    pub npasses: Option<u32>,
    pub min_reclaimable_blocks: Option<u64>,
}

impl RunArgs {
    /// Take every value set in `other`, keep the rest
    pub fn merge(&mut self, other: &RunArgs) {
        self.protection_period = other.protection_period.or(self.protection_period);
        self.nsegments_per_clean = other.nsegments_per_clean.or(self.nsegments_per_clean);
        self.cleaning_interval = other.cleaning_interval.or(self.cleaning_interval);
        self.npasses = other.npasses.or(self.npasses);
        self.min_reclaimable_blocks = other.min_reclaimable_blocks.or(self.min_reclaimable_blocks);
    }
}

/// A cleaning job started on request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManualJob {
    pub id: u32,
    pub remaining_passes: u32,
    /// Segments left in the current pass, zero before a pass starts
    pub remaining_segments: u64,
    pub args: RunArgs,
}

impl ManualJob {
    pub fn new(id: u32, args: RunArgs) -> Self {
        Self {
            id,
            remaining_passes: args.npasses.unwrap_or(1).max(1),
            remaining_segments: 0,
            args,
        }
    }

    pub fn in_pass(&self) -> bool {
        self.remaining_segments > 0
    }

    /// Close the current pass; true when it was the last one
    pub fn end_pass(&mut self) -> bool {
        self.remaining_segments = 0;
        self.remaining_passes = self.remaining_passes.saturating_sub(1);
        self.remaining_passes == 0
    }
}

/// Coarse status reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonStatus {
    Idle,
    Running,
    Suspended,
    RunningManual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CleanerState {
    #[default]
    Idle,
    RunningAutomatic,
    SuspendedManual {
        job: Option<ManualJob>,
    },
    RunningManual(ManualJob),
}

impl CleanerState {
    /// Start a manual job, replacing whatever was going on
    pub fn run(self, job: ManualJob) -> Self {
        Self::RunningManual(job)
    }

    pub fn suspend(self) -> Self {
        match self {
            Self::RunningManual(job) => Self::SuspendedManual { job: Some(job) },
            Self::SuspendedManual { job } => Self::SuspendedManual { job },
            Self::Idle | Self::RunningAutomatic => Self::SuspendedManual { job: None },
        }
    }

    pub fn resume(self) -> Self {
        match self {
            Self::SuspendedManual { job: Some(job) } => Self::RunningManual(job),
            Self::SuspendedManual { job: None } => Self::Idle,
            other => other,
        }
    }

    /// Cancel the manual job, if any; a suspended cleaner stays suspended
    pub fn stop(self) -> Self {
        match self {
            Self::RunningManual(_) => Self::Idle,
            Self::SuspendedManual { .. } => Self::SuspendedManual { job: None },
            other => other,
        }
    }

    /// The running manual job completed
    pub fn finish(self) -> Self {
        match self {
            Self::RunningManual(_) => Self::Idle,
            other => other,
        }
    }

    /// Manual job, running or suspended
    pub fn job(&self) -> Option<&ManualJob> {
        match self {
            Self::RunningManual(job) => Some(job),
            Self::SuspendedManual { job } => job.as_ref(),
            _ => None,
        }
    }

    pub fn job_mut(&mut self) -> Option<&mut ManualJob> {
        match self {
            Self::RunningManual(job) => Some(job),
            Self::SuspendedManual { job } => job.as_mut(),
            _ => None,
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::SuspendedManual { .. })
    }

    pub fn status(&self) -> DaemonStatus {
        match self {
            Self::Idle => DaemonStatus::Idle,
            Self::RunningAutomatic => DaemonStatus::Running,
            Self::SuspendedManual { .. } => DaemonStatus::Suspended,
            Self::RunningManual(_) => DaemonStatus::RunningManual,
        }
    }
}
