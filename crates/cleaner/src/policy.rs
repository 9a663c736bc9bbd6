//! Segment selection policies

use lfsgc_core::SegmentUsage;

/// Scores reclaimable segments; lower scores are cleaned first
pub trait SelectionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Score of `usage`, comparable with a cutoff in seconds since the epoch
    fn importance(&self, usage: &SegmentUsage, now: u64) -> u64;
}

/// Oldest segments first
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampPolicy;

impl SelectionPolicy for TimestampPolicy {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn importance(&self, usage: &SegmentUsage, _now: u64) -> u64 {
        usage.lastmod
    }
}

/// Look up a built-in policy by its configuration name
pub fn policy_by_name(name: &str) -> Option<Box<dyn SelectionPolicy>> {
    match name {
        "timestamp" => Some(Box::new(TimestampPolicy)),
        _ => None,
    }
}
