//! Time sources

use nix::time::{clock_gettime, ClockId};
use parking_lot::Mutex;
use std::sync::OnceLock;
use std::time::Duration;

/// One reading of both clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockReading {
    /// Time since an arbitrary fixed point, never goes backward
    pub monotonic: Duration,
    /// Wall clock, seconds since the epoch
    pub realtime: i64,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> ClockReading;
}

/// Kernel clocks, coarse variants when the kernel has them
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[derive(Clone, Copy)]
struct ClockIds {
    monotonic: ClockId,
    realtime: ClockId,
}

fn clock_ids() -> ClockIds {
    static IDS: OnceLock<ClockIds> = OnceLock::new();
    *IDS.get_or_init(|| {
        let pick = |coarse: ClockId, precise: ClockId| {
            if clock_gettime(coarse).is_ok() {
                coarse
            } else {
                tracing::debug!(?coarse, "coarse clock unavailable, using precise clock");
                precise
            }
        };
        ClockIds {
            monotonic: pick(ClockId::CLOCK_MONOTONIC_COARSE, ClockId::CLOCK_MONOTONIC),
            realtime: pick(ClockId::CLOCK_REALTIME_COARSE, ClockId::CLOCK_REALTIME),
        }
    })
}

impl Clock for SystemClock {
    fn now(&self) -> ClockReading {
        let ids = clock_ids();
        let monotonic = clock_gettime(ids.monotonic)
            .map(|ts| Duration::new(ts.tv_sec().max(0) as u64, ts.tv_nsec().max(0) as u32))
            .unwrap_or_default();
        let realtime = clock_gettime(ids.realtime)
            .map(|ts| ts.tv_sec())
            .unwrap_or_default();
        ClockReading {
            monotonic,
            realtime,
        }
    }
}

/// Clock moved by hand, for tests
#[derive(Debug, Default)]
pub struct ManualClock {
    reading: Mutex<ClockReading>,
}

impl ManualClock {
    pub fn new(realtime: i64) -> Self {
        Self {
            reading: Mutex::new(ClockReading {
                monotonic: Duration::from_secs(1),
                realtime,
            }),
        }
    }

    /// Move both clocks forward
    pub fn advance(&self, by: Duration) {
        let mut reading = self.reading.lock();
        reading.monotonic += by;
        reading.realtime += by.as_secs() as i64;
    }

    /// Step the wall clock only, as an administrator would
    pub fn set_realtime(&self, realtime: i64) {
        self.reading.lock().realtime = realtime;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> ClockReading {
        *self.reading.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second.monotonic >= first.monotonic);
        assert!(first.realtime > 1_500_000_000);
    }

    #[test]
    fn test_manual_clock_rewind_keeps_monotonic() {
        let clock = ManualClock::new(1000);
        clock.advance(Duration::from_secs(30));
        let before = clock.now();
        assert_eq!(before.realtime, 1030);

        clock.set_realtime(500);
        let after = clock.now();
        assert_eq!(after.realtime, 500);
        assert_eq!(after.monotonic, before.monotonic);
    }
}
