//! Reverse mapping from "the last N seconds" to a checkpoint number
//!
//! The mapper keeps a cache of checkpoint spans, newest first. Each span is
//! a run of checkpoints whose creation times never go backward, capped at
//! `SPAN_MAX_CHECKPOINTS` entries. The cache is anchored to a pair of clock
//! readings taken when it was last extended at the new end. Time that has
//! passed since then is measured on the monotonic clock, so stepping the
//! wall clock does not move the protection boundary.
//!
//! Kernel checkpoint scans only run forward. Filling the cache toward older
//! checkpoints steps back one window of checkpoint numbers at a time and
//! scans each window forward.

use crate::clock::{Clock, ClockReading};
use lfsgc_core::layout::CNO_MIN;
use lfsgc_core::{ControlError, CpMode, FsControl, CNO_MAX};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

/// Most checkpoints folded into one span
pub const SPAN_MAX_CHECKPOINTS: u64 = 512;

/// Seconds counted for a gap in which creation times run backward
pub const MIN_GAP: i64 = 1;

/// Checkpoint numbers covered by one backward scan window
const SCAN_WINDOW: u64 = 512;

#[derive(Debug, Error)]
pub enum TrackBackError {
    #[error("checkpoint span cache is empty")]
    EmptyCache,

    #[error(transparent)]
    Control(#[from] ControlError),
}

/// A checkpoint number and its creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMark {
    pub cno: u64,
    pub ctime: i64,
}

/// A run of checkpoints with non-decreasing creation times
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointSpan {
    /// Oldest checkpoint of the run
    pub start: CheckpointMark,
    /// Newest checkpoint of the run
    pub end: CheckpointMark,
    pub count: u64,
}

impl CheckpointSpan {
    fn single(mark: CheckpointMark) -> Self {
        Self {
            start: mark,
            end: mark,
            count: 1,
        }
    }

    pub fn duration(&self) -> i64 {
        self.end.ctime - self.start.ctime
    }
}

/// Time between two creation times, with rewinds counted as `MIN_GAP`
fn gap(later: i64, earlier: i64) -> i64 {
    let gap = later - earlier;
    if gap < 0 {
        MIN_GAP
    } else {
        gap
    }
}

fn elapsed_secs(anchor: ClockReading, now: ClockReading) -> i64 {
    now.monotonic.saturating_sub(anchor.monotonic).as_secs() as i64
}

/// Converts protection periods into protection checkpoints
pub struct ReverseMapper {
    control: Arc<dyn FsControl>,
    clock: Arc<dyn Clock>,
    /// Newest span first
    spans: VecDeque<CheckpointSpan>,
    anchor: Option<ClockReading>,
    /// Highest checkpoint number below the cache not yet scanned, zero once
    /// history is exhausted
    next_older: u64,
    span: tracing::Span,
}

impl ReverseMapper {
    pub fn new(control: Arc<dyn FsControl>, clock: Arc<dyn Clock>, span: tracing::Span) -> Self {
        Self {
            control,
            clock,
            spans: VecDeque::new(),
            anchor: None,
            next_older: 0,
            span,
        }
    }

    /// Cached spans, newest first
    pub fn spans(&self) -> impl Iterator<Item = &CheckpointSpan> {
        self.spans.iter()
    }

    /// Oldest checkpoint that must survive to keep `period` seconds of history
    ///
    /// Returns `CNO_MAX` for a zero period and `CNO_MIN` when the filesystem
    /// has no checkpoints at all.
    pub fn track_back(&mut self, period: u64) -> Result<u64, TrackBackError> {
        if period == 0 {
            return Ok(CNO_MAX);
        }
        let span = self.span.clone();
        let _enter = span.enter();

        let period = i64::try_from(period).unwrap_or(i64::MAX);
        let now = self.clock.now();

        match self.anchor.map(|anchor| elapsed_secs(anchor, now)) {
            None => self.rebuild(now)?,
            Some(elapsed) if period < elapsed / 2 => self.rebuild(now)?,
            Some(elapsed) if period <= elapsed => self.extend_forward(now)?,
            Some(_) => {}
        }

        let Some(anchor) = self.anchor else {
            return Ok(CNO_MIN);
        };
        let target = period - elapsed_secs(anchor, now);
        if target > self.coverage() {
            self.extend_backward(target)?;
        }
        if self.spans.is_empty() {
            self.anchor = None;
            tracing::debug!("no checkpoints to protect");
            return Ok(CNO_MIN);
        }

        let cno = self.search(target)?;
        tracing::debug!(period, cno, spans = self.spans.len(), "tracked back");
        Ok(cno)
    }

    /// Seconds from the anchor back to the oldest cached checkpoint
    fn coverage(&self) -> i64 {
        let Some(anchor) = self.anchor else {
            return 0;
        };
        let mut covered = 0;
        let mut edge = anchor.realtime;
        for span in &self.spans {
            covered += gap(edge, span.end.ctime) + span.duration();
            edge = span.start.ctime;
        }
        covered
    }

    fn rebuild(&mut self, now: ClockReading) -> Result<(), TrackBackError> {
        let stat = self.control.checkpoint_stat()?;
        tracing::debug!(next_cno = stat.cno, "rebuilding checkpoint span cache");
        self.spans.clear();
        self.anchor = Some(now);
        self.next_older = stat.cno.saturating_sub(1);
        Ok(())
    }

    /// Scan checkpoints written since the newest cached one, then re-anchor
    fn extend_forward(&mut self, now: ClockReading) -> Result<(), TrackBackError> {
        let mut start = self
            .spans
            .front()
            .map(|span| span.end.cno + 1)
            .unwrap_or(CNO_MIN);
        loop {
            let batch = self
                .control
                .checkpoint_info(start, CpMode::Checkpoint, SCAN_WINDOW as usize)?;
            let Some(last) = batch.last() else {
                break;
            };
            start = last.cno + 1;
            for cp in batch.iter().filter(|cp| cp.is_valid()) {
                self.push_newer(CheckpointMark {
                    cno: cp.cno,
                    ctime: cp.create as i64,
                });
            }
            if batch.len() < SCAN_WINDOW as usize {
                break;
            }
        }
        self.anchor = Some(now);
        tracing::trace!(newest = start.saturating_sub(1), "extended span cache forward");
        Ok(())
    }

    /// Fill older checkpoints until `target` seconds are covered or history
    /// runs out
    fn extend_backward(&mut self, target: i64) -> Result<(), TrackBackError> {
        while self.next_older >= CNO_MIN && self.coverage() < target {
            let hi = self.next_older;
            let lo = hi.saturating_sub(SCAN_WINDOW - 1).max(CNO_MIN);
            let batch = self
                .control
                .checkpoint_info(lo, CpMode::Checkpoint, SCAN_WINDOW as usize)?;
            for cp in batch
                .iter()
                .rev()
                .filter(|cp| cp.cno <= hi && cp.is_valid())
            {
                self.push_older(CheckpointMark {
                    cno: cp.cno,
                    ctime: cp.create as i64,
                });
            }
            self.next_older = lo - 1;
        }
        Ok(())
    }

    fn push_newer(&mut self, mark: CheckpointMark) {
        match self.spans.front_mut() {
            Some(span) if span.count < SPAN_MAX_CHECKPOINTS && mark.ctime >= span.end.ctime => {
                span.end = mark;
                span.count += 1;
            }
            _ => self.spans.push_front(CheckpointSpan::single(mark)),
        }
    }

    fn push_older(&mut self, mark: CheckpointMark) {
        match self.spans.back_mut() {
            Some(span) if span.count < SPAN_MAX_CHECKPOINTS && mark.ctime <= span.start.ctime => {
                span.start = mark;
                span.count += 1;
            }
            _ => self.spans.push_back(CheckpointSpan::single(mark)),
        }
    }

    /// Find the checkpoint in effect `target` seconds before the anchor
    fn search(&self, target: i64) -> Result<u64, TrackBackError> {
        let anchor = self.anchor.ok_or(TrackBackError::EmptyCache)?;
        let oldest = self.spans.back().ok_or(TrackBackError::EmptyCache)?;

        let mut covered = 0;
        let mut edge = anchor.realtime;
        for span in &self.spans {
            covered += gap(edge, span.end.ctime);
            if target <= covered {
                return Ok(span.end.cno);
            }
            if target <= covered + span.duration() {
                let cutoff = span.end.ctime - (target - covered);
                return self.pinpoint(span, cutoff).map_err(TrackBackError::from);
            }
            covered += span.duration();
            edge = span.start.ctime;
        }
        Ok(oldest.start.cno)
    }

    /// Newest checkpoint of `span` created at or before `cutoff`
    fn pinpoint(&self, span: &CheckpointSpan, cutoff: i64) -> Result<u64, ControlError> {
        let mut found = span.start.cno;
        let mut start = span.start.cno;
        'scan: loop {
            let batch = self
                .control
                .checkpoint_info(start, CpMode::Checkpoint, SCAN_WINDOW as usize)?;
            let Some(last) = batch.last() else {
                break;
            };
            start = last.cno + 1;
            for cp in batch.iter().filter(|cp| cp.is_valid()) {
                if cp.cno > span.end.cno || cp.create as i64 > cutoff {
                    break 'scan;
                }
                found = cp.cno;
            }
            if batch.len() < SCAN_WINDOW as usize {
                break;
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use lfsgc_core::sim::SimFs;
    use lfsgc_core::Geometry;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::path::PathBuf;
    use std::time::Duration;

    const T0: i64 = 1_700_000_000;

    fn sim() -> Arc<SimFs> {
        let geometry = Geometry {
            block_size: 1024,
            blocks_per_segment: 8,
            first_data_block: 1,
            nsegments: 16,
            crc_seed: 7,
            r_segments_percentage: 5,
        };
        Arc::new(SimFs::new(geometry, PathBuf::from("/nonexistent/cleaner.lock")))
    }

    /// Checkpoints 1..=n, one every ten seconds starting at T0 + 10
    fn with_history(n: u64) -> (Arc<SimFs>, Arc<ManualClock>, ReverseMapper) {
        let fs = sim();
        for cno in 1..=n {
            fs.add_checkpoint(cno, (T0 + 10 * cno as i64) as u64, false);
        }
        let clock = Arc::new(ManualClock::new(T0 + 10 * n as i64 + 5));
        let mapper = ReverseMapper::new(fs.clone(), clock.clone(), tracing::Span::none());
        (fs, clock, mapper)
    }

    /// Newest checkpoint created at or before `now - period`, by brute force
    fn expected(fs: &SimFs, now: i64, period: i64) -> u64 {
        let cutoff = now - period;
        let all = fs.checkpoint_info(1, CpMode::Checkpoint, usize::MAX).unwrap();
        all.iter()
            .rev()
            .find(|cp| cp.create as i64 <= cutoff)
            .or(all.first())
            .map(|cp| cp.cno)
            .unwrap()
    }

    #[test]
    fn test_zero_period_is_unbounded() {
        let (_fs, _clock, mut mapper) = with_history(10);
        assert_eq!(mapper.track_back(0).unwrap(), CNO_MAX);
    }

    #[test]
    fn test_no_checkpoints() {
        let fs = sim();
        let clock = Arc::new(ManualClock::new(T0));
        let mut mapper = ReverseMapper::new(fs, clock, tracing::Span::none());
        assert_eq!(mapper.track_back(60).unwrap(), CNO_MIN);
        assert_eq!(mapper.spans().count(), 0);
    }

    #[test]
    fn test_exact_boundaries() {
        let (fs, clock, mut mapper) = with_history(100);
        let now = clock.now().realtime;

        // 5 seconds after the newest checkpoint
        assert_eq!(mapper.track_back(1).unwrap(), 100);
        assert_eq!(mapper.track_back(5).unwrap(), 100);
        assert_eq!(mapper.track_back(6).unwrap(), 99);
        assert_eq!(mapper.track_back(15).unwrap(), 99);
        assert_eq!(mapper.track_back(16).unwrap(), 98);
        assert_eq!(mapper.track_back(500).unwrap(), expected(&fs, now, 500));

        // Older than all history
        assert_eq!(mapper.track_back(100_000).unwrap(), 1);
    }

    #[test]
    fn test_monotonic_in_period() {
        let (fs, clock, mut mapper) = with_history(1200);
        let now = clock.now().realtime;
        let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);

        let mut periods: Vec<u64> = (0..200).map(|_| rng.gen_range(1..14_000)).collect();
        // Ask out of order so every cache path is taken
        for &period in &periods {
            assert_eq!(
                mapper.track_back(period).unwrap(),
                expected(&fs, now, period as i64),
                "period {period}"
            );
        }

        periods.sort_unstable();
        let results: Vec<u64> = periods
            .iter()
            .map(|&p| mapper.track_back(p).unwrap())
            .collect();
        assert!(results.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_spans_are_capped() {
        let (_fs, _clock, mut mapper) = with_history(1200);
        mapper.track_back(1_000_000).unwrap();

        let spans: Vec<_> = mapper.spans().copied().collect();
        assert_eq!(spans.len(), 3);
        assert!(spans.iter().all(|s| s.count <= SPAN_MAX_CHECKPOINTS));
        assert_eq!(spans.iter().map(|s| s.count).sum::<u64>(), 1200);
        assert_eq!(spans[0].end.cno, 1200);
        assert_eq!(spans[2].start.cno, 1);
    }

    #[test]
    fn test_cached_search_scans_once() {
        let (fs, _clock, mut mapper) = with_history(300);
        mapper.track_back(2000).unwrap();
        let before = fs.calls().checkpoint_info;

        assert_eq!(mapper.track_back(1000).unwrap(), 200);
        // Only the pinpointing scan
        assert_eq!(fs.calls().checkpoint_info, before + 1);

        // Landing in the gap after the newest checkpoint needs no scan
        assert_eq!(mapper.track_back(3).unwrap(), 300);
        assert_eq!(fs.calls().checkpoint_info, before + 1);
    }

    #[test]
    fn test_extends_backward_lazily() {
        let (fs, clock, mut mapper) = with_history(2000);
        let now = clock.now().realtime;

        mapper.track_back(100).unwrap();
        let shallow: u64 = mapper.spans().map(|s| s.count).sum();
        assert!(shallow < 2000);

        assert_eq!(mapper.track_back(15_000).unwrap(), expected(&fs, now, 15_000));
        let deep: u64 = mapper.spans().map(|s| s.count).sum();
        assert!(deep > shallow);
    }

    #[test]
    fn test_extends_forward_after_time_passes() {
        let (fs, clock, mut mapper) = with_history(100);
        mapper.track_back(300).unwrap();

        // New checkpoints written over the next 100 seconds
        for cno in 101..=110 {
            fs.add_checkpoint(cno, (T0 + 10 * cno as i64) as u64, false);
        }
        clock.advance(Duration::from_secs(100));
        let now = clock.now().realtime;

        // Period shorter than the elapsed time but more than half of it
        assert_eq!(mapper.track_back(60).unwrap(), expected(&fs, now, 60));
        assert_eq!(mapper.spans().next().unwrap().end.cno, 110);
    }

    #[test]
    fn test_rebuilds_after_long_idle() {
        let (fs, clock, mut mapper) = with_history(100);
        mapper.track_back(300).unwrap();

        for cno in 101..=500 {
            fs.add_checkpoint(cno, (T0 + 10 * cno as i64) as u64, false);
        }
        clock.advance(Duration::from_secs(4000));
        let now = clock.now().realtime;

        assert_eq!(mapper.track_back(50).unwrap(), expected(&fs, now, 50));
        assert_eq!(mapper.spans().next().unwrap().end.cno, 500);
    }

    #[test]
    fn test_wall_clock_rewind_starts_new_span() {
        let fs = sim();
        for cno in 1..=10 {
            fs.add_checkpoint(cno, (T0 + 10 * cno as i64) as u64, false);
        }
        // Clock stepped back an hour, then history continues
        for cno in 11..=20 {
            fs.add_checkpoint(cno, (T0 - 3600 + 10 * cno as i64) as u64, false);
        }
        let clock = Arc::new(ManualClock::new(T0 - 3600 + 205));
        let mut mapper = ReverseMapper::new(fs, clock, tracing::Span::none());

        assert_eq!(mapper.track_back(20).unwrap(), 18);
        mapper.track_back(100_000).unwrap();
        let spans: Vec<_> = mapper.spans().copied().collect();
        assert_eq!(spans.len(), 2);
        assert_eq!((spans[0].start.cno, spans[0].end.cno), (11, 20));
        assert_eq!((spans[1].start.cno, spans[1].end.cno), (1, 10));

        // 95s of span 0, 1s of rewound gap, then into span 1
        assert_eq!(mapper.track_back(5 + 90 + 1 + 20).unwrap(), 8);
    }
}
