//! Reclaim orchestration
//!
//! One reclaim takes a batch of candidate segments, decodes them, works out
//! which blocks are still live and hands the kernel a single clean-segments
//! request that moves the live blocks and frees the segments. The request is
//! all or nothing.

use crate::accounting::BlockSet;
use crate::error::CleanerError;
use crate::liveness::{fill_block_descs, fill_periods, toss_bdescs, toss_vdescs, LivenessClassifier};
use ahash::AHashSet;
use lfsgc_core::{seq_cmp, CleanRequest, ControlError, FsControl, ReclaimSection, SegmentLog, CNO_MAX};
use lfsgc_journal::{snapshot_numbers, Clock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimParams {
    /// Segments with a sequence number at or past this, in wrapping
    /// order, are left alone
    pub protseq: u64,
    /// Blocks still visible after this checkpoint are kept
    pub protcno: Option<u64>,
    /// Defer the batch when fewer blocks per segment would be freed
    pub min_reclaimable_blocks: Option<u64>,
    /// Classify only, change nothing
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimStats {
    pub cleaned_segs: usize,
    pub protected_segs: usize,
    pub deferred_segs: usize,
    pub live_vblocks: usize,
    pub defunct_vblocks: usize,
    /// Virtual blocks the DAT did not know, left behind
    pub missing_vblocks: usize,
    pub live_blocks: usize,
    pub defunct_blocks: usize,
    pub freed_periods: usize,
}

impl ReclaimStats {
    pub fn live_total(&self) -> usize {
        self.live_vblocks + self.live_blocks
    }
}

pub struct Reclaimer {
    control: Arc<dyn FsControl>,
    clock: Arc<dyn Clock>,
    /// Cleared for good once the kernel turns out not to support it
    use_set_suinfo: bool,
    span: tracing::Span,
}

impl Reclaimer {
    pub fn new(
        control: Arc<dyn FsControl>,
        clock: Arc<dyn Clock>,
        use_set_suinfo: bool,
        span: tracing::Span,
    ) -> Self {
        Self {
            control,
            clock,
            use_set_suinfo,
            span,
        }
    }

    pub fn use_set_suinfo(&self) -> bool {
        self.use_set_suinfo
    }

    pub fn set_use_set_suinfo(&mut self, enabled: bool) {
        self.use_set_suinfo = enabled;
    }

    /// Reclaim `segnums`, holding the filesystem cleaner lock throughout
    pub fn reclaim(
        &mut self,
        segnums: &[u64],
        params: &ReclaimParams,
    ) -> Result<ReclaimStats, CleanerError> {
        let span = self.span.clone();
        let _enter = span.enter();
        let _section = ReclaimSection::enter(&self.control.cleaner_lock_path())?;

        let mut stats = ReclaimStats::default();
        let (kept, mut blocks) = self.collect(segnums, params, &mut stats)?;
        if kept.is_empty() {
            tracing::debug!(protected = stats.protected_segs, "nothing left to reclaim");
            return Ok(stats);
        }

        stats.missing_vblocks = fill_periods(self.control.as_ref(), &mut blocks.vdescs)?;
        let snapshots = snapshot_numbers(self.control.as_ref())?;
        let mut classifier =
            LivenessClassifier::new(params.protcno.unwrap_or(CNO_MAX), &snapshots);
        let tossed = toss_vdescs(&mut blocks.vdescs, &mut classifier);

        fill_block_descs(self.control.as_ref(), &mut blocks.bdescs)?;
        stats.defunct_blocks = toss_bdescs(&mut blocks.bdescs);

        stats.live_vblocks = blocks.vdescs.len();
        stats.defunct_vblocks = tossed.vblocknrs.len();
        stats.live_blocks = blocks.bdescs.len();
        stats.freed_periods = tossed.periods.len();

        let nsegs = kept.len() as u64;
        if let Some(min) = params.min_reclaimable_blocks {
            if self.use_set_suinfo && self.should_defer(&kept, min, &stats, params.dry_run)? {
                stats.deferred_segs = kept.len();
                return Ok(stats);
            }
        }

        if params.dry_run {
            return Ok(stats);
        }

        let request = CleanRequest {
            vdescs: blocks.vdescs,
            periods: tossed.periods,
            vblocknrs: tossed.vblocknrs,
            bdescs: blocks.bdescs,
            segnums: kept,
        };
        self.control.clean_segments(&request)?;
        stats.cleaned_segs = request.segnums.len();
        tracing::info!(
            segments = nsegs,
            live = stats.live_total(),
            freed = stats.defunct_vblocks + stats.defunct_blocks,
            "segments reclaimed"
        );
        Ok(stats)
    }

    /// Re-check each candidate and gather the blocks of those still worth
    /// cleaning
    fn collect(
        &self,
        segnums: &[u64],
        params: &ReclaimParams,
        stats: &mut ReclaimStats,
    ) -> Result<(Vec<u64>, BlockSet), CleanerError> {
        let geometry = *self.control.geometry();
        let mut seen = AHashSet::with_capacity(segnums.len());
        let mut kept = Vec::with_capacity(segnums.len());
        let mut blocks = BlockSet::new();

        for &segnum in segnums {
            if !seen.insert(segnum) {
                continue;
            }
            let usage = self.control.segment_usage(segnum, 1)?;
            match usage.first() {
                Some(u) if u.segnum == segnum && u.is_reclaimable() => {}
                _ => {
                    tracing::debug!(segnum, "segment no longer reclaimable");
                    continue;
                }
            }

            let buf = match self.control.read_segment(segnum) {
                Ok(buf) => buf,
                Err(ControlError::NotFound) => {
                    tracing::debug!(segnum, "segment vanished");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let log = SegmentLog::new(&buf, &geometry, segnum);
            if let Some(seq) = log.seq() {
                if seq_cmp(seq, params.protseq) != Ordering::Less {
                    tracing::debug!(segnum, seq, protseq = params.protseq, "segment protected");
                    stats.protected_segs += 1;
                    continue;
                }
            }
            blocks.add_segment(log);
            kept.push(segnum);
        }
        Ok((kept, blocks))
    }

    /// Whether too little would be freed; stamps the segments when so
    fn should_defer(
        &mut self,
        kept: &[u64],
        min: u64,
        stats: &ReclaimStats,
        dry_run: bool,
    ) -> Result<bool, CleanerError> {
        let nsegs = kept.len() as u64;
        let capacity = u64::from(self.control.geometry().blocks_per_segment) * nsegs;
        let reclaimable = capacity.saturating_sub(stats.live_total() as u64);
        if reclaimable >= min * nsegs {
            return Ok(false);
        }
        if dry_run {
            return Ok(true);
        }

        let now = self.clock.now().realtime.max(0) as u64;
        match self.control.set_segment_lastmod(kept, now) {
            Ok(()) => {
                tracing::info!(
                    segments = nsegs,
                    reclaimable,
                    "too few reclaimable blocks, deferring"
                );
                Ok(true)
            }
            Err(ControlError::Unsupported) => {
                tracing::warn!("kernel cannot update segment usage, deferral disabled");
                self.use_set_suinfo = false;
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}
