//! Block liveness
//!
//! A regular-file block is live while any checkpoint that must survive can
//! still see it. Its validity period `[start, end)` comes from the DAT;
//! `end == CNO_MAX` means the newest checkpoint still uses it. A DAT block
//! is live only while the DAT still maps its offset to the very block that
//! was written in the segment.

use lfsgc_core::{
    BlockDesc, ControlError, FsControl, Period, VirtualBlockDesc, VirtualBlockInfo, CNO_MAX,
};

/// Virtual blocks looked up per control call
pub const VINFO_BATCH: usize = 512;

/// DAT block descriptors looked up per control call
pub const BDESC_BATCH: usize = 512;

/// Look up the validity period of every virtual block
///
/// Leaves `vdescs` sorted by virtual block number. Blocks the DAT no longer
/// knows are dropped; returns how many.
pub fn fill_periods(
    control: &dyn FsControl,
    vdescs: &mut Vec<VirtualBlockDesc>,
) -> Result<usize, ControlError> {
    vdescs.sort_unstable_by_key(|v| v.vblocknr);
    let mut missing = Vec::new();
    for chunk in vdescs.chunks_mut(VINFO_BATCH) {
        let vblocknrs: Vec<u64> = chunk.iter().map(|v| v.vblocknr).collect();
        match control.virtual_block_info(&vblocknrs) {
            Ok(infos) => {
                if infos.len() != chunk.len() {
                    return Err(ControlError::InvalidArgument(format!(
                        "asked for {} virtual blocks, got {}",
                        chunk.len(),
                        infos.len()
                    )));
                }
                for (vdesc, info) in chunk.iter_mut().zip(infos) {
                    set_period(vdesc, &info);
                }
            }
            // Find the culprits one at a time
            Err(ControlError::NotFound) => {
                for vdesc in chunk.iter_mut() {
                    match control.virtual_block_info(&[vdesc.vblocknr]) {
                        Ok(infos) if infos.len() == 1 => set_period(vdesc, &infos[0]),
                        Ok(_) | Err(ControlError::NotFound) => {
                            tracing::warn!(vblocknr = vdesc.vblocknr, ino = vdesc.ino, "virtual block not found, skipping");
                            missing.push(vdesc.vblocknr);
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            Err(err) => return Err(err),
        }
    }
    if !missing.is_empty() {
        vdescs.retain(|v| missing.binary_search(&v.vblocknr).is_err());
    }
    Ok(missing.len())
}

fn set_period(vdesc: &mut VirtualBlockDesc, info: &VirtualBlockInfo) {
    vdesc.period = Period {
        start: info.start,
        end: info.end,
    };
}

/// Fill in where the DAT currently maps each DAT block
///
/// A block the DAT cannot resolve gets `blocknr` 0, which makes it dead.
pub fn fill_block_descs(
    control: &dyn FsControl,
    bdescs: &mut [BlockDesc],
) -> Result<(), ControlError> {
    for chunk in bdescs.chunks_mut(BDESC_BATCH) {
        match control.block_descriptors(chunk) {
            Ok(()) => {}
            Err(ControlError::NotFound) => {
                for bdesc in chunk.iter_mut() {
                    match control.block_descriptors(std::slice::from_mut(bdesc)) {
                        Ok(()) => {}
                        Err(ControlError::NotFound) => {
                            tracing::warn!(offset = bdesc.offset, level = bdesc.level, "DAT block not found, skipping");
                            bdesc.blocknr = 0;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Decides whether virtual blocks are still needed
pub struct LivenessClassifier<'a> {
    /// Blocks whose period ends after this checkpoint are kept
    protect: u64,
    /// Snapshot checkpoint numbers, ascending
    snapshots: &'a [u64],
    /// Index of the snapshot that last kept a block alive
    last_hit: usize,
}

impl<'a> LivenessClassifier<'a> {
    pub fn new(protect: u64, snapshots: &'a [u64]) -> Self {
        debug_assert!(snapshots.windows(2).all(|w| w[0] < w[1]));
        Self {
            protect,
            snapshots,
            last_hit: 0,
        }
    }

    pub fn vdesc_is_live(&mut self, vdesc: &VirtualBlockDesc) -> bool {
        let Period { start, end } = vdesc.period;
        if vdesc.cno == 0 {
            return end == CNO_MAX;
        }
        if end == vdesc.cno {
            return false;
        }
        if end == CNO_MAX || end > self.protect {
            return true;
        }
        self.snapshot_within(start, end)
    }

    /// Whether any snapshot lies in `[start, end)`
    fn snapshot_within(&mut self, start: u64, end: u64) -> bool {
        let snapshots = self.snapshots;
        let (Some(&first), Some(&last)) = (snapshots.first(), snapshots.last()) else {
            return false;
        };
        if start > last || end <= first {
            return false;
        }
        if let Some(&hit) = snapshots.get(self.last_hit) {
            if start <= hit && hit < end {
                return true;
            }
        }
        let low = snapshots.partition_point(|&ss| ss < start);
        match snapshots.get(low) {
            Some(&ss) if ss < end => {
                self.last_hit = low;
                true
            }
            _ => false,
        }
    }
}

pub fn bdesc_is_live(bdesc: &BlockDesc) -> bool {
    bdesc.blocknr == bdesc.oblocknr
}

/// What the dead virtual blocks free up
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Tossed {
    /// Merged checkpoint ranges no surviving block needs
    pub periods: Vec<Period>,
    pub vblocknrs: Vec<u64>,
}

/// Drop dead virtual blocks and collect what they free
///
/// Survivors end up sorted by physical block number.
pub fn toss_vdescs(
    vdescs: &mut Vec<VirtualBlockDesc>,
    classifier: &mut LivenessClassifier<'_>,
) -> Tossed {
    let mut tossed = Tossed::default();
    vdescs.retain(|vdesc| {
        if classifier.vdesc_is_live(vdesc) {
            return true;
        }
        tossed.vblocknrs.push(vdesc.vblocknr);
        if vdesc.cno != 0 {
            tossed.periods.push(vdesc.period);
        }
        false
    });
    unify_periods(&mut tossed.periods);
    vdescs.sort_unstable_by_key(|v| v.blocknr);
    tossed
}

/// Drop DAT blocks that have been rewritten elsewhere, returning how many
pub fn toss_bdescs(bdescs: &mut Vec<BlockDesc>) -> usize {
    let before = bdescs.len();
    bdescs.retain(bdesc_is_live);
    before - bdescs.len()
}

/// Sort periods and merge the ones that overlap or touch
pub fn unify_periods(periods: &mut Vec<Period>) {
    periods.sort_unstable();
    periods.dedup_by(|next, base| {
        if base.end >= next.start {
            base.end = base.end.max(next.end);
            true
        } else {
            false
        }
    });
}
