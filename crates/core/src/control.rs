//! Kernel control interface used by the cleaner
//!
//! `FsControl` is the only way the cleaner talks to a mounted filesystem.
//! Batch calls return at most `max` entries; an empty result means the
//! range is exhausted.

use crate::error::ControlError;
use crate::layout::Geometry;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::path::PathBuf;

/// Raw bytes of one segment, released on drop
pub enum SegmentBuf {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for SegmentBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => map,
            Self::Owned(bytes) => bytes,
        }
    }
}

pub const SUINFO_ACTIVE: u32 = 1 << 0;
pub const SUINFO_DIRTY: u32 = 1 << 1;
pub const SUINFO_ERROR: u32 = 1 << 2;

/// Usage record of one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentUsage {
    pub segnum: u64,
    /// Last modification time (seconds since the epoch)
    pub lastmod: u64,
    pub nblocks: u32,
    pub flags: u32,
}

impl SegmentUsage {
    pub fn is_active(&self) -> bool {
        self.flags & SUINFO_ACTIVE != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.flags & SUINFO_DIRTY != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & SUINFO_ERROR != 0
    }

    pub fn is_clean(&self) -> bool {
        self.flags == 0
    }

    /// Dirty, not being written and not marked bad
    pub fn is_reclaimable(&self) -> bool {
        self.is_dirty() && !self.is_active() && !self.is_error()
    }
}

/// Filesystem-wide segment usage counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageStat {
    pub nsegs: u64,
    pub ncleansegs: u64,
    pub ndirtysegs: u64,
    pub ctime: u64,
    /// Last time a non-cleaner write was committed
    pub nongc_ctime: u64,
    /// Segments with a sequence number at or past this may still be written
    pub prot_seq: u64,
}

pub const CPINFO_SNAPSHOT: u32 = 1 << 0;
pub const CPINFO_INVALID: u32 = 1 << 1;
pub const CPINFO_SKETCH: u32 = 1 << 2;
pub const CPINFO_MINOR: u32 = 1 << 3;

/// Selects which checkpoints a `checkpoint_info` scan walks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpMode {
    /// Every valid checkpoint, ascending from the start number
    Checkpoint,
    /// Snapshots only, following each entry's `next` link
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointInfo {
    pub flags: u32,
    pub cno: u64,
    /// Creation time (seconds since the epoch)
    pub create: u64,
    pub nblk_inc: u64,
    pub inodes_count: u64,
    pub blocks_count: u64,
    /// Next snapshot in snapshot mode, zero at the end of the list
    pub next: u64,
}

impl CheckpointInfo {
    pub fn is_snapshot(&self) -> bool {
        self.flags & CPINFO_SNAPSHOT != 0
    }

    pub fn is_valid(&self) -> bool {
        self.flags & CPINFO_INVALID == 0
    }

    pub fn is_minor(&self) -> bool {
        self.flags & CPINFO_MINOR != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointStat {
    /// Number the next checkpoint will receive
    pub cno: u64,
    pub ncps: u64,
    pub nsss: u64,
}

/// Half-open checkpoint range `[start, end)` during which a block is in use
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Period {
    pub start: u64,
    pub end: u64,
}

/// Kernel answer for one virtual block number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VirtualBlockInfo {
    pub vblocknr: u64,
    pub start: u64,
    pub end: u64,
    pub blocknr: u64,
}

pub const VDESC_DATA: u32 = 0;
pub const VDESC_NODE: u32 = 1;

/// A block reached through virtual address translation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VirtualBlockDesc {
    pub ino: u64,
    /// Checkpoint that wrote the block, zero for metadata files
    pub cno: u64,
    pub vblocknr: u64,
    pub period: Period,
    /// Physical block holding the data in the segment being cleaned
    pub blocknr: u64,
    pub offset: u64,
    pub flags: u32,
}

impl VirtualBlockDesc {
    pub fn is_node(&self) -> bool {
        self.flags == VDESC_NODE
    }
}

/// A block of the DAT file, addressed physically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockDesc {
    pub ino: u64,
    /// Physical block as written in the log
    pub oblocknr: u64,
    /// Physical block currently mapped at (offset, level)
    pub blocknr: u64,
    pub offset: u64,
    pub level: u32,
}

/// One atomic clean-segments transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanRequest {
    /// Live blocks to move, sorted by physical block number
    pub vdescs: Vec<VirtualBlockDesc>,
    /// Checkpoint ranges whose checkpoints can be deleted
    pub periods: Vec<Period>,
    /// Virtual block numbers to free
    pub vblocknrs: Vec<u64>,
    /// Live DAT blocks to move
    pub bdescs: Vec<BlockDesc>,
    pub segnums: Vec<u64>,
}

/// Control operations against one mounted filesystem
pub trait FsControl: Send + Sync {
    fn geometry(&self) -> &Geometry;

    /// Map or read the whole of `segnum`
    fn read_segment(&self, segnum: u64) -> Result<SegmentBuf, ControlError>;

    /// Usage of consecutive segments starting at `start`
    fn segment_usage(&self, start: u64, max: usize) -> Result<Vec<SegmentUsage>, ControlError>;

    fn usage_stat(&self) -> Result<UsageStat, ControlError>;

    /// Stamp `lastmod` on each segment; `Unsupported` on older kernels
    fn set_segment_lastmod(&self, segnums: &[u64], lastmod: u64) -> Result<(), ControlError>;

    fn checkpoint_info(
        &self,
        start: u64,
        mode: CpMode,
        max: usize,
    ) -> Result<Vec<CheckpointInfo>, ControlError>;

    fn checkpoint_stat(&self) -> Result<CheckpointStat, ControlError>;

    /// Look up periods and current locations of virtual blocks
    fn virtual_block_info(&self, vblocknrs: &[u64]) -> Result<Vec<VirtualBlockInfo>, ControlError>;

    /// Fill `blocknr` of each descriptor from its (offset, level)
    fn block_descriptors(&self, bdescs: &mut [BlockDesc]) -> Result<(), ControlError>;

    fn clean_segments(&self, request: &CleanRequest) -> Result<(), ControlError>;

    /// Flush and return the latest checkpoint number
    fn sync(&self) -> Result<u64, ControlError>;

    fn resize(&self, size: u64) -> Result<(), ControlError>;

    fn set_alloc_range(&self, start: u64, end: u64) -> Result<(), ControlError>;

    fn freeze(&self) -> Result<(), ControlError>;

    fn thaw(&self) -> Result<(), ControlError>;

    /// Lock file shared by every cleaner of this filesystem
    fn cleaner_lock_path(&self) -> PathBuf;
}
