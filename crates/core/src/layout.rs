//! On-disk layout: constants, segment geometry and fixed-size records
//!
//! All multi-byte fields are little-endian. Parsers return `None` when the
//! input is too short so callers can treat truncation as end of log.

use crate::checksum::crc32_le;
use crate::error::ControlError;
use std::cmp::Ordering;
use std::ops::Range;

/// Magic number of a segment summary
pub const SEGSUM_MAGIC: u32 = 0x1eaf_fa11;
/// Magic number of the superblock
pub const SUPER_MAGIC: u16 = 0x3434;
/// Byte offset of the primary superblock on the device
pub const SB_OFFSET_BYTES: u64 = 1024;
/// Bytes read when loading the superblock
pub const SB_READ_BYTES: usize = 1024;

/// Smallest partial segment: one summary block plus one payload block
pub const PSEG_MIN_BLOCKS: u32 = 2;
/// Minimum number of segments reserved for the filesystem itself
pub const MIN_RESERVED_SEGMENTS: u64 = 8;

/// "Still in use by the latest checkpoint", also "no protection bound"
pub const CNO_MAX: u64 = u64::MAX;
/// Lowest checkpoint number ever assigned
pub const CNO_MIN: u64 = 1;

/// Summary header without the checkpoint number field
pub const SUMMARY_V1_BYTES: usize = 56;
/// Current summary header
pub const SUMMARY_BYTES: usize = 64;
/// File record header
pub const FINFO_BYTES: usize = 24;

/// Reserved inode numbers
pub mod ino {
    pub const ROOT: u64 = 2;
    /// Address-translation (DAT) file
    pub const DAT: u64 = 3;
    pub const CPFILE: u64 = 4;
    pub const SUFILE: u64 = 5;
    pub const IFILE: u64 = 6;
}

pub(crate) fn read_u16(buf: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_le_bytes(buf.get(off..off + 2)?.try_into().ok()?))
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_le_bytes(buf.get(off..off + 4)?.try_into().ok()?))
}

pub(crate) fn read_u64(buf: &[u8], off: usize) -> Option<u64> {
    Some(u64::from_le_bytes(buf.get(off..off + 8)?.try_into().ok()?))
}

/// Compare two segment sequence numbers, tolerating wraparound
pub fn seq_cmp(a: u64, b: u64) -> Ordering {
    (a.wrapping_sub(b) as i64).cmp(&0)
}

/// Filesystem geometry needed to locate and decode segments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u32,
    pub blocks_per_segment: u32,
    /// First block of segment 0 (blocks before it hold the superblock)
    pub first_data_block: u64,
    pub nsegments: u64,
    pub crc_seed: u32,
    pub r_segments_percentage: u32,
}

impl Geometry {
    /// First block number of `segnum`
    pub fn segment_start(&self, segnum: u64) -> u64 {
        let start = segnum * u64::from(self.blocks_per_segment);
        if segnum == 0 {
            start.max(self.first_data_block)
        } else {
            start
        }
    }

    /// Block numbers covered by `segnum`
    pub fn segment_range(&self, segnum: u64) -> Range<u64> {
        self.segment_start(segnum)..(segnum + 1) * u64::from(self.blocks_per_segment)
    }

    /// Number of usable blocks in `segnum`
    pub fn segment_blocks(&self, segnum: u64) -> u32 {
        let range = self.segment_range(segnum);
        (range.end - range.start) as u32
    }

    /// Segments the filesystem keeps back for its own use
    pub fn reserved_segments(&self) -> u64 {
        let pct = (self.nsegments * u64::from(self.r_segments_percentage)).div_ceil(100);
        pct.max(MIN_RESERVED_SEGMENTS)
    }

    pub fn contains_segment(&self, segnum: u64) -> bool {
        segnum < self.nsegments
    }
}

/// Fields of the primary superblock the cleaner cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub rev_level: u32,
    pub minor_rev_level: u16,
    pub bytes: u16,
    pub crc_seed: u32,
    pub sum: u32,
    pub log_block_size: u32,
    pub nsegments: u64,
    pub dev_size: u64,
    pub first_data_block: u64,
    pub blocks_per_segment: u32,
    pub r_segments_percentage: u32,
    pub last_cno: u64,
}

impl Superblock {
    /// Parse and verify a superblock read from `SB_OFFSET_BYTES`
    pub fn parse(buf: &[u8]) -> Result<Self, ControlError> {
        let bad = |what: &str| ControlError::InvalidArgument(format!("superblock: {what}"));

        let magic = read_u16(buf, 6).ok_or_else(|| bad("truncated"))?;
        if magic != SUPER_MAGIC {
            return Err(bad("bad magic"));
        }

        let field32 = |off| read_u32(buf, off).ok_or_else(|| bad("truncated"));
        let field64 = |off| read_u64(buf, off).ok_or_else(|| bad("truncated"));

        let sb = Self {
            rev_level: field32(0)?,
            minor_rev_level: read_u16(buf, 4).ok_or_else(|| bad("truncated"))?,
            bytes: read_u16(buf, 8).ok_or_else(|| bad("truncated"))?,
            crc_seed: field32(12)?,
            sum: field32(16)?,
            log_block_size: field32(20)?,
            nsegments: field64(24)?,
            dev_size: field64(32)?,
            first_data_block: field64(40)?,
            blocks_per_segment: field32(48)?,
            r_segments_percentage: field32(52)?,
            last_cno: field64(56)?,
        };

        let len = usize::from(sb.bytes);
        if len < 64 || len > buf.len() {
            return Err(bad("bad size"));
        }
        let mut copy = buf[..len].to_vec();
        copy[16..20].fill(0);
        if crc32_le(sb.crc_seed, &copy) != sb.sum {
            return Err(bad("checksum mismatch"));
        }
        if sb.log_block_size > 6 || sb.blocks_per_segment < PSEG_MIN_BLOCKS {
            return Err(bad("bad geometry"));
        }
        // Segment 0 must keep room for at least one partial segment
        if sb.first_data_block.saturating_add(u64::from(PSEG_MIN_BLOCKS)) > u64::from(sb.blocks_per_segment) {
            return Err(bad("first data block past segment 0"));
        }
        Ok(sb)
    }

    pub fn block_size(&self) -> u32 {
        1 << (10 + self.log_block_size)
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            block_size: self.block_size(),
            blocks_per_segment: self.blocks_per_segment,
            first_data_block: self.first_data_block,
            nsegments: self.nsegments,
            crc_seed: self.crc_seed,
            r_segments_percentage: self.r_segments_percentage,
        }
    }
}

/// Header of one partial segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentSummary {
    pub datasum: u32,
    pub sumsum: u32,
    pub magic: u32,
    /// Size of this header (56 or 64)
    pub bytes: u16,
    pub flags: u16,
    pub seq: u64,
    pub create: u64,
    pub next: u64,
    pub nblocks: u32,
    pub nfinfo: u32,
    /// Size of the whole summary area including file and block records
    pub sumbytes: u32,
    /// Checkpoint number, zero for old-format summaries
    pub cno: u64,
}

impl SegmentSummary {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let bytes = read_u16(buf, 12)?;
        let cno = if usize::from(bytes) >= SUMMARY_BYTES {
            read_u64(buf, 56)?
        } else {
            0
        };
        Some(Self {
            datasum: read_u32(buf, 0)?,
            sumsum: read_u32(buf, 4)?,
            magic: read_u32(buf, 8)?,
            bytes,
            flags: read_u16(buf, 14)?,
            seq: read_u64(buf, 16)?,
            create: read_u64(buf, 24)?,
            next: read_u64(buf, 32)?,
            nblocks: read_u32(buf, 40)?,
            nfinfo: read_u32(buf, 44)?,
            sumbytes: read_u32(buf, 48)?,
            cno,
        })
    }

    pub fn encode(&self) -> [u8; SUMMARY_BYTES] {
        let mut out = [0u8; SUMMARY_BYTES];
        out[0..4].copy_from_slice(&self.datasum.to_le_bytes());
        out[4..8].copy_from_slice(&self.sumsum.to_le_bytes());
        out[8..12].copy_from_slice(&self.magic.to_le_bytes());
        out[12..14].copy_from_slice(&self.bytes.to_le_bytes());
        out[14..16].copy_from_slice(&self.flags.to_le_bytes());
        out[16..24].copy_from_slice(&self.seq.to_le_bytes());
        out[24..32].copy_from_slice(&self.create.to_le_bytes());
        out[32..40].copy_from_slice(&self.next.to_le_bytes());
        out[40..44].copy_from_slice(&self.nblocks.to_le_bytes());
        out[44..48].copy_from_slice(&self.nfinfo.to_le_bytes());
        out[48..52].copy_from_slice(&self.sumbytes.to_le_bytes());
        out[56..64].copy_from_slice(&self.cno.to_le_bytes());
        out
    }

    /// Header length actually used by this summary
    pub fn header_len(&self) -> usize {
        usize::from(self.bytes)
    }
}

/// Header of one file record within a summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileInfo {
    pub ino: u64,
    /// Owning checkpoint, zero for checkpoint-less metadata files
    pub cno: u64,
    pub nblocks: u32,
    /// Leading data blocks; the rest are b-tree node blocks
    pub ndatablk: u32,
}

impl FileInfo {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        Some(Self {
            ino: read_u64(buf, 0)?,
            cno: read_u64(buf, 8)?,
            nblocks: read_u32(buf, 16)?,
            ndatablk: read_u32(buf, 20)?,
        })
    }

    pub fn encode(&self) -> [u8; FINFO_BYTES] {
        let mut out = [0u8; FINFO_BYTES];
        out[0..8].copy_from_slice(&self.ino.to_le_bytes());
        out[8..16].copy_from_slice(&self.cno.to_le_bytes());
        out[16..20].copy_from_slice(&self.nblocks.to_le_bytes());
        out[20..24].copy_from_slice(&self.ndatablk.to_le_bytes());
        out
    }

    pub fn is_dat(&self) -> bool {
        self.ino == ino::DAT
    }

    pub fn nnodeblk(&self) -> u32 {
        self.nblocks.saturating_sub(self.ndatablk)
    }
}

/// One block record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockInfo {
    /// Regular file data block
    Data { vblocknr: u64, blkoff: u64 },
    /// Regular file b-tree node block
    Node { vblocknr: u64 },
    /// DAT data block, addressed directly
    DatData { blkoff: u64 },
    /// DAT b-tree node block
    DatNode { blkoff: u64, level: u8 },
}

impl BlockInfo {
    /// Encoded size of a record of this shape
    pub const fn record_len(dat: bool, data: bool) -> usize {
        match (dat, data) {
            (false, true) => 16,
            (false, false) => 8,
            (true, true) => 8,
            (true, false) => 16,
        }
    }

    pub(crate) fn parse(buf: &[u8], dat: bool, data: bool) -> Option<Self> {
        Some(match (dat, data) {
            (false, true) => Self::Data {
                vblocknr: read_u64(buf, 0)?,
                blkoff: read_u64(buf, 8)?,
            },
            (false, false) => Self::Node {
                vblocknr: read_u64(buf, 0)?,
            },
            (true, true) => Self::DatData {
                blkoff: read_u64(buf, 0)?,
            },
            (true, false) => Self::DatNode {
                blkoff: read_u64(buf, 0)?,
                level: *buf.get(8)?,
            },
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        match *self {
            Self::Data { vblocknr, blkoff } => {
                out.extend_from_slice(&vblocknr.to_le_bytes());
                out.extend_from_slice(&blkoff.to_le_bytes());
            }
            Self::Node { vblocknr } => out.extend_from_slice(&vblocknr.to_le_bytes()),
            Self::DatData { blkoff } => out.extend_from_slice(&blkoff.to_le_bytes()),
            Self::DatNode { blkoff, level } => {
                out.extend_from_slice(&blkoff.to_le_bytes());
                out.push(level);
                out.extend_from_slice(&[0u8; 7]);
            }
        }
        out
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data { .. } | Self::DatData { .. })
    }
}
