//! Segment log decoder
//!
//! A segment holds a chain of partial segments. Each one starts with a
//! summary, followed by file records, each followed by its block records.
//! Records never straddle a block boundary: one that would not fit in the
//! rest of the current block starts at the next one.
//!
//! Decoding stops silently at the first partial segment that fails
//! validation. That is how the tail of a log cut short by a crash shows up,
//! so it is not an error.
//!
//! Every iterator exposes a `Copy` cursor and can be rebuilt from one, so a
//! walk can be suspended and resumed without holding on to the iterator.

use crate::checksum::crc32_le;
use crate::layout::{
    BlockInfo, FileInfo, Geometry, SegmentSummary, FINFO_BYTES, PSEG_MIN_BLOCKS, SEGSUM_MAGIC,
    SUMMARY_V1_BYTES,
};

/// One segment's bytes plus what is needed to decode them
#[derive(Debug, Clone, Copy)]
pub struct SegmentLog<'a> {
    buf: &'a [u8],
    /// Block number of the first block in `buf`
    start: u64,
    nblocks: u32,
    block_size: u32,
    crc_seed: u32,
}

impl<'a> SegmentLog<'a> {
    pub fn new(buf: &'a [u8], geometry: &Geometry, segnum: u64) -> Self {
        Self {
            buf,
            start: geometry.segment_start(segnum),
            nblocks: geometry.segment_blocks(segnum),
            block_size: geometry.block_size,
            crc_seed: geometry.crc_seed,
        }
    }

    pub fn partial_segments(&self) -> PartialSegments<'a> {
        self.resume(PsegCursor::default())
    }

    pub fn resume(&self, cursor: PsegCursor) -> PartialSegments<'a> {
        PartialSegments {
            log: *self,
            cursor,
            done: false,
        }
    }

    /// Sequence number of the first valid partial segment
    pub fn seq(&self) -> Option<u64> {
        self.partial_segments().next().map(|pseg| pseg.summary().seq)
    }

    fn validate(&self, cursor: PsegCursor) -> Option<PartialSegment<'a>> {
        let rest = self.nblocks.checked_sub(cursor.block)?;
        if rest < PSEG_MIN_BLOCKS {
            return None;
        }

        let bs = self.block_size as usize;
        let region = self.buf.get(cursor.block as usize * bs..)?;
        let summary = SegmentSummary::parse(region)?;

        if summary.magic != SEGSUM_MAGIC || summary.header_len() < SUMMARY_V1_BYTES {
            return None;
        }
        if summary.nblocks == 0 || summary.nblocks > rest {
            return None;
        }

        let sumbytes = summary.sumbytes as usize;
        if sumbytes < summary.header_len()
            || sumbytes > summary.nblocks as usize * bs
            || sumbytes > region.len()
        {
            return None;
        }
        if crc32_le(self.crc_seed, &region[8..sumbytes]) != summary.sumsum {
            return None;
        }
        // A different sequence number is left over from an earlier use of
        // this segment.
        if cursor.seq.is_some_and(|seq| seq != summary.seq) {
            return None;
        }

        Some(PartialSegment {
            summary,
            blocknr: self.start + u64::from(cursor.block),
            packing: Packing {
                bytes: &region[..sumbytes],
                block_size: bs,
            },
        })
    }
}

/// Resume point of a partial segment walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PsegCursor {
    /// Block offset of the next partial segment within the segment
    pub block: u32,
    /// Sequence number every following partial segment must carry
    pub seq: Option<u64>,
}

pub struct PartialSegments<'a> {
    log: SegmentLog<'a>,
    cursor: PsegCursor,
    done: bool,
}

impl<'a> PartialSegments<'a> {
    pub fn cursor(&self) -> PsegCursor {
        self.cursor
    }
}

impl<'a> Iterator for PartialSegments<'a> {
    type Item = PartialSegment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.log.validate(self.cursor) {
            Some(pseg) => {
                self.cursor.block += pseg.summary.nblocks;
                self.cursor.seq.get_or_insert(pseg.summary.seq);
                Some(pseg)
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// Summary bytes of one partial segment and the record packing rule
#[derive(Debug, Clone, Copy)]
struct Packing<'a> {
    bytes: &'a [u8],
    block_size: usize,
}

impl<'a> Packing<'a> {
    /// Where a record of `len` bytes at `offset` actually starts, or `None`
    /// if it would run past the summary.
    fn place(&self, offset: usize, len: usize) -> Option<usize> {
        let rest = self.block_size - offset % self.block_size;
        let at = if len > rest { offset + rest } else { offset };
        (at + len <= self.bytes.len()).then_some(at)
    }

    fn record(&self, at: usize) -> &'a [u8] {
        &self.bytes[at..]
    }
}

/// One validated partial segment
#[derive(Debug, Clone, Copy)]
pub struct PartialSegment<'a> {
    summary: SegmentSummary,
    blocknr: u64,
    packing: Packing<'a>,
}

impl<'a> PartialSegment<'a> {
    pub fn summary(&self) -> &SegmentSummary {
        &self.summary
    }

    /// Block number of the summary's first block
    pub fn blocknr(&self) -> u64 {
        self.blocknr
    }

    pub fn nblocks(&self) -> u32 {
        self.summary.nblocks
    }

    /// Blocks taken by the summary before the first payload block
    pub fn summary_blocks(&self) -> u32 {
        self.summary.sumbytes.div_ceil(self.packing.block_size as u32)
    }

    pub fn files(&self) -> FileRecords<'a> {
        self.resume_files(FileCursor {
            offset: self.summary.header_len(),
            remaining: self.summary.nfinfo,
            blocknr: self.blocknr + u64::from(self.summary_blocks()),
        })
    }

    pub fn resume_files(&self, cursor: FileCursor) -> FileRecords<'a> {
        FileRecords {
            packing: self.packing,
            end_blocknr: self.blocknr + u64::from(self.summary.nblocks),
            cursor,
            done: false,
        }
    }
}

/// Resume point of a file record walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileCursor {
    pub offset: usize,
    pub remaining: u32,
    /// Block number of the next file's first payload block
    pub blocknr: u64,
}

pub struct FileRecords<'a> {
    packing: Packing<'a>,
    end_blocknr: u64,
    cursor: FileCursor,
    done: bool,
}

impl<'a> FileRecords<'a> {
    pub fn cursor(&self) -> FileCursor {
        self.cursor
    }

    fn decode(&mut self) -> Option<FileRecord<'a>> {
        let at = self.packing.place(self.cursor.offset, FINFO_BYTES)?;
        let info = FileInfo::parse(self.packing.record(at))?;
        if info.ndatablk > info.nblocks
            || self.cursor.blocknr + u64::from(info.nblocks) > self.end_blocknr
        {
            return None;
        }
        Some(FileRecord {
            info,
            packing: self.packing,
            offset: at + FINFO_BYTES,
            blocknr: self.cursor.blocknr,
        })
    }
}

impl<'a> Iterator for FileRecords<'a> {
    type Item = FileRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.cursor.remaining == 0 {
            return None;
        }
        let Some(file) = self.decode() else {
            self.done = true;
            return None;
        };

        match file.records_end() {
            Some(end) => {
                self.cursor = FileCursor {
                    offset: end,
                    remaining: self.cursor.remaining - 1,
                    blocknr: file.blocknr + u64::from(file.info.nblocks),
                };
            }
            // Block records run past the summary; nothing after them can
            // be located.
            None => self.done = true,
        }
        Some(file)
    }
}

/// One file record and access to its block records
#[derive(Debug, Clone, Copy)]
pub struct FileRecord<'a> {
    info: FileInfo,
    packing: Packing<'a>,
    offset: usize,
    blocknr: u64,
}

impl<'a> FileRecord<'a> {
    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    /// Block number of this file's first payload block
    pub fn blocknr(&self) -> u64 {
        self.blocknr
    }

    pub fn is_dat(&self) -> bool {
        self.info.is_dat()
    }

    pub fn blocks(&self) -> Blocks<'a> {
        self.resume_blocks(BlockCursor {
            offset: self.offset,
            remaining_data: self.info.ndatablk,
            remaining_node: self.info.nnodeblk(),
            blocknr: self.blocknr,
        })
    }

    pub fn resume_blocks(&self, cursor: BlockCursor) -> Blocks<'a> {
        Blocks {
            packing: self.packing,
            dat: self.is_dat(),
            cursor,
            done: false,
        }
    }

    fn records_end(&self) -> Option<usize> {
        let dat = self.is_dat();
        let mut offset = self.offset;
        for (count, data) in [(self.info.ndatablk, true), (self.info.nnodeblk(), false)] {
            let len = BlockInfo::record_len(dat, data);
            for _ in 0..count {
                offset = self.packing.place(offset, len)? + len;
            }
        }
        Some(offset)
    }
}

/// Resume point of a block record walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCursor {
    pub offset: usize,
    pub remaining_data: u32,
    pub remaining_node: u32,
    pub blocknr: u64,
}

/// A block record paired with the physical block it describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub blocknr: u64,
    pub info: BlockInfo,
}

pub struct Blocks<'a> {
    packing: Packing<'a>,
    dat: bool,
    cursor: BlockCursor,
    done: bool,
}

impl<'a> Blocks<'a> {
    pub fn cursor(&self) -> BlockCursor {
        self.cursor
    }
}

impl<'a> Iterator for Blocks<'a> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.done {
            return None;
        }
        let data = if self.cursor.remaining_data > 0 {
            true
        } else if self.cursor.remaining_node > 0 {
            false
        } else {
            return None;
        };

        let len = BlockInfo::record_len(self.dat, data);
        let placed = self.packing.place(self.cursor.offset, len).and_then(|at| {
            let info = BlockInfo::parse(self.packing.record(at), self.dat, data)?;
            Some((at, info))
        });
        let Some((at, info)) = placed else {
            self.done = true;
            return None;
        };

        if data {
            self.cursor.remaining_data -= 1;
        } else {
            self.cursor.remaining_node -= 1;
        }
        self.cursor.offset = at + len;
        let blocknr = self.cursor.blocknr;
        self.cursor.blocknr += 1;

        Some(Block { blocknr, info })
    }
}
