//! In-memory filesystem and segment encoder for tests and benches
//!
//! `SimFs` answers every `FsControl` call from plain maps and records what
//! the cleaner asked of it, so tests can assert on kernel traffic.

use crate::checksum::crc32_le;
use crate::control::{
    BlockDesc, CheckpointInfo, CheckpointStat, CleanRequest, CpMode, FsControl, Period,
    SegmentBuf, SegmentUsage, UsageStat, VirtualBlockInfo, CPINFO_SNAPSHOT, SUINFO_DIRTY,
};
use crate::decoder::SegmentLog;
use crate::error::ControlError;
use crate::layout::{
    ino, BlockInfo, FileInfo, Geometry, SegmentSummary, CNO_MAX, PSEG_MIN_BLOCKS, SEGSUM_MAGIC,
    SUMMARY_BYTES,
};
use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

/// One file record to encode
#[derive(Debug, Clone)]
pub struct FileSpec {
    pub ino: u64,
    pub cno: u64,
    pub data: Vec<BlockInfo>,
    pub nodes: Vec<BlockInfo>,
    /// Period registered for every virtual block of this file
    pub period: Option<Period>,
    /// DAT blocks only: whether the DAT now maps the blocks elsewhere
    pub superseded: bool,
}

impl FileSpec {
    /// Regular file with `(vblocknr, blkoff)` data blocks and node blocks
    pub fn regular(
        ino: u64,
        cno: u64,
        data: impl IntoIterator<Item = (u64, u64)>,
        nodes: impl IntoIterator<Item = u64>,
    ) -> Self {
        Self {
            ino,
            cno,
            data: data
                .into_iter()
                .map(|(vblocknr, blkoff)| BlockInfo::Data { vblocknr, blkoff })
                .collect(),
            nodes: nodes
                .into_iter()
                .map(|vblocknr| BlockInfo::Node { vblocknr })
                .collect(),
            period: None,
            superseded: false,
        }
    }

    /// DAT file with direct data offsets and `(blkoff, level)` node blocks
    pub fn dat(
        data: impl IntoIterator<Item = u64>,
        nodes: impl IntoIterator<Item = (u64, u8)>,
    ) -> Self {
        Self {
            ino: ino::DAT,
            cno: 0,
            data: data
                .into_iter()
                .map(|blkoff| BlockInfo::DatData { blkoff })
                .collect(),
            nodes: nodes
                .into_iter()
                .map(|(blkoff, level)| BlockInfo::DatNode { blkoff, level })
                .collect(),
            period: None,
            superseded: false,
        }
    }

    pub fn with_period(mut self, start: u64, end: u64) -> Self {
        self.period = Some(Period { start, end });
        self
    }

    pub fn superseded(mut self) -> Self {
        self.superseded = true;
        self
    }

    fn nblocks(&self) -> u32 {
        (self.data.len() + self.nodes.len()) as u32
    }
}

/// One partial segment to encode
#[derive(Debug, Clone)]
pub struct PartialSpec {
    pub seq: u64,
    pub create: u64,
    pub cno: u64,
    pub files: Vec<FileSpec>,
}

/// Append `record` to a summary, moving to the next block if it would
/// straddle a boundary.
fn push_record(summary: &mut Vec<u8>, record: &[u8], block_size: usize) {
    let rest = block_size - summary.len() % block_size;
    if record.len() > rest {
        summary.resize(summary.len() + rest, 0);
    }
    summary.extend_from_slice(record);
}

/// Encode one partial segment, summary and payload blocks included
pub fn encode_partial(geometry: &Geometry, partial: &PartialSpec) -> Vec<u8> {
    let bs = geometry.block_size as usize;
    let mut summary = vec![0u8; SUMMARY_BYTES];
    for file in &partial.files {
        let info = FileInfo {
            ino: file.ino,
            cno: file.cno,
            nblocks: file.nblocks(),
            ndatablk: file.data.len() as u32,
        };
        push_record(&mut summary, &info.encode(), bs);
        for block in file.data.iter().chain(&file.nodes) {
            push_record(&mut summary, &block.encode(), bs);
        }
    }

    let sumbytes = summary.len();
    let payload: u32 = partial.files.iter().map(FileSpec::nblocks).sum();
    let nblocks = (sumbytes.div_ceil(bs) as u32 + payload).max(PSEG_MIN_BLOCKS);

    let header = SegmentSummary {
        magic: SEGSUM_MAGIC,
        bytes: SUMMARY_BYTES as u16,
        seq: partial.seq,
        create: partial.create,
        nblocks,
        nfinfo: partial.files.len() as u32,
        sumbytes: sumbytes as u32,
        cno: partial.cno,
        ..Default::default()
    };

    let mut image = vec![0u8; nblocks as usize * bs];
    image[..sumbytes].copy_from_slice(&summary);
    image[..SUMMARY_BYTES].copy_from_slice(&header.encode());
    let sumsum = crc32_le(geometry.crc_seed, &image[8..sumbytes]);
    image[4..8].copy_from_slice(&sumsum.to_le_bytes());
    let datasum = crc32_le(geometry.crc_seed, &image[4..]);
    image[0..4].copy_from_slice(&datasum.to_le_bytes());
    image
}

/// Encode a whole segment; unused trailing blocks stay zeroed
pub fn encode_segment(geometry: &Geometry, segnum: u64, psegs: &[PartialSpec]) -> Vec<u8> {
    let bs = geometry.block_size as usize;
    let mut buf = vec![0u8; geometry.segment_blocks(segnum) as usize * bs];
    let mut offset = 0;
    for partial in psegs {
        let image = encode_partial(geometry, partial);
        assert!(
            offset + image.len() <= buf.len(),
            "partial segments overflow segment {segnum}"
        );
        buf[offset..offset + image.len()].copy_from_slice(&image);
        offset += image.len();
    }
    buf
}

/// Number of calls made to each control operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub read_segment: u64,
    pub segment_usage: u64,
    pub set_segment_lastmod: u64,
    pub checkpoint_info: u64,
    pub virtual_block_info: u64,
    pub block_descriptors: u64,
    pub clean_segments: u64,
}

struct SimState {
    segments: Vec<Option<Vec<u8>>>,
    usage: Vec<SegmentUsage>,
    checkpoints: BTreeMap<u64, CheckpointInfo>,
    vblocks: AHashMap<u64, VirtualBlockInfo>,
    dat_blocks: AHashMap<(u64, u32), u64>,
    /// DAT blocks whose lookup fails outright
    unresolvable_dat: AHashSet<(u64, u32)>,
    ctime: u64,
    nongc_ctime: u64,
    prot_seq: u64,
    set_suinfo_supported: bool,
    clean_failures: VecDeque<ControlError>,
    cleaned: Vec<CleanRequest>,
    calls: CallCounts,
    frozen: bool,
    size: u64,
    alloc_range: (u64, u64),
}

/// In-memory stand-in for a mounted filesystem
pub struct SimFs {
    geometry: Geometry,
    lock_path: PathBuf,
    state: Mutex<SimState>,
}

impl SimFs {
    /// Create a filesystem whose segments are all clean
    pub fn new(geometry: Geometry, lock_path: PathBuf) -> Self {
        let usage = (0..geometry.nsegments)
            .map(|segnum| SegmentUsage {
                segnum,
                ..Default::default()
            })
            .collect();
        let size =
            geometry.nsegments * u64::from(geometry.blocks_per_segment) * u64::from(geometry.block_size);
        Self {
            geometry,
            lock_path,
            state: Mutex::new(SimState {
                segments: vec![None; geometry.nsegments as usize],
                usage,
                checkpoints: BTreeMap::new(),
                vblocks: AHashMap::new(),
                dat_blocks: AHashMap::new(),
                unresolvable_dat: AHashSet::new(),
                ctime: 0,
                nongc_ctime: 0,
                prot_seq: u64::MAX / 2,
                set_suinfo_supported: true,
                clean_failures: VecDeque::new(),
                cleaned: Vec::new(),
                calls: CallCounts::default(),
                frozen: false,
                size,
                alloc_range: (0, geometry.nsegments),
            }),
        }
    }

    /// Store a segment image, mark it dirty and register its blocks
    ///
    /// Virtual blocks get the file's period, or `[cno, CNO_MAX)` when none
    /// is set. DAT blocks map to where they were written unless the file is
    /// marked superseded.
    pub fn write_segment(&self, segnum: u64, lastmod: u64, psegs: &[PartialSpec]) {
        let image = encode_segment(&self.geometry, segnum, psegs);
        let log = SegmentLog::new(&image, &self.geometry, segnum);

        let mut state = self.state.lock();
        let mut nblocks = 0;
        for (pseg, partial) in log.partial_segments().zip(psegs) {
            nblocks += pseg.nblocks();
            for (file, fspec) in pseg.files().zip(&partial.files) {
                for block in file.blocks() {
                    match block.info {
                        BlockInfo::Data { vblocknr, .. } | BlockInfo::Node { vblocknr } => {
                            let period = fspec.period.unwrap_or(Period {
                                start: fspec.cno,
                                end: CNO_MAX,
                            });
                            state.vblocks.insert(
                                vblocknr,
                                VirtualBlockInfo {
                                    vblocknr,
                                    start: period.start,
                                    end: period.end,
                                    blocknr: block.blocknr,
                                },
                            );
                        }
                        BlockInfo::DatData { blkoff } => {
                            let mapped = Self::dat_target(block.blocknr, fspec.superseded);
                            state.dat_blocks.insert((blkoff, 0), mapped);
                        }
                        BlockInfo::DatNode { blkoff, level } => {
                            let mapped = Self::dat_target(block.blocknr, fspec.superseded);
                            state.dat_blocks.insert((blkoff, u32::from(level)), mapped);
                        }
                    }
                }
            }
        }

        let index = segnum as usize;
        state.segments[index] = Some(image);
        state.usage[index] = SegmentUsage {
            segnum,
            lastmod,
            nblocks,
            flags: SUINFO_DIRTY,
        };
    }

    fn dat_target(blocknr: u64, superseded: bool) -> u64 {
        if superseded {
            blocknr + 1_000_000
        } else {
            blocknr
        }
    }

    pub fn add_checkpoint(&self, cno: u64, create: u64, snapshot: bool) {
        let mut state = self.state.lock();
        state.checkpoints.insert(
            cno,
            CheckpointInfo {
                flags: if snapshot { CPINFO_SNAPSHOT } else { 0 },
                cno,
                create,
                ..Default::default()
            },
        );
        Self::link_snapshots(&mut state.checkpoints);
    }

    fn link_snapshots(checkpoints: &mut BTreeMap<u64, CheckpointInfo>) {
        let snapshots: Vec<u64> = checkpoints
            .values()
            .filter(|cp| cp.is_snapshot())
            .map(|cp| cp.cno)
            .collect();
        for (i, cno) in snapshots.iter().enumerate() {
            let next = snapshots.get(i + 1).copied().unwrap_or(0);
            if let Some(cp) = checkpoints.get_mut(cno) {
                cp.next = next;
            }
        }
    }

    pub fn set_vblock(&self, info: VirtualBlockInfo) {
        self.state.lock().vblocks.insert(info.vblocknr, info);
    }

    pub fn set_prot_seq(&self, seq: u64) {
        self.state.lock().prot_seq = seq;
    }

    pub fn set_nongc_ctime(&self, ctime: u64) {
        self.state.lock().nongc_ctime = ctime;
    }

    pub fn set_segment_flags(&self, segnum: u64, flags: u32) {
        self.state.lock().usage[segnum as usize].flags = flags;
    }

    pub fn set_suinfo_supported(&self, supported: bool) {
        self.state.lock().set_suinfo_supported = supported;
    }

    /// Make any block-descriptor lookup that includes this DAT block fail
    /// with `NotFound`
    pub fn hide_dat_block(&self, offset: u64, level: u32) {
        self.state.lock().unresolvable_dat.insert((offset, level));
    }

    /// Make the next clean-segments call fail with `err`
    pub fn fail_next_clean(&self, err: ControlError) {
        self.state.lock().clean_failures.push_back(err);
    }

    pub fn cleaned(&self) -> Vec<CleanRequest> {
        self.state.lock().cleaned.clone()
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }

    pub fn usage_of(&self, segnum: u64) -> SegmentUsage {
        self.state.lock().usage[segnum as usize]
    }

    pub fn checkpoint_numbers(&self) -> Vec<u64> {
        self.state.lock().checkpoints.keys().copied().collect()
    }

    pub fn reclaimable_count(&self) -> usize {
        self.state
            .lock()
            .usage
            .iter()
            .filter(|u| u.is_reclaimable())
            .count()
    }

    pub fn is_frozen(&self) -> bool {
        self.state.lock().frozen
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn alloc_range(&self) -> (u64, u64) {
        self.state.lock().alloc_range
    }
}

impl FsControl for SimFs {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn read_segment(&self, segnum: u64) -> Result<SegmentBuf, ControlError> {
        if !self.geometry.contains_segment(segnum) {
            return Err(ControlError::NotFound);
        }
        let mut state = self.state.lock();
        state.calls.read_segment += 1;
        let bytes = state.segments[segnum as usize].clone().unwrap_or_else(|| {
            vec![0u8; self.geometry.segment_blocks(segnum) as usize * self.geometry.block_size as usize]
        });
        Ok(SegmentBuf::Owned(bytes))
    }

    fn segment_usage(&self, start: u64, max: usize) -> Result<Vec<SegmentUsage>, ControlError> {
        let mut state = self.state.lock();
        state.calls.segment_usage += 1;
        Ok(state
            .usage
            .iter()
            .skip(start as usize)
            .take(max)
            .copied()
            .collect())
    }

    fn usage_stat(&self) -> Result<UsageStat, ControlError> {
        let state = self.state.lock();
        Ok(UsageStat {
            nsegs: self.geometry.nsegments,
            ncleansegs: state.usage.iter().filter(|u| u.is_clean()).count() as u64,
            ndirtysegs: state.usage.iter().filter(|u| u.is_dirty()).count() as u64,
            ctime: state.ctime,
            nongc_ctime: state.nongc_ctime,
            prot_seq: state.prot_seq,
        })
    }

    fn set_segment_lastmod(&self, segnums: &[u64], lastmod: u64) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        state.calls.set_segment_lastmod += 1;
        if !state.set_suinfo_supported {
            return Err(ControlError::Unsupported);
        }
        for &segnum in segnums {
            let usage = state
                .usage
                .get_mut(segnum as usize)
                .ok_or(ControlError::NotFound)?;
            usage.lastmod = lastmod;
        }
        Ok(())
    }

    fn checkpoint_info(
        &self,
        start: u64,
        mode: CpMode,
        max: usize,
    ) -> Result<Vec<CheckpointInfo>, ControlError> {
        let mut state = self.state.lock();
        state.calls.checkpoint_info += 1;
        let found: Vec<CheckpointInfo> = match mode {
            CpMode::Checkpoint => state.checkpoints.range(start..).take(max).map(|(_, cp)| *cp).collect(),
            CpMode::Snapshot => state
                .checkpoints
                .range(start..)
                .map(|(_, cp)| *cp)
                .filter(CheckpointInfo::is_snapshot)
                .take(max)
                .collect(),
        };
        Ok(found)
    }

    fn checkpoint_stat(&self) -> Result<CheckpointStat, ControlError> {
        let state = self.state.lock();
        let last = state.checkpoints.keys().next_back().copied().unwrap_or(0);
        Ok(CheckpointStat {
            cno: last + 1,
            ncps: state.checkpoints.len() as u64,
            nsss: state.checkpoints.values().filter(|cp| cp.is_snapshot()).count() as u64,
        })
    }

    fn virtual_block_info(&self, vblocknrs: &[u64]) -> Result<Vec<VirtualBlockInfo>, ControlError> {
        let mut state = self.state.lock();
        state.calls.virtual_block_info += 1;
        vblocknrs
            .iter()
            .map(|vblocknr| state.vblocks.get(vblocknr).copied().ok_or(ControlError::NotFound))
            .collect()
    }

    fn block_descriptors(&self, bdescs: &mut [BlockDesc]) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        state.calls.block_descriptors += 1;
        if bdescs
            .iter()
            .any(|b| state.unresolvable_dat.contains(&(b.offset, b.level)))
        {
            return Err(ControlError::NotFound);
        }
        for bdesc in bdescs {
            bdesc.blocknr = state
                .dat_blocks
                .get(&(bdesc.offset, bdesc.level))
                .copied()
                .unwrap_or(0);
        }
        Ok(())
    }

    fn clean_segments(&self, request: &CleanRequest) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        state.calls.clean_segments += 1;
        if let Some(err) = state.clean_failures.pop_front() {
            return Err(err);
        }
        if let Some(&bad) = request.segnums.iter().find(|&&s| !self.geometry.contains_segment(s)) {
            return Err(ControlError::InvalidArgument(format!("segment {bad} out of range")));
        }

        for &segnum in &request.segnums {
            state.segments[segnum as usize] = None;
            state.usage[segnum as usize] = SegmentUsage {
                segnum,
                ..Default::default()
            };
        }
        for vblocknr in &request.vblocknrs {
            state.vblocks.remove(vblocknr);
        }
        // Checkpoints inside a freed period go away; snapshots stay.
        for period in &request.periods {
            let doomed: Vec<u64> = state
                .checkpoints
                .range(period.start..period.end)
                .filter(|(_, cp)| !cp.is_snapshot())
                .map(|(cno, _)| *cno)
                .collect();
            for cno in doomed {
                state.checkpoints.remove(&cno);
            }
        }
        state.cleaned.push(request.clone());
        Ok(())
    }

    fn sync(&self) -> Result<u64, ControlError> {
        let state = self.state.lock();
        Ok(state.checkpoints.keys().next_back().copied().unwrap_or(0))
    }

    fn resize(&self, size: u64) -> Result<(), ControlError> {
        let limit = self.geometry.nsegments
            * u64::from(self.geometry.blocks_per_segment)
            * u64::from(self.geometry.block_size);
        if size > limit {
            return Err(ControlError::NoSpace);
        }
        self.state.lock().size = size;
        Ok(())
    }

    fn set_alloc_range(&self, start: u64, end: u64) -> Result<(), ControlError> {
        if start > end || end > self.geometry.nsegments {
            return Err(ControlError::InvalidArgument(format!("bad range {start}..{end}")));
        }
        self.state.lock().alloc_range = (start, end);
        Ok(())
    }

    fn freeze(&self) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        if state.frozen {
            return Err(ControlError::Busy);
        }
        state.frozen = true;
        Ok(())
    }

    fn thaw(&self) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        if !state.frozen {
            return Err(ControlError::InvalidArgument("not frozen".to_string()));
        }
        state.frozen = false;
        Ok(())
    }

    fn cleaner_lock_path(&self) -> PathBuf {
        self.lock_path.clone()
    }
}
