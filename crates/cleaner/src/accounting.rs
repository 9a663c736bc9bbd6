//! Turn decoded segments into block descriptors

use lfsgc_core::control::{VDESC_DATA, VDESC_NODE};
use lfsgc_core::{BlockDesc, BlockInfo, Period, SegmentLog, VirtualBlockDesc};

/// Every block found in the segments of one reclaim
#[derive(Debug, Default, Clone)]
pub struct BlockSet {
    /// Blocks of regular files, reached through virtual block numbers
    pub vdescs: Vec<VirtualBlockDesc>,
    /// Blocks of the DAT file, addressed physically
    pub bdescs: Vec<BlockDesc>,
}

impl BlockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every block record of `log`, returning how many were found
    pub fn add_segment(&mut self, log: SegmentLog<'_>) -> usize {
        let mut count = 0;
        for pseg in log.partial_segments() {
            for file in pseg.files() {
                let info = *file.info();
                for block in file.blocks() {
                    count += 1;
                    match block.info {
                        BlockInfo::Data { vblocknr, blkoff } => {
                            self.vdescs.push(VirtualBlockDesc {
                                ino: info.ino,
                                cno: info.cno,
                                vblocknr,
                                period: Period::default(),
                                blocknr: block.blocknr,
                                offset: blkoff,
                                flags: VDESC_DATA,
                            });
                        }
                        BlockInfo::Node { vblocknr } => {
                            self.vdescs.push(VirtualBlockDesc {
                                ino: info.ino,
                                cno: info.cno,
                                vblocknr,
                                period: Period::default(),
                                blocknr: block.blocknr,
                                offset: 0,
                                flags: VDESC_NODE,
                            });
                        }
                        BlockInfo::DatData { blkoff } => self.bdescs.push(BlockDesc {
                            ino: info.ino,
                            oblocknr: block.blocknr,
                            blocknr: 0,
                            offset: blkoff,
                            level: 0,
                        }),
                        BlockInfo::DatNode { blkoff, level } => self.bdescs.push(BlockDesc {
                            ino: info.ino,
                            oblocknr: block.blocknr,
                            blocknr: 0,
                            offset: blkoff,
                            level: u32::from(level),
                        }),
                    }
                }
            }
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.vdescs.is_empty() && self.bdescs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfsgc_core::layout::ino;
    use lfsgc_core::sim::{encode_segment, FileSpec, PartialSpec};
    use lfsgc_core::Geometry;

    fn geometry() -> Geometry {
        Geometry {
            block_size: 1024,
            blocks_per_segment: 16,
            first_data_block: 1,
            nsegments: 8,
            crc_seed: 0xdead,
            r_segments_percentage: 5,
        }
    }

    #[test]
    fn test_regular_and_dat_blocks_split() {
        let g = geometry();
        let psegs = [PartialSpec {
            seq: 3,
            create: 1000,
            cno: 9,
            files: vec![
                FileSpec::regular(12, 9, [(100, 0), (101, 1)], [102]),
                FileSpec::dat([4, 5], [(6, 1)]),
            ],
        }];
        let image = encode_segment(&g, 2, &psegs);
        let mut set = BlockSet::new();
        let found = set.add_segment(SegmentLog::new(&image, &g, 2));

        assert_eq!(found, 6);
        assert_eq!(set.vdescs.len(), 3);
        assert_eq!(set.bdescs.len(), 3);

        let first_payload = g.segment_start(2) + 1;
        assert_eq!(set.vdescs[0].blocknr, first_payload);
        assert_eq!(set.vdescs[0].cno, 9);
        assert_eq!(set.vdescs[1].offset, 1);
        assert!(set.vdescs[2].is_node());
        assert_eq!(set.vdescs[2].vblocknr, 102);

        assert!(set.bdescs.iter().all(|b| b.ino == ino::DAT));
        assert_eq!(set.bdescs[0].oblocknr, first_payload + 3);
        assert_eq!(set.bdescs[2].level, 1);
        assert_eq!(set.bdescs[2].offset, 6);
    }

    #[test]
    fn test_blank_segment_adds_nothing() {
        let g = geometry();
        let image = vec![0u8; 16 * 1024];
        let mut set = BlockSet::new();
        assert_eq!(set.add_segment(SegmentLog::new(&image, &g, 3)), 0);
        assert!(set.is_empty());
    }
}
