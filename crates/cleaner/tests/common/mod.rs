//! Common fixtures for scheduler integration tests

use lfsgc_cleaner::{CleanerConfig, Scheduler, Threshold};
use lfsgc_core::sim::{FileSpec, PartialSpec, SimFs};
use lfsgc_core::Geometry;
use lfsgc_journal::ManualClock;
use std::sync::Arc;
use tempfile::TempDir;

pub const NOW: i64 = 1_700_000_000;
pub const DAY: u64 = 86_400;

/// A simulated filesystem with a scheduler attached
pub struct TestFs {
    _dir: TempDir,
    pub fs: Arc<SimFs>,
    pub clock: Arc<ManualClock>,
    next_vblocknr: u64,
}

impl TestFs {
    /// 100 segments of 8 blocks, five old checkpoints, nothing written yet
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let geometry = Geometry {
            block_size: 1024,
            blocks_per_segment: 8,
            first_data_block: 1,
            nsegments: 100,
            crc_seed: 0xfeed,
            r_segments_percentage: 5,
        };
        let fs = Arc::new(SimFs::new(geometry, dir.path().join("cleaner.lock")));
        for cno in 1..=5 {
            fs.add_checkpoint(cno, NOW as u64 - 2 * DAY + cno, false);
        }
        Self {
            _dir: dir,
            fs,
            clock: Arc::new(ManualClock::new(NOW)),
            next_vblocknr: 1,
        }
    }

    /// Config that cleans regardless of free space
    pub fn eager_config(nsegments_per_clean: u32) -> CleanerConfig {
        CleanerConfig {
            min_clean_segments: Threshold::Count(0),
            max_clean_segments: Threshold::Count(0),
            nsegments_per_clean,
            mc_nsegments_per_clean: nsegments_per_clean,
            ..Default::default()
        }
    }

    pub fn scheduler(&self, config: CleanerConfig) -> Scheduler {
        Scheduler::new(
            self.fs.clone(),
            self.clock.clone(),
            config,
            tracing::Span::none(),
        )
        .unwrap()
    }

    fn write(&mut self, segnum: u64, lastmod: u64, file: impl FnOnce(Vec<(u64, u64)>) -> FileSpec) {
        let data: Vec<(u64, u64)> = (0..6).map(|i| (self.next_vblocknr + i, i)).collect();
        self.next_vblocknr += 6;
        let file = file(data);
        self.fs.write_segment(
            segnum,
            lastmod,
            &[PartialSpec {
                seq: segnum,
                create: lastmod,
                cno: file.cno,
                files: vec![file],
            }],
        );
    }

    /// A segment whose every block was overwritten long ago
    pub fn write_dead(&mut self, segnum: u64, lastmod: u64) {
        self.write(segnum, lastmod, |data| {
            FileSpec::regular(20, 1, data, []).with_period(1, 2)
        });
    }

    /// A segment whose blocks are all in the newest checkpoint
    pub fn write_live(&mut self, segnum: u64, lastmod: u64) {
        self.write(segnum, lastmod, |data| FileSpec::regular(21, 5, data, []));
    }
}
