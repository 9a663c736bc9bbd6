//! Common utilities for integration tests

use cli_lib::daemon::Daemon;
use cli_lib::ipc::{IpcClient, IpcServer};
use lfsgc_cleaner::{CleanerConfig, Scheduler};
use lfsgc_core::sim::{FileSpec, PartialSpec, SimFs};
use lfsgc_core::Geometry;
use lfsgc_journal::ManualClock;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const NOW: i64 = 1_700_000_000;
pub const DAY: u64 = 86_400;

/// A simulated filesystem and a runtime directory for one daemon
pub struct TestFs {
    pub dir: TempDir,
    pub fs: Arc<SimFs>,
    pub clock: Arc<ManualClock>,
    next_vblocknr: u64,
}

impl TestFs {
    /// 100 segments of 8 blocks with five checkpoints two days old
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
            dir,
            fs,
            clock: Arc::new(ManualClock::new(NOW)),
            next_vblocknr: 1,
        }
    }

    /// A segment whose every block was overwritten a day ago
    pub fn write_dead(&mut self, segnum: u64) {
        let data: Vec<(u64, u64)> = (0..6).map(|i| (self.next_vblocknr + i, i)).collect();
        self.next_vblocknr += 6;
        let lastmod = NOW as u64 - DAY;
        self.fs.write_segment(
            segnum,
            lastmod,
            &[PartialSpec {
                seq: segnum,
                create: lastmod,
                cno: 1,
                files: vec![FileSpec::regular(20, 1, data, []).with_period(1, 2)],
            }],
        );
    }

    pub fn socket_path(&self) -> PathBuf {
        self.dir.path().join("sim.sock")
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("lfsgc.toml")
    }

    pub fn client(&self) -> IpcClient {
        IpcClient::new(self.socket_path())
    }

    /// A daemon for this filesystem, listening on `socket_path`
    pub async fn daemon(&self, config: CleanerConfig) -> Daemon {
        let scheduler = Scheduler::new(
            self.fs.clone(),
            self.clock.clone(),
            config,
            tracing::Span::none(),
        )
        .unwrap();
        let server = IpcServer::start(&self.socket_path()).await.unwrap();
        Daemon::new(scheduler, server, self.config_path(), tracing::Span::none())
    }
}
