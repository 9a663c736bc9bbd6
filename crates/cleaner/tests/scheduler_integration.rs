//! End-to-end scheduler tests against the in-memory filesystem

mod common;

use common::{TestFs, DAY, NOW};
use lfsgc_cleaner::{CleanerConfig, CleanerState, DaemonStatus, RunArgs, Threshold};
use lfsgc_core::{CleanRequest, ControlError, FsControl};
use std::time::Duration;

#[test]
fn test_twenty_dead_segments_cleaned_in_ten_cycles() {
    let mut t = TestFs::new();
    for segnum in 1..=20 {
        t.write_dead(segnum, NOW as u64 - DAY + segnum);
    }
    let mut scheduler = t.scheduler(TestFs::eager_config(2));

    for cycle in 0..10 {
        let outcome = scheduler.run_cycle().unwrap();
        let stats = outcome.stats.expect("reclaim ran");
        assert_eq!(stats.cleaned_segs, 2, "cycle {cycle}");
        assert_eq!(outcome.sleep, Duration::from_secs(5));
    }

    assert_eq!(t.fs.reclaimable_count(), 0);
    assert_eq!(scheduler.status().cleaned_total, 20);

    // Oldest first
    let requests = t.fs.cleaned();
    assert_eq!(requests[0].segnums, vec![1, 2]);
    assert_eq!(requests[9].segnums, vec![19, 20]);
}

#[test]
fn test_idle_scan_skipped_until_next_write() {
    let mut t = TestFs::new();
    t.write_dead(1, NOW as u64 - DAY);
    let mut scheduler = t.scheduler(TestFs::eager_config(2));

    scheduler.run_cycle().unwrap();
    let outcome = scheduler.run_cycle().unwrap();
    assert!(outcome.stats.is_none());
    assert_eq!(outcome.sleep, Duration::from_secs(10));

    let scans = t.fs.calls().segment_usage;
    scheduler.run_cycle().unwrap();
    assert_eq!(t.fs.calls().segment_usage, scans);

    t.write_dead(2, NOW as u64 - DAY);
    t.fs.set_nongc_ctime(NOW as u64);
    let outcome = scheduler.run_cycle().unwrap();
    assert_eq!(outcome.stats.map(|s| s.cleaned_segs), Some(1));
}

#[test]
fn test_protected_segments_set_idle_timeout() {
    let mut t = TestFs::new();
    t.write_dead(1, NOW as u64 - 100);
    let mut scheduler = t.scheduler(TestFs::eager_config(2));

    let outcome = scheduler.run_cycle().unwrap();
    assert!(outcome.stats.is_none());
    assert_eq!(outcome.sleep, Duration::from_secs(3500));
    assert!(t.fs.usage_of(1).is_dirty());

    // Once it ages out of protection it is cleaned
    t.clock.advance(Duration::from_secs(3600));
    t.fs.set_nongc_ctime(NOW as u64 + 3600);
    let outcome = scheduler.run_cycle().unwrap();
    assert_eq!(outcome.stats.map(|s| s.cleaned_segs), Some(1));
}

#[test]
fn test_snapshot_keeps_blocks_live() {
    let mut t = TestFs::new();
    t.fs.add_checkpoint(1, NOW as u64 - 2 * DAY + 1, true);
    t.write_dead(1, NOW as u64 - DAY);
    let mut scheduler = t.scheduler(TestFs::eager_config(2));

    let stats = scheduler.run_cycle().unwrap().stats.unwrap();
    assert_eq!(stats.cleaned_segs, 1);
    assert_eq!(stats.live_vblocks, 6);
    assert_eq!(t.fs.cleaned()[0].vdescs.len(), 6);
    assert!(t.fs.checkpoint_numbers().contains(&1));
}

#[test]
fn test_transient_failure_halves_batch() {
    let mut t = TestFs::new();
    for segnum in 1..=12 {
        t.write_dead(segnum, NOW as u64 - DAY + segnum);
    }
    let mut scheduler = t.scheduler(TestFs::eager_config(4));

    t.fs.fail_next_clean(ControlError::Busy);
    let outcome = scheduler.run_cycle().unwrap();
    assert!(outcome.stats.is_none());
    assert_eq!(outcome.sleep, Duration::from_secs(60));

    let stats = scheduler.run_cycle().unwrap().stats.unwrap();
    assert_eq!(stats.cleaned_segs, 2);

    let stats = scheduler.run_cycle().unwrap().stats.unwrap();
    assert_eq!(stats.cleaned_segs, 4);
}

#[test]
fn test_fatal_error_propagates() {
    let mut t = TestFs::new();
    t.write_dead(1, NOW as u64 - DAY);
    let mut scheduler = t.scheduler(TestFs::eager_config(2));

    t.fs.fail_next_clean(ControlError::InvalidArgument("bad request".into()));
    let err = scheduler.run_cycle().unwrap_err();
    assert!(!err.is_transient());
}

#[test]
fn test_watermarks() {
    let mut t = TestFs::new();
    for segnum in 1..=30 {
        t.write_dead(segnum, NOW as u64 - DAY + segnum);
    }
    // 70 clean; reserved is 8, so low = 70 and high = 75
    let config = CleanerConfig {
        min_clean_segments: Threshold::Count(62),
        max_clean_segments: Threshold::Count(67),
        ..Default::default()
    };
    let mut scheduler = t.scheduler(config);

    let outcome = scheduler.run_cycle().unwrap();
    assert!(outcome.stats.is_none());
    assert_eq!(*scheduler.state(), CleanerState::Idle);

    t.fs.set_segment_flags(40, lfsgc_core::control::SUINFO_ACTIVE);
    let stats = scheduler.run_cycle().unwrap().stats.unwrap();
    assert_eq!(*scheduler.state(), CleanerState::RunningAutomatic);
    // Below the low watermark the faster settings apply
    assert_eq!(stats.cleaned_segs, 4);

    // 73 clean now: between the watermarks, keep going at normal speed
    let stats = scheduler.run_cycle().unwrap().stats.unwrap();
    assert_eq!(stats.cleaned_segs, 2);

    // 75 clean reaches the high watermark
    let outcome = scheduler.run_cycle().unwrap();
    assert!(outcome.stats.is_none());
    assert_eq!(scheduler.status().status, DaemonStatus::Idle);
}

#[test]
fn test_manual_job_runs_one_pass() {
    let mut t = TestFs::new();
    for segnum in 1..=5 {
        t.write_dead(segnum, NOW as u64 - DAY + segnum);
    }
    // Default watermarks leave an almost empty filesystem idle
    let mut scheduler = t.scheduler(CleanerConfig::default());
    assert!(scheduler.run_cycle().unwrap().stats.is_none());

    let id = scheduler.run(RunArgs {
        nsegments_per_clean: Some(3),
        npasses: Some(1),
        ..Default::default()
    });
    assert_eq!(scheduler.status().job_id, Some(id));

    let outcome = scheduler.run_cycle().unwrap();
    assert_eq!(outcome.stats.unwrap().cleaned_segs, 3);
    assert_eq!(outcome.finished_job, None);

    let outcome = scheduler.run_cycle().unwrap();
    assert_eq!(outcome.stats.unwrap().cleaned_segs, 2);
    assert_eq!(outcome.finished_job, Some(id));
    assert_eq!(*scheduler.state(), CleanerState::Idle);
    assert_eq!(t.fs.reclaimable_count(), 0);
}

#[test]
fn test_manual_job_with_nothing_to_clean_finishes() {
    let t = TestFs::new();
    let mut scheduler = t.scheduler(CleanerConfig::default());
    let id = scheduler.run(RunArgs {
        npasses: Some(2),
        ..Default::default()
    });

    assert_eq!(scheduler.run_cycle().unwrap().finished_job, None);
    assert_eq!(scheduler.run_cycle().unwrap().finished_job, Some(id));
}

#[test]
fn test_suspend_stops_all_kernel_traffic() {
    let mut t = TestFs::new();
    t.write_dead(1, NOW as u64 - DAY);
    let mut scheduler = t.scheduler(TestFs::eager_config(2));

    scheduler.suspend();
    let before = t.fs.calls();
    let outcome = scheduler.run_cycle().unwrap();
    assert_eq!(outcome.sleep, Duration::from_secs(10));
    assert_eq!(t.fs.calls(), before);
    assert_eq!(scheduler.status().status, DaemonStatus::Suspended);

    scheduler.resume();
    assert_eq!(scheduler.run_cycle().unwrap().stats.unwrap().cleaned_segs, 1);
}

#[test]
fn test_tune_changes_automatic_batch() {
    let mut t = TestFs::new();
    for segnum in 1..=10 {
        t.write_dead(segnum, NOW as u64 - DAY + segnum);
    }
    let mut scheduler = t.scheduler(TestFs::eager_config(2));
    scheduler.tune(RunArgs {
        nsegments_per_clean: Some(5),
        cleaning_interval: Some(1),
        ..Default::default()
    });

    let outcome = scheduler.run_cycle().unwrap();
    assert_eq!(outcome.stats.unwrap().cleaned_segs, 5);
    assert_eq!(outcome.sleep, Duration::from_secs(1));
    assert_eq!(scheduler.status().job_id, None);
}

#[test]
fn test_live_segments_move_not_vanish() {
    let mut t = TestFs::new();
    t.write_live(1, NOW as u64 - DAY);
    t.write_dead(2, NOW as u64 - DAY + 1);
    let mut scheduler = t.scheduler(TestFs::eager_config(2));

    let stats = scheduler.run_cycle().unwrap().stats.unwrap();
    assert_eq!(stats.cleaned_segs, 2);
    assert_eq!(stats.live_vblocks, 6);
    assert_eq!(stats.defunct_vblocks, 6);
}

#[test]
fn test_unknown_virtual_block_does_not_stall_cleaning() {
    let mut t = TestFs::new();
    t.write_dead(1, NOW as u64 - DAY);
    t.write_dead(2, NOW as u64 - DAY + 1);
    // The DAT forgets one block of the oldest segment
    t.fs.clean_segments(&CleanRequest {
        vblocknrs: vec![1],
        ..Default::default()
    })
    .unwrap();
    let mut scheduler = t.scheduler(TestFs::eager_config(1));

    let stats = scheduler.run_cycle().unwrap().stats.unwrap();
    assert_eq!(stats.cleaned_segs, 1);
    assert_eq!(stats.missing_vblocks, 1);
    assert_eq!(stats.defunct_vblocks, 5);
    assert!(!t.fs.cleaned().last().unwrap().vblocknrs.contains(&1));

    let stats = scheduler.run_cycle().unwrap().stats.unwrap();
    assert_eq!(stats.cleaned_segs, 1);
    assert_eq!(stats.missing_vblocks, 0);
    assert_eq!(t.fs.reclaimable_count(), 0);
    assert_eq!(scheduler.status().cleaned_total, 2);
}

#[test]
fn test_reload_rejects_bad_config() {
    let t = TestFs::new();
    let mut scheduler = t.scheduler(TestFs::eager_config(2));
    let bad = CleanerConfig {
        nsegments_per_clean: 0,
        ..Default::default()
    };
    assert!(scheduler.reload(bad).is_err());
    assert_eq!(scheduler.config().nsegments_per_clean, 2);

    scheduler.reload(TestFs::eager_config(3)).unwrap();
    assert_eq!(scheduler.config().nsegments_per_clean, 3);
}
