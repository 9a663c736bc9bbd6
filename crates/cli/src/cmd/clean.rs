//! One-shot reclaim of chosen segments
//!
//! `clean` reclaims the segments named on the command line; `assess` runs
//! the same classification without changing anything and reports what a
//! clean would move and free.

use crate::util;
use anyhow::{Context, Result};
use lfsgc_cleaner::{CleanerConfig, ReclaimParams, ReclaimStats, Reclaimer};
use lfsgc_core::FsControl;
use lfsgc_journal::{Clock, ReverseMapper, SystemClock};
use owo_colors::OwoColorize;
use std::path::Path;
use std::sync::Arc;

/// Reclaim `segnums` right now, or only assess them
pub fn reclaim_segments(
    control: Arc<dyn FsControl>,
    clock: Arc<dyn Clock>,
    config: &CleanerConfig,
    segnums: &[u64],
    protection_period: u64,
    dry_run: bool,
) -> Result<ReclaimStats> {
    let span = tracing::info_span!("clean", dry_run);

    let mut mapper = ReverseMapper::new(control.clone(), clock.clone(), span.clone());
    let protcno = mapper
        .track_back(protection_period)
        .context("Failed to find the protection checkpoint")?;
    let protseq = control
        .usage_stat()
        .context("Failed to read segment usage")?
        .prot_seq;

    let params = ReclaimParams {
        protseq,
        protcno: Some(protcno),
        min_reclaimable_blocks: None,
        dry_run,
    };
    let mut reclaimer = Reclaimer::new(control, clock, config.use_set_suinfo, span);
    reclaimer
        .reclaim(segnums, &params)
        .context("Failed to reclaim segments")
}

pub struct CleanTarget<'a> {
    pub device: &'a Path,
    pub mount_dir: &'a Path,
    pub segments: &'a [u64],
    pub protection_period: Option<u64>,
}

pub fn run(config: &CleanerConfig, target: &CleanTarget<'_>, dry_run: bool) -> Result<()> {
    if target.segments.is_empty() {
        anyhow::bail!("No segments given");
    }
    let control = util::open_device(target.device, target.mount_dir, config)?;
    let period = target.protection_period.unwrap_or(config.protection_period);
    let stats = reclaim_segments(
        control,
        Arc::new(SystemClock),
        config,
        target.segments,
        period,
        dry_run,
    )?;

    if dry_run {
        println!("{}", "Assessment".bold());
    } else {
        println!("{}", "Clean Complete".green().bold());
    }
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
    if !dry_run {
        println!("  Segments cleaned:   {}", stats.cleaned_segs.to_string().green());
    }
    if stats.protected_segs > 0 {
        println!("  Segments protected: {}", stats.protected_segs.to_string().yellow());
    }
    println!("  Live blocks:        {}", stats.live_total());
    println!(
        "  Freed blocks:       {}",
        (stats.defunct_vblocks + stats.defunct_blocks).to_string().cyan()
    );
    println!("  Checkpoint ranges:  {}", stats.freed_periods);
    if stats.missing_vblocks > 0 {
        println!("  Unknown to the DAT: {}", stats.missing_vblocks.to_string().yellow());
    }
    Ok(())
}
