//! Start a manual cleaning job

use crate::util;
use anyhow::Result;
use clap::Args;
use lfsgc_cleaner::{CleanerConfig, RunArgs};
use owo_colors::OwoColorize;
use std::path::Path;

/// Overrides shared by `run` and `tune`
#[derive(Args, Debug, Clone, Default)]
pub struct RunOpts {
    /// Seconds of history to protect
    #[arg(short = 'p', long)]
    pub protection_period: Option<u64>,

    /// Segments per cleaning step
    #[arg(short = 'n', long)]
    pub nsegments: Option<u32>,

    /// Seconds between cleaning steps
    #[arg(short = 'i', long)]
    pub interval: Option<u64>,

    /// Passes over the reclaimable segments
    #[arg(long)]
    pub passes: Option<u32>,

    /// Defer segments that would free fewer blocks than this
    #[arg(short = 'm', long)]
    pub min_reclaimable: Option<u64>,
}

impl From<&RunOpts> for RunArgs {
    fn from(opts: &RunOpts) -> Self {
        Self {
            protection_period: opts.protection_period,
            nsegments_per_clean: opts.nsegments,
            cleaning_interval: opts.interval,
            npasses: opts.passes,
            min_reclaimable_blocks: opts.min_reclaimable,
        }
    }
}

pub async fn run(config: &CleanerConfig, device: &Path, opts: &RunOpts, wait: bool) -> Result<()> {
    let mut client = util::client(config, device)?;
    let response = util::expect_ack(client.run(opts.into()).await?, "run")?;
    let job = response.job_id;
    println!("{} Started job #{}", "✓".green(), job.to_string().cyan());

    if wait {
        let response = util::expect_ack(client.wait(job, None).await?, "wait")?;
        println!(
            "{} Job #{} finished ({} segments cleaned in total)",
            "✓".green(),
            job,
            response.cleaned_total
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opts_map_to_args() {
        let opts = RunOpts {
            nsegments: Some(8),
            passes: Some(2),
            ..Default::default()
        };
        let args = RunArgs::from(&opts);
        assert_eq!(args.nsegments_per_clean, Some(8));
        assert_eq!(args.npasses, Some(2));
        assert_eq!(args.protection_period, None);
    }
}
