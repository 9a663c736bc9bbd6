//! Adjust the running cleaner without starting a job

use crate::cmd::run::RunOpts;
use crate::util;
use anyhow::Result;
use lfsgc_cleaner::CleanerConfig;
use owo_colors::OwoColorize;
use std::path::Path;

pub async fn run(config: &CleanerConfig, device: &Path, opts: &RunOpts) -> Result<()> {
    let response = util::client(config, device)?.tune(opts.into()).await?;
    let response = util::expect_ack(response, "tune")?;
    match response.job_id {
        0 => println!("{} Tuned automatic cleaning", "✓".green()),
        job => println!("{} Tuned job #{}", "✓".green(), job),
    }
    Ok(())
}
