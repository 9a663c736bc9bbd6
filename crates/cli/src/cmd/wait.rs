//! Block until a manual job ends

use crate::util;
use anyhow::Result;
use lfsgc_cleaner::CleanerConfig;
use nix::errno::Errno;
use owo_colors::OwoColorize;
use std::path::Path;

pub async fn run(config: &CleanerConfig, device: &Path, job: u32, timeout: Option<u64>) -> Result<()> {
    let response = util::client(config, device)?.wait(job, timeout).await?;
    if !response.is_ack() {
        match response.errno() {
            Errno::ETIMEDOUT => anyhow::bail!("Timed out waiting for job #{job}"),
            Errno::ECANCELED => anyhow::bail!("Job #{job} was cancelled"),
            Errno::ENOENT => anyhow::bail!("No such job #{job}"),
            _ => {
                util::expect_ack(response, "wait")?;
            }
        }
    }
    println!("{} Job #{} finished", "✓".green(), job);
    Ok(())
}
