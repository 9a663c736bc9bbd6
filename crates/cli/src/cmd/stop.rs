//! Suspend, resume, stop and shutdown

use crate::ipc::Command;
use crate::{locks, util};
use anyhow::Result;
use lfsgc_cleaner::CleanerConfig;
use owo_colors::OwoColorize;
use std::path::Path;
use std::time::{Duration, Instant};

/// How long `shutdown` waits for the daemon to exit
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn suspend(config: &CleanerConfig, device: &Path) -> Result<()> {
    let response = util::client(config, device)?.command(Command::Suspend).await?;
    util::expect_ack(response, "suspend")?;
    println!("{} Cleaning suspended", "✓".green());
    Ok(())
}

pub async fn resume(config: &CleanerConfig, device: &Path) -> Result<()> {
    let response = util::client(config, device)?.command(Command::Resume).await?;
    let response = util::expect_ack(response, "resume")?;
    println!(
        "{} Cleaning resumed ({})",
        "✓".green(),
        util::format_status(response.status)
    );
    Ok(())
}

/// Cancel the manual job
pub async fn stop(config: &CleanerConfig, device: &Path) -> Result<()> {
    let response = util::client(config, device)?.command(Command::Stop).await?;
    let response = util::expect_ack(response, "stop")?;
    if response.job_id == 0 {
        println!("{}", "No manual job was running".dimmed());
    } else {
        println!("{} Stopped job #{}", "✓".green(), response.job_id);
    }
    Ok(())
}

/// Ask the daemon to exit and wait until it has
pub async fn shutdown(config: &CleanerConfig, device: &Path) -> Result<()> {
    let name = util::device_name(device)?;
    if locks::running_daemon(&config.runtime_dir, &name).is_none() {
        println!("Daemon is not running");
        return Ok(());
    }

    let response = util::client(config, device)?.command(Command::Shutdown).await?;
    util::expect_ack(response, "shutdown")?;

    let pid_path = locks::pid_path(&config.runtime_dir, &name);
    let start = Instant::now();
    while pid_path.exists() && start.elapsed() < SHUTDOWN_TIMEOUT {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if pid_path.exists() {
        tracing::warn!("Daemon did not exit gracefully");
        anyhow::bail!("Daemon shutdown timeout");
    }

    println!("{} Daemon stopped", "✓".green());
    Ok(())
}
