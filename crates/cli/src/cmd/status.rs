//! Show daemon status for a device

use crate::{locks, util};
use anyhow::Result;
use lfsgc_cleaner::CleanerConfig;
use owo_colors::OwoColorize;
use std::path::Path;

pub async fn run(config: &CleanerConfig, device: &Path) -> Result<()> {
    let name = util::device_name(device)?;

    println!("{}", "Cleaner Status".bold());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
    println!("Device:        {}", device.display().to_string().cyan());

    print!("Daemon:        ");
    let Some(lock) = locks::running_daemon(&config.runtime_dir, &name) else {
        println!("{}", "Not running".red());
        println!();
        println!("Start it with: {}", format!("lfsgc daemon {} <MOUNT_DIR>", device.display()).cyan());
        return Ok(());
    };
    println!("{}", "Running ✓".green());
    println!("  PID:         {}", lock.pid);
    println!("  Started:     {}", util::format_timestamp_ms(lock.started_at));

    let response = util::client(config, device)?.get_status().await?;
    let response = util::expect_ack(response, "status")?;

    println!("  State:       {}", util::format_status(response.status));
    if response.job_id != 0 {
        println!("  Job:         #{}", response.job_id);
    }
    println!("  Cleaned:     {} segments", response.cleaned_total);

    Ok(())
}
