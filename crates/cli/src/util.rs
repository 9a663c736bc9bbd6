//! Shared utilities for CLI commands

use crate::ipc::{self, IpcClient, Response};
use anyhow::{Context, Result};
use lfsgc_cleaner::{CleanerConfig, DaemonStatus};
use lfsgc_core::FsControl;
use owo_colors::OwoColorize;
use std::path::Path;
use std::sync::Arc;

/// Short name of a device, used for its socket and pid file
///
/// `/dev/sdb1` becomes `sdb1`.
pub fn device_name(device: &Path) -> Result<String> {
    device
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .with_context(|| format!("Cannot name device {}", device.display()))
}

/// Client for the daemon serving `device`
pub fn client(config: &CleanerConfig, device: &Path) -> Result<IpcClient> {
    let name = device_name(device)?;
    Ok(IpcClient::new(ipc::socket_path(&config.runtime_dir, &name)))
}

/// Turn a nack into an error
pub fn expect_ack(response: Response, what: &str) -> Result<Response> {
    if !response.is_ack() {
        anyhow::bail!("Daemon refused {what}: {}", response.errno().desc());
    }
    Ok(response)
}

/// Open a mounted filesystem for cleaning
#[cfg(target_os = "linux")]
pub fn open_device(device: &Path, mount_dir: &Path, config: &CleanerConfig) -> Result<Arc<dyn FsControl>> {
    use lfsgc_core::ioctl::{DeviceFs, OpenOptions};

    let options = OpenOptions {
        use_mmap: config.use_mmap,
        runtime_dir: config.runtime_dir.clone(),
    };
    let fs = DeviceFs::open(device, mount_dir, &options).with_context(|| {
        format!(
            "Failed to open {} mounted at {}",
            device.display(),
            mount_dir.display()
        )
    })?;
    Ok(Arc::new(fs))
}

#[cfg(not(target_os = "linux"))]
pub fn open_device(_device: &Path, _mount_dir: &Path, _config: &CleanerConfig) -> Result<Arc<dyn FsControl>> {
    anyhow::bail!("Cleaning needs Linux")
}

pub fn format_status(status: DaemonStatus) -> String {
    match status {
        DaemonStatus::Idle => "idle".dimmed().to_string(),
        DaemonStatus::Running => "cleaning".green().to_string(),
        DaemonStatus::RunningManual => "cleaning (manual)".green().to_string(),
        DaemonStatus::Suspended => "suspended".yellow().to_string(),
    }
}

/// Format a millisecond timestamp in local time
pub fn format_timestamp_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "unknown".to_string())
}
