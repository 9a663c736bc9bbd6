//! Make the daemon re-read its config

use crate::util;
use anyhow::{Context, Result};
use lfsgc_cleaner::CleanerConfig;
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};

pub async fn run(config: &CleanerConfig, device: &Path, path: Option<PathBuf>) -> Result<()> {
    // The daemon resolves the path from its own working directory
    let path = match path {
        Some(p) if p.is_relative() => Some(
            std::env::current_dir()
                .context("Failed to get current directory")?
                .join(p),
        ),
        other => other,
    };

    let response = util::client(config, device)?.reload(path.clone()).await?;
    util::expect_ack(response, "reload")?;
    match path {
        Some(path) => println!("{} Reloaded from {}", "✓".green(), path.display()),
        None => println!("{} Reloaded", "✓".green()),
    }
    Ok(())
}
