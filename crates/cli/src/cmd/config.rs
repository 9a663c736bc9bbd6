//! Print the effective configuration

use crate::system_config;
use anyhow::Result;
use lfsgc_cleaner::CleanerConfig;
use owo_colors::OwoColorize;
use std::path::Path;

pub fn run(config: &CleanerConfig, path: &Path, example: bool) -> Result<()> {
    if example {
        print!("{}", system_config::example_config());
        return Ok(());
    }

    println!("{}", "Cleaner Configuration".bold());
    println!("{}: {}\n", "Location".dimmed(), path.display().to_string().dimmed());
    for line in system_config::render(config)?.lines() {
        match line.split_once(" = ") {
            Some((key, value)) => println!("  {} = {}", key.cyan(), value),
            None => println!("{line}"),
        }
    }
    Ok(())
}
