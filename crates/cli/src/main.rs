//! lfsgc - segment cleaner for log-structured filesystems

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cli_lib::cmd;
use cli_lib::cmd::clean::CleanTarget;
use cli_lib::cmd::run::RunOpts;
use cli_lib::daemon::DaemonOptions;
use cli_lib::system_config::{self, DEFAULT_CONFIG_PATH};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// lfsgc - reclaims space in log-structured filesystems
#[derive(Parser)]
#[command(name = "lfsgc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file
    #[arg(short = 'c', long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cleaner for a device in the foreground
    Daemon {
        /// Block device, e.g. /dev/sdb1
        device: PathBuf,
        /// Where the device is mounted
        mount_dir: PathBuf,
        /// Write logs to this file instead of stderr
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Show daemon status
    Status { device: PathBuf },
    /// Start a manual cleaning job
    Run {
        device: PathBuf,
        #[command(flatten)]
        opts: RunOpts,
        /// Wait for the job to finish
        #[arg(short = 'w', long)]
        wait: bool,
    },
    /// Pause cleaning
    Suspend { device: PathBuf },
    /// Resume cleaning
    Resume { device: PathBuf },
    /// Change cleaning parameters without starting a job
    Tune {
        device: PathBuf,
        #[command(flatten)]
        opts: RunOpts,
    },
    /// Re-read the config file
    Reload {
        device: PathBuf,
        /// Switch to this config file
        path: Option<PathBuf>,
    },
    /// Wait for a manual job to finish
    Wait {
        device: PathBuf,
        job: u32,
        /// Give up after this many seconds
        #[arg(short = 't', long)]
        timeout: Option<u64>,
    },
    /// Cancel the manual job
    Stop { device: PathBuf },
    /// Stop the daemon
    Shutdown { device: PathBuf },
    /// Reclaim the given segments once
    Clean {
        device: PathBuf,
        mount_dir: PathBuf,
        segments: Vec<u64>,
        /// Seconds of history to protect
        #[arg(short = 'p', long)]
        protection_period: Option<u64>,
    },
    /// Report what cleaning the given segments would do
    Assess {
        device: PathBuf,
        mount_dir: PathBuf,
        segments: Vec<u64>,
        /// Seconds of history to protect
        #[arg(short = 'p', long)]
        protection_period: Option<u64>,
    },
    /// Print the effective configuration
    Config {
        /// Print an annotated example instead
        #[arg(long)]
        example: bool,
    },
}

/// Install the global subscriber; keep the guard alive to flush file logs
fn init_tracing(level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("Invalid log level {level:?}"))?,
    };

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let file_name = path
        .file_name()
        .with_context(|| format!("Bad log file {}", path.display()))?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).context("Failed to create log directory")?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = system_config::load(&cli.config)?;
    let log_file = match &cli.command {
        Commands::Daemon { log_file, .. } => log_file.as_deref(),
        _ => None,
    };
    let _guard = init_tracing(&config.log_level, log_file)?;

    match cli.command {
        Commands::Daemon { device, mount_dir, .. } => {
            let options = DaemonOptions {
                device,
                mount_dir,
                config_path: cli.config,
            };
            cmd::daemon::run(options, config).await
        }
        Commands::Status { device } => cmd::status::run(&config, &device).await,
        Commands::Run { device, opts, wait } => cmd::run::run(&config, &device, &opts, wait).await,
        Commands::Suspend { device } => cmd::stop::suspend(&config, &device).await,
        Commands::Resume { device } => cmd::stop::resume(&config, &device).await,
        Commands::Tune { device, opts } => cmd::tune::run(&config, &device, &opts).await,
        Commands::Reload { device, path } => cmd::reload::run(&config, &device, path).await,
        Commands::Wait { device, job, timeout } => cmd::wait::run(&config, &device, job, timeout).await,
        Commands::Stop { device } => cmd::stop::stop(&config, &device).await,
        Commands::Shutdown { device } => cmd::stop::shutdown(&config, &device).await,
        Commands::Clean { device, mount_dir, segments, protection_period } => {
            let target = CleanTarget {
                device: &device,
                mount_dir: &mount_dir,
                segments: &segments,
                protection_period,
            };
            cmd::clean::run(&config, &target, false)
        }
        Commands::Assess { device, mount_dir, segments, protection_period } => {
            let target = CleanTarget {
                device: &device,
                mount_dir: &mount_dir,
                segments: &segments,
                protection_period,
            };
            cmd::clean::run(&config, &target, true)
        }
        Commands::Config { example } => cmd::config::run(&config, &cli.config, example),
    }
}
