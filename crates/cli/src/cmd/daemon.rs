//! Run the cleaner daemon in the foreground

use crate::daemon::{self, DaemonOptions};
use anyhow::Result;
use lfsgc_cleaner::CleanerConfig;

pub async fn run(options: DaemonOptions, config: CleanerConfig) -> Result<()> {
    tracing::info!(
        device = %options.device.display(),
        mount = %options.mount_dir.display(),
        config = %options.config_path.display(),
        "starting cleaner"
    );
    daemon::start(options, config).await
}
