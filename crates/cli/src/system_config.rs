//! Cleaner configuration file
//!
//! The config lives at `/etc/lfsgc.toml` unless `--config` names another
//! file. A missing default file means defaults; a missing file that was
//! asked for explicitly is an error.

use anyhow::{Context, Result};
use lfsgc_cleaner::CleanerConfig;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/lfsgc.toml";

pub fn default_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

/// Load and validate the config at `path`
pub fn load(path: &Path) -> Result<CleanerConfig> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG_PATH) {
        tracing::debug!("Config not found at {}, using defaults", path.display());
        return Ok(CleanerConfig::default());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config at {}", path.display()))?;

    let config: CleanerConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config at {}", path.display()))?;

    config
        .validate()
        .with_context(|| format!("Invalid config at {}", path.display()))?;

    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Render a config the way it would be written to disk
pub fn render(config: &CleanerConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to serialize config")
}

/// Annotated config with every key at its default
pub fn example_config() -> String {
    r#"# lfsgc configuration
# Every key is optional; shown values are the defaults.

# Seconds of history never reclaimed
protection_period = 3600

# Clean segments wanted on top of the reserved ones: a count or "N%"
min_clean_segments = "10%"
max_clean_segments = "20%"

# Seconds between checks while idle
clean_check_interval = 10

selection_policy = "timestamp"

# Segments per cleaning step, and seconds between steps
nsegments_per_clean = 2
cleaning_interval = 5

# The same while clean segments are below min_clean_segments
mc_nsegments_per_clean = 4
mc_cleaning_interval = 1

# Seconds to back off after the kernel reports busy or out of space
retry_interval = 60

# Defer segments freeing fewer blocks than this: a count or "N%" of a segment
min_reclaimable_blocks = "10%"
mc_min_reclaimable_blocks = "1%"

# Stamp deferred segments so they are not picked again right away
use_set_suinfo = false

use_mmap = true
log_level = "info"
runtime_dir = "/run/lfsgc"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfsgc_cleaner::Threshold;
    use tempfile::TempDir;

    #[test]
    fn test_example_config_is_the_default() {
        let config: CleanerConfig = toml::from_str(&example_config()).unwrap();
        assert_eq!(config, CleanerConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lfsgc.toml");
        fs::write(&path, "protection_period = 60\nmin_clean_segments = 4\n").unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.protection_period, 60);
        assert_eq!(config.min_clean_segments, Threshold::Count(4));
        assert_eq!(config.nsegments_per_clean, 2);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(load(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_invalid_values_fail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lfsgc.toml");
        fs::write(&path, "nsegments_per_clean = 0\n").unwrap();
        let err = load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("segments per clean"));
    }
}
