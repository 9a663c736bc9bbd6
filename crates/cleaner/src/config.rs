//! Cleaner configuration
//!
//! Every field has a default, so a config file only needs the keys it
//! changes. Thresholds are written either as a plain count or as a
//! percentage string such as `"10%"`.

use crate::error::CleanerError;
use crate::policy::policy_by_name;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// An absolute count or a percentage of some total
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ThresholdRepr", into = "ThresholdRepr")]
pub enum Threshold {
    Count(u64),
    Percent(u32),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ThresholdRepr {
    Count(u64),
    Text(String),
}

impl TryFrom<ThresholdRepr> for Threshold {
    type Error = String;

    fn try_from(repr: ThresholdRepr) -> Result<Self, Self::Error> {
        match repr {
            ThresholdRepr::Count(count) => Ok(Self::Count(count)),
            ThresholdRepr::Text(text) => text.parse(),
        }
    }
}

impl From<Threshold> for ThresholdRepr {
    fn from(threshold: Threshold) -> Self {
        match threshold {
            Threshold::Count(count) => Self::Count(count),
            Threshold::Percent(_) => Self::Text(threshold.to_string()),
        }
    }
}

impl std::str::FromStr for Threshold {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let pct: u32 = pct
                .trim()
                .parse()
                .map_err(|_| format!("bad percentage {s:?}"))?;
            if pct > 100 {
                return Err(format!("percentage {s:?} exceeds 100%"));
            }
            Ok(Self::Percent(pct))
        } else {
            s.parse()
                .map(Self::Count)
                .map_err(|_| format!("expected a count or a percentage, got {s:?}"))
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(count) => write!(f, "{count}"),
            Self::Percent(pct) => write!(f, "{pct}%"),
        }
    }
}

impl Threshold {
    /// Absolute value against `total`
    pub fn resolve(&self, total: u64) -> u64 {
        match *self {
            Self::Count(count) => count,
            Self::Percent(pct) => total * u64::from(pct) / 100,
        }
    }
}

/// Cleaner daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    /// Seconds of history never reclaimed (default: 3600)
    pub protection_period: u64,

    /// Start cleaning below this many clean segments, on top of the
    /// reserved ones (default: 10%)
    pub min_clean_segments: Threshold,

    /// Stop cleaning at this many clean segments (default: 20%)
    pub max_clean_segments: Threshold,

    /// Seconds between checks while idle (default: 10)
    pub clean_check_interval: u64,

    /// Segment selection policy (default: "timestamp")
    pub selection_policy: String,

    /// Segments per cleaning step (default: 2)
    pub nsegments_per_clean: u32,

    /// Segments per step when clean segments run low (default: 4)
    pub mc_nsegments_per_clean: u32,

    /// Seconds between cleaning steps (default: 5)
    pub cleaning_interval: u64,

    /// Seconds between steps when clean segments run low (default: 1)
    pub mc_cleaning_interval: u64,

    /// Seconds to wait after a transient failure (default: 60)
    pub retry_interval: u64,

    /// Defer segments with fewer reclaimable blocks than this, as a count
    /// or a share of blocks per segment (default: 10%)
    pub min_reclaimable_blocks: Threshold,

    /// The same when clean segments run low (default: 1%)
    pub mc_min_reclaimable_blocks: Threshold,

    /// Stamp deferred segments so they are not picked again right away
    /// (default: false)
    pub use_set_suinfo: bool,

    /// Map segments instead of reading them (default: true)
    pub use_mmap: bool,

    /// Log filter when `RUST_LOG` is unset (default: "info")
    pub log_level: String,

    /// Sockets, pid files and lock files (default: /run/lfsgc)
    pub runtime_dir: PathBuf,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            protection_period: 3600,
            min_clean_segments: Threshold::Percent(10),
            max_clean_segments: Threshold::Percent(20),
            clean_check_interval: 10,
            selection_policy: "timestamp".to_string(),
            nsegments_per_clean: 2,
            mc_nsegments_per_clean: 4,
            cleaning_interval: 5,
            mc_cleaning_interval: 1,
            retry_interval: 60,
            min_reclaimable_blocks: Threshold::Percent(10),
            mc_min_reclaimable_blocks: Threshold::Percent(1),
            use_set_suinfo: false,
            use_mmap: true,
            log_level: "info".to_string(),
            runtime_dir: PathBuf::from("/run/lfsgc"),
        }
    }
}

impl CleanerConfig {
    pub fn validate(&self) -> Result<(), CleanerError> {
        let invalid = |msg: String| Err(CleanerError::Config(msg));

        if self.nsegments_per_clean == 0 || self.mc_nsegments_per_clean == 0 {
            return invalid("segments per clean must be at least 1".into());
        }
        if policy_by_name(&self.selection_policy).is_none() {
            return invalid(format!("unknown selection policy {:?}", self.selection_policy));
        }
        for threshold in [
            self.min_clean_segments,
            self.max_clean_segments,
            self.min_reclaimable_blocks,
            self.mc_min_reclaimable_blocks,
        ] {
            if let Threshold::Percent(pct) = threshold {
                if pct > 100 {
                    return invalid(format!("{threshold} exceeds 100%"));
                }
            }
        }
        match (self.min_clean_segments, self.max_clean_segments) {
            (Threshold::Count(min), Threshold::Count(max)) if min > max => {
                invalid(format!("min_clean_segments {min} exceeds max_clean_segments {max}"))
            }
            (Threshold::Percent(min), Threshold::Percent(max)) if min > max => {
                invalid(format!("min_clean_segments {min}% exceeds max_clean_segments {max}%"))
            }
            _ => Ok(()),
        }
    }

    pub fn clean_check_interval(&self) -> Duration {
        Duration::from_secs(self.clean_check_interval)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: CleanerConfig = toml::from_str("").unwrap();
        assert_eq!(config, CleanerConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_threshold_forms() {
        let config: CleanerConfig = toml::from_str(
            r#"
            min_clean_segments = 12
            max_clean_segments = "25%"
            min_reclaimable_blocks = " 3 "
            "#,
        )
        .unwrap();
        assert_eq!(config.min_clean_segments, Threshold::Count(12));
        assert_eq!(config.max_clean_segments, Threshold::Percent(25));
        assert_eq!(config.min_reclaimable_blocks, Threshold::Count(3));
        assert_eq!(config.max_clean_segments.resolve(1000), 250);
    }

    #[test]
    fn test_bad_percentage_rejected() {
        assert!(toml::from_str::<CleanerConfig>(r#"max_clean_segments = "120%""#).is_err());
        assert!(toml::from_str::<CleanerConfig>(r#"max_clean_segments = "lots""#).is_err());
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = CleanerConfig {
            min_clean_segments: Threshold::Count(7),
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("max_clean_segments = \"20%\""));
        assert_eq!(toml::from_str::<CleanerConfig>(&text).unwrap(), config);
    }

    #[test]
    fn test_validation() {
        let zero_batch = CleanerConfig {
            nsegments_per_clean: 0,
            ..Default::default()
        };
        assert!(zero_batch.validate().is_err());

        let inverted = CleanerConfig {
            min_clean_segments: Threshold::Percent(30),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let unknown = CleanerConfig {
            selection_policy: "greedy".into(),
            ..Default::default()
        };
        assert!(unknown.validate().is_err());
    }
}
