//! Engine configuration via `timelines.toml`
//!
//! On first open of a data directory a default `timelines.toml` is created.
//! To change settings, edit the file and reopen.

use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use timelines_core::{TimelineError, TimelineResult};

/// Config file name placed in the data directory.
pub const CONFIG_FILE_NAME: &str = "timelines.toml";

fn default_provider_timeout_ms() -> u64 {
    30_000
}

fn default_metadata_write_attempts() -> usize {
    3
}

/// Engine configuration loaded from `timelines.toml`.
///
/// # Example
///
/// ```toml
/// provider_timeout_ms = 30000
/// purge_on_delete = false
/// metadata_write_attempts = 3
///
/// [retry]
/// max_attempts = 3
/// base_delay_ms = 50
/// max_delay_ms = 2000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelinesConfig {
    /// Deadline for a single provider call, in milliseconds.
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,
    /// Purge metadata and history immediately when a timeline is deleted.
    #[serde(default)]
    pub purge_on_delete: bool,
    /// Attempts for a metadata write that follows a successful provider call.
    #[serde(default = "default_metadata_write_attempts")]
    pub metadata_write_attempts: usize,
    /// Retry policy for transient provider failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for TimelinesConfig {
    fn default() -> Self {
        Self {
            provider_timeout_ms: default_provider_timeout_ms(),
            purge_on_delete: false,
            metadata_write_attempts: default_metadata_write_attempts(),
            retry: RetryConfig::default(),
        }
    }
}

impl TimelinesConfig {
    /// Provider call deadline as a `Duration`
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    /// Check that the values are usable.
    ///
    /// # Errors
    ///
    /// Returns `Config` for a zero timeout, zero attempts, or a base delay
    /// above the max delay.
    pub fn validate(&self) -> TimelineResult<()> {
        if self.provider_timeout_ms == 0 {
            return Err(TimelineError::Config(
                "provider_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(TimelineError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.metadata_write_attempts == 0 {
            return Err(TimelineError::Config(
                "metadata_write_attempts must be at least 1".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(TimelineError::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Timelines engine configuration
#
# Deadline for a single storage provider call, in milliseconds.
# A call that exceeds it fails with ProviderTimeout.
provider_timeout_ms = 30000

# Remove metadata and snapshot history as soon as a timeline is deleted
# (default: false, deleted timelines stay listed for audit until purged).
purge_on_delete = false

# Attempts for the metadata write that records a fork after the provider
# created it. When all attempts fail the new fork is dropped again.
metadata_write_attempts = 3

# Retry policy for transient provider failures (exponential backoff).
[retry]
max_attempts = 3
base_delay_ms = 50
max_delay_ms = 2000
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> TimelineResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TimelineError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: TimelinesConfig = toml::from_str(&content).map_err(|e| {
            TimelineError::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> TimelineResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                TimelineError::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> TimelineResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TimelineError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            TimelineError::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Load `timelines.toml` from a data directory, creating it first if
    /// missing.
    pub fn load_or_init(dir: &Path) -> TimelineResult<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        Self::write_default_if_missing(&path)?;
        Self::from_file(&path)
    }
}
