//! Configuration management for lanwatch services.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (LANWATCH_ prefix, `__` between section and key,
//!    e.g. `LANWATCH_PRESENCE__OFFLINE_THRESHOLD=5`)
//! 2. Config file (lanwatch.toml)
//! 3. Defaults

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{LanwatchError, Result};

/// Presence classification and event queue settings (`[presence]`).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Consecutive missed sweeps before an online device becomes idle.
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold: u32,

    /// Consecutive missed sweeps before an idle device goes offline.
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold: u32,

    /// Maximum queued non-alert events before the sink starts dropping.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_idle_threshold() -> u32 {
    1
}

fn default_offline_threshold() -> u32 {
    3
}

fn default_event_queue_capacity() -> usize {
    1024
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            idle_threshold: default_idle_threshold(),
            offline_threshold: default_offline_threshold(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl PresenceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.idle_threshold == 0 {
            return Err(LanwatchError::Config(
                "presence.idle_threshold must be at least 1".to_string(),
            ));
        }
        if self.offline_threshold == 0 {
            return Err(LanwatchError::Config(
                "presence.offline_threshold must be at least 1".to_string(),
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(LanwatchError::Config(
                "presence.event_queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load one top-level section from `{file_prefix}.toml` and `LANWATCH_*`
/// environment variables. A missing file or section yields `T::default()`.
pub fn load_section<T>(file_prefix: &str, section: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("LANWATCH")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| LanwatchError::Config(e.to_string()))?;

    match cfg.get::<T>(section) {
        Ok(value) => Ok(value),
        Err(config::ConfigError::NotFound(_)) => {
            tracing::debug!(section, "Config section not present, using defaults");
            Ok(T::default())
        }
        Err(e) => Err(LanwatchError::Config(format!("[{section}]: {e}"))),
    }
}

/// Load and validate the `[presence]` section.
pub fn load_presence_config(file_prefix: &str) -> Result<PresenceConfig> {
    let presence: PresenceConfig = load_section(file_prefix, "presence")?;
    presence.validate()?;
    Ok(presence)
}
