//! Configuration for the maintenance worker

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{ConfigError, read_env};

/// Schedule for background maintenance
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MaintenanceConfig {
    /// Run the maintenance worker at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds between stale-sync passes
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Seconds between daily lifecycle checks
    #[serde(default = "default_daily_interval_secs")]
    pub daily_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            sync_interval_secs: default_sync_interval_secs(),
            daily_interval_secs: default_daily_interval_secs(),
        }
    }
}

impl MaintenanceConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn daily_interval(&self) -> Duration {
        Duration::from_secs(self.daily_interval_secs)
    }

    pub(crate) fn read_env(&mut self, errors: &mut Vec<ConfigError>) {
        read_env(errors, "MAINTENANCE_ENABLED", &mut self.enabled);
        read_env(errors, "MAINTENANCE_SYNC_INTERVAL_SECS", &mut self.sync_interval_secs);
        read_env(errors, "MAINTENANCE_DAILY_INTERVAL_SECS", &mut self.daily_interval_secs);
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_interval_secs == 0 || self.daily_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "maintenance intervals must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

fn default_sync_interval_secs() -> u64 {
    900
}

fn default_daily_interval_secs() -> u64 {
    86_400
}
