use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::jobs::MaintenanceConfig;
use crate::subscription::{
    AccessConfig, AdminConfig, NotificationConfig, RetryPolicy, ReturnUrls, StatusResolver,
    SyncConfig, DEFAULT_REDIRECT_PATH,
};
use crate::utils::parse_env_with_prefix;

/// Main configuration for the subscription engine
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub access: AccessSettings,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub webhooks: WebhookSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Trial, grace and notification timing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleSettings {
    #[serde(default = "default_trial_days")]
    pub trial_days: u32,
    #[serde(default = "default_grace_window_hours")]
    pub grace_window_hours: u32,
    /// Days added by the bulk trial extension.
    #[serde(default = "default_trial_extension_days")]
    pub trial_extension_days: u32,
    #[serde(default = "default_renewal_lookahead_days")]
    pub renewal_lookahead_days: u32,
    #[serde(default = "default_expired_retention_days")]
    pub expired_retention_days: u32,
    #[serde(default = "default_impersonation_ttl_secs")]
    pub impersonation_ttl_secs: u64,
    /// Absolute base URL used for checkout/portal return targets and links in notices.
    #[serde(default = "default_app_base_url")]
    pub app_base_url: String,
}

/// Processor sync and retry settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncSettings {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_processor_timeout_secs")]
    pub processor_timeout_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    #[serde(default = "default_health_stale_after_hours")]
    pub health_stale_after_hours: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccessSettings {
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
    #[serde(default = "default_redirect_path")]
    pub redirect_path: String,
}

/// Processor webhook verification. The signing secret itself is passed to
/// the engine builder and never stored here.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookSettings {
    /// Maximum age of a signature timestamp.
    #[serde(default = "default_webhook_tolerance_secs")]
    pub tolerance_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            trial_days: default_trial_days(),
            grace_window_hours: default_grace_window_hours(),
            trial_extension_days: default_trial_extension_days(),
            renewal_lookahead_days: default_renewal_lookahead_days(),
            expired_retention_days: default_expired_retention_days(),
            impersonation_ttl_secs: default_impersonation_ttl_secs(),
            app_base_url: default_app_base_url(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            processor_timeout_secs: default_processor_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
            batch_limit: default_batch_limit(),
            health_stale_after_hours: default_health_stale_after_hours(),
        }
    }
}

impl Default for AccessSettings {
    fn default() -> Self {
        Self {
            fail_open: default_fail_open(),
            redirect_path: default_redirect_path(),
        }
    }
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            tolerance_secs: default_webhook_tolerance_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_trial_days() -> u32 {
    14
}

fn default_grace_window_hours() -> u32 {
    48
}

fn default_trial_extension_days() -> u32 {
    7
}

fn default_renewal_lookahead_days() -> u32 {
    3
}

fn default_expired_retention_days() -> u32 {
    30
}

fn default_impersonation_ttl_secs() -> u64 {
    3600
}

fn default_app_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_processor_timeout_secs() -> u64 {
    30
}

fn default_stale_after_secs() -> u64 {
    3600
}

fn default_batch_limit() -> usize {
    50
}

fn default_health_stale_after_hours() -> u32 {
    24
}

fn default_fail_open() -> bool {
    true
}

fn default_redirect_path() -> String {
    DEFAULT_REDIRECT_PATH.to_string()
}

fn default_webhook_tolerance_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn resolver(&self) -> StatusResolver {
        StatusResolver::new(chrono::Duration::hours(i64::from(self.lifecycle.grace_window_hours)))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .max_retries(self.sync.max_retries)
            .base_delay_ms(self.sync.base_delay_ms)
            .max_delay_ms(self.sync.max_delay_ms)
            .timeout_seconds(self.sync.processor_timeout_secs)
    }

    pub fn admin_config(&self) -> AdminConfig {
        AdminConfig {
            trial_length: chrono::Duration::days(i64::from(self.lifecycle.trial_days)),
            bulk_trial_extension_days: self.lifecycle.trial_extension_days,
            expired_retention: chrono::Duration::days(i64::from(self.lifecycle.expired_retention_days)),
            retry: self.retry_policy(),
            return_urls: ReturnUrls::for_base_url(&self.lifecycle.app_base_url),
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            pool_size: self.sync.pool_size,
            stale_after: chrono::Duration::seconds(secs_i64(self.sync.stale_after_secs)),
            batch_limit: self.sync.batch_limit,
            retry: self.retry_policy(),
        }
    }

    pub fn access_config(&self) -> AccessConfig {
        AccessConfig {
            fail_open: self.access.fail_open,
            redirect_path: self.access.redirect_path.clone(),
        }
    }

    pub fn notification_config(&self) -> NotificationConfig {
        NotificationConfig {
            renewal_lookahead: chrono::Duration::days(i64::from(self.lifecycle.renewal_lookahead_days)),
            subscription_page_url: format!(
                "{}/dashboard/subscription/",
                self.lifecycle.app_base_url.trim_end_matches('/')
            ),
        }
    }

    pub fn impersonation_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lifecycle.impersonation_ttl_secs)
    }

    pub fn health_stale_after(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.sync.health_stale_after_hours))
    }

    pub fn webhook_tolerance(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.webhooks.tolerance_secs))
    }
}

fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Configuration errors surfaced by [`ConfigBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
    errors: Vec<ConfigError>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            errors: Vec::new(),
        }
    }

    pub fn with_trial_days(mut self, days: u32) -> Self {
        self.config.lifecycle.trial_days = days;
        self
    }

    pub fn with_grace_window_hours(mut self, hours: u32) -> Self {
        self.config.lifecycle.grace_window_hours = hours;
        self
    }

    pub fn with_trial_extension_days(mut self, days: u32) -> Self {
        self.config.lifecycle.trial_extension_days = days;
        self
    }

    pub fn with_renewal_lookahead_days(mut self, days: u32) -> Self {
        self.config.lifecycle.renewal_lookahead_days = days;
        self
    }

    pub fn with_impersonation_ttl_secs(mut self, secs: u64) -> Self {
        self.config.lifecycle.impersonation_ttl_secs = secs;
        self
    }

    pub fn with_app_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.lifecycle.app_base_url = url.into();
        self
    }

    pub fn with_sync_pool_size(mut self, pool_size: usize) -> Self {
        self.config.sync.pool_size = pool_size;
        self
    }

    pub fn with_sync(mut self, sync: SyncSettings) -> Self {
        self.config.sync = sync;
        self
    }

    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.config.access.fail_open = fail_open;
        self
    }

    pub fn with_redirect_path(mut self, path: impl Into<String>) -> Self {
        self.config.access.redirect_path = path.into();
        self
    }

    pub fn with_maintenance(mut self, maintenance: MaintenanceConfig) -> Self {
        self.config.maintenance = maintenance;
        self
    }

    pub fn with_webhook_tolerance_secs(mut self, secs: u64) -> Self {
        self.config.webhooks.tolerance_secs = secs;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    /// Load configuration from environment variables with SUBGATE_ prefix
    ///
    /// Unset variables keep their current value. Values that fail to parse are
    /// reported by [`build`](Self::build).
    pub fn from_env(mut self) -> Self {
        let errors = &mut self.errors;
        let lifecycle = &mut self.config.lifecycle;
        read_env(errors, "TRIAL_DAYS", &mut lifecycle.trial_days);
        read_env(errors, "GRACE_WINDOW_HOURS", &mut lifecycle.grace_window_hours);
        read_env(errors, "TRIAL_EXTENSION_DAYS", &mut lifecycle.trial_extension_days);
        read_env(errors, "RENEWAL_LOOKAHEAD_DAYS", &mut lifecycle.renewal_lookahead_days);
        read_env(errors, "EXPIRED_RETENTION_DAYS", &mut lifecycle.expired_retention_days);
        read_env(errors, "IMPERSONATION_TTL_SECS", &mut lifecycle.impersonation_ttl_secs);
        read_env(errors, "APP_BASE_URL", &mut lifecycle.app_base_url);

        let sync = &mut self.config.sync;
        read_env(errors, "SYNC_POOL_SIZE", &mut sync.pool_size);
        read_env(errors, "SYNC_MAX_RETRIES", &mut sync.max_retries);
        read_env(errors, "SYNC_BASE_DELAY_MS", &mut sync.base_delay_ms);
        read_env(errors, "SYNC_MAX_DELAY_MS", &mut sync.max_delay_ms);
        read_env(errors, "PROCESSOR_TIMEOUT_SECS", &mut sync.processor_timeout_secs);
        read_env(errors, "SYNC_STALE_AFTER_SECS", &mut sync.stale_after_secs);
        read_env(errors, "SYNC_BATCH_LIMIT", &mut sync.batch_limit);
        read_env(errors, "HEALTH_STALE_AFTER_HOURS", &mut sync.health_stale_after_hours);

        read_env(errors, "FAIL_OPEN", &mut self.config.access.fail_open);
        read_env(errors, "REDIRECT_PATH", &mut self.config.access.redirect_path);

        self.config.maintenance.read_env(errors);

        read_env(errors, "WEBHOOK_TOLERANCE_SECS", &mut self.config.webhooks.tolerance_secs);

        read_env(errors, "LOG_LEVEL", &mut self.config.logging.level);
        read_env(errors, "LOG_JSON", &mut self.config.logging.json);

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns the first unparseable environment value, or a validation
    /// failure: zero trial length, zero pool size, zero extension days, zero
    /// impersonation TTL, zero webhook tolerance, a redirect path not starting
    /// with `/`, an invalid base URL, an unknown log level or inverted retry delays.
    pub fn build(self) -> Result<Config, ConfigError> {
        if let Some(error) = self.errors.into_iter().next() {
            return Err(error);
        }
        let config = self.config;

        if config.lifecycle.trial_days == 0 {
            return Err(ConfigError::Invalid("trial length must be at least one day".to_string()));
        }
        if config.lifecycle.trial_extension_days == 0 {
            return Err(ConfigError::Invalid(
                "trial extension must be at least one day".to_string(),
            ));
        }
        if config.lifecycle.impersonation_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "impersonation TTL must be greater than 0".to_string(),
            ));
        }
        if url::Url::parse(&config.lifecycle.app_base_url).is_err() {
            return Err(ConfigError::Invalid(format!(
                "app base URL is not an absolute URL: {}",
                config.lifecycle.app_base_url
            )));
        }
        if config.sync.pool_size == 0 {
            return Err(ConfigError::Invalid("sync pool size must be greater than 0".to_string()));
        }
        if config.sync.base_delay_ms > config.sync.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "sync base delay ({}ms) exceeds max delay ({}ms)",
                config.sync.base_delay_ms, config.sync.max_delay_ms
            )));
        }
        if config.webhooks.tolerance_secs == 0 {
            return Err(ConfigError::Invalid(
                "webhook tolerance must be greater than 0".to_string(),
            ));
        }
        if !config.access.redirect_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "redirect path must start with '/': {}",
                config.access.redirect_path
            )));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level: {}. Must be one of: {}",
                config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        config.maintenance.validate()?;

        Ok(config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Overwrite `slot` with the parsed `SUBGATE_{key}`/`{key}` value when set.
pub(crate) fn read_env<T: FromStr>(errors: &mut Vec<ConfigError>, key: &str, slot: &mut T) {
    match parse_env_with_prefix::<T>(key) {
        Ok(Some(value)) => *slot = value,
        Ok(None) => {}
        Err((key, value)) => errors.push(ConfigError::InvalidValue { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.lifecycle.trial_days, 14);
        assert_eq!(config.sync.pool_size, 4);
        assert!(config.access.fail_open);
        assert_eq!(config.access.redirect_path, DEFAULT_REDIRECT_PATH);

        assert_eq!(config.admin_config().trial_length, chrono::Duration::days(14));
        assert_eq!(config.sync_config().stale_after, chrono::Duration::hours(1));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.impersonation_ttl().as_secs(), 3600);
        assert_eq!(config.webhook_tolerance(), chrono::Duration::seconds(300));
        assert_eq!(
            config.notification_config().subscription_page_url,
            "http://localhost:8000/dashboard/subscription/"
        );
    }

    #[test]
    fn test_validation() {
        assert!(ConfigBuilder::new().with_sync_pool_size(0).build().is_err());
        assert!(ConfigBuilder::new().with_trial_extension_days(0).build().is_err());
        assert!(ConfigBuilder::new().with_impersonation_ttl_secs(0).build().is_err());
        assert!(ConfigBuilder::new().with_redirect_path("dashboard").build().is_err());
        assert!(ConfigBuilder::new().with_app_base_url("not a url").build().is_err());
        assert!(ConfigBuilder::new().with_log_level("loud").build().is_err());
        assert!(ConfigBuilder::new().with_webhook_tolerance_secs(0).build().is_err());
    }

    #[test]
    fn test_from_env() {
        unsafe {
            std::env::set_var("SUBGATE_TRIAL_DAYS", "30");
            std::env::set_var("SUBGATE_FAIL_OPEN", "false");
        }
        let config = ConfigBuilder::new().from_env().build().unwrap();
        unsafe {
            std::env::remove_var("SUBGATE_TRIAL_DAYS");
            std::env::remove_var("SUBGATE_FAIL_OPEN");
        }
        assert_eq!(config.lifecycle.trial_days, 30);
        assert!(!config.access.fail_open);
    }

    #[test]
    fn test_unparseable_env_is_reported() {
        unsafe {
            std::env::set_var("SUBGATE_SYNC_BATCH_LIMIT", "lots");
        }
        let result = ConfigBuilder::new().from_env().build();
        unsafe {
            std::env::remove_var("SUBGATE_SYNC_BATCH_LIMIT");
        }
        assert_eq!(
            result.unwrap_err(),
            ConfigError::InvalidValue {
                key: "SYNC_BATCH_LIMIT".to_string(),
                value: "lots".to_string()
            }
        );
    }
}
