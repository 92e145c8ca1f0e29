//! Pipeline configuration
//!
//! Loaded from TOML; every section and field has a default so an empty or
//! missing file yields a runnable configuration.

use std::{path::Path, time::Duration};

use log::info;
use serde::{Deserialize, Serialize};

use crate::controls::policy::PolicyPresets;
use crate::error::ConfigError;
use crate::pipeline::{transport::RequestHeaders, worker::RetryPolicy};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub controls: ControlsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Who is sending; becomes the request headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_user_id")]
    pub user_id: String,

    #[serde(default)]
    pub auth_token: String,

    #[serde(default = "default_device_id")]
    pub device_id: String,

    #[serde(default = "default_app_id")]
    pub app_id: String,

    #[serde(default = "default_os_version")]
    pub os_version: String,

    /// IANA name
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_events_path")]
    pub events_path: String,

    #[serde(default = "default_controls_path")]
    pub controls_path: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
}

/// Local policy presets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlsConfig {
    #[serde(default = "default_aggressive_interval")]
    pub aggressive_interval_secs: u64,

    #[serde(default = "default_aggressive_ttl")]
    pub aggressive_ttl_secs: u64,

    #[serde(default = "default_aggressive_displacement")]
    pub aggressive_displacement_m: f64,

    #[serde(default = "default_passive_interval")]
    pub passive_interval_secs: u64,

    /// 0 = never expires
    #[serde(default)]
    pub passive_ttl_secs: u64,

    #[serde(default = "default_passive_displacement")]
    pub passive_displacement_m: f64,

    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// How long `on_background` waits for in-flight batches.
    #[serde(default = "default_background_allowance")]
    pub background_allowance_secs: u64,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,

    #[serde(default = "default_summary_csv")]
    pub summary_csv: String,
}

// Defaults
fn default_user_id() -> String { "anonymous".to_string() }
fn default_device_id() -> String { "device-1".to_string() }
fn default_app_id() -> String { "tracking-pipeline".to_string() }
fn default_os_version() -> String { std::env::consts::OS.to_string() }
fn default_timezone() -> String { "UTC".to_string() }
fn default_endpoint() -> String { "http://127.0.0.1:8080".to_string() }
fn default_events_path() -> String { "/v1/events".to_string() }
fn default_controls_path() -> String { "/v1/controls".to_string() }
fn default_timeout_secs() -> u64 { 30 }
fn default_max_retries() -> u32 { crate::pipeline::worker::DEFAULT_MAX_RETRIES }
fn default_backoff_base() -> f64 { crate::pipeline::worker::DEFAULT_BACKOFF_BASE }
fn default_aggressive_interval() -> u64 { 5 }
fn default_aggressive_ttl() -> u64 { 600 }
fn default_aggressive_displacement() -> f64 { 10.0 }
fn default_passive_interval() -> u64 { 300 }
fn default_passive_displacement() -> f64 { 50.0 }
fn default_bus_capacity() -> usize { 64 }
fn default_batch_size() -> usize { 50 }
fn default_background_allowance() -> u64 { 25 }
fn default_shutdown_grace() -> u64 { 5 }
fn default_store_path() -> String { "data/events.sqlite".to_string() }
fn default_summary_csv() -> String { "data/logs/transmission_summary.csv".to_string() }

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            auth_token: String::new(),
            device_id: default_device_id(),
            app_id: default_app_id(),
            os_version: default_os_version(),
            timezone: default_timezone(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            events_path: default_events_path(),
            controls_path: default_controls_path(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
        }
    }
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            aggressive_interval_secs: default_aggressive_interval(),
            aggressive_ttl_secs: default_aggressive_ttl(),
            aggressive_displacement_m: default_aggressive_displacement(),
            passive_interval_secs: default_passive_interval(),
            passive_ttl_secs: 0,
            passive_displacement_m: default_passive_displacement(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { batch_size: default_batch_size() }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            background_allowance_secs: default_background_allowance(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            summary_csv: default_summary_csv(),
        }
    }
}

impl PipelineConfig {
    /// Reads `path`, or returns defaults when it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            info!("[Config] {} not found, using defaults", path.display());
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.batch_size == 0 {
            return Err(ConfigError::Invalid("scheduler.batch_size must be at least 1".into()));
        }
        if self.controls.aggressive_interval_secs == 0 || self.controls.passive_interval_secs == 0 {
            return Err(ConfigError::Invalid("controls intervals must be at least 1 second".into()));
        }
        if self.transport.backoff_base.is_nan() || self.transport.backoff_base <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "transport.backoff_base must be greater than 1 (got {})",
                self.transport.backoff_base
            )));
        }
        if self.transport.timeout_secs == 0 {
            return Err(ConfigError::Invalid("transport.timeout_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn presets(&self) -> PolicyPresets {
        PolicyPresets {
            aggressive_interval_secs: self.controls.aggressive_interval_secs,
            aggressive_ttl_secs: self.controls.aggressive_ttl_secs,
            aggressive_displacement_m: self.controls.aggressive_displacement_m,
            passive_interval_secs: self.controls.passive_interval_secs,
            passive_ttl_secs: self.controls.passive_ttl_secs,
            passive_displacement_m: self.controls.passive_displacement_m,
            batch_size: self.scheduler.batch_size,
        }
    }

    pub fn headers(&self) -> RequestHeaders {
        RequestHeaders {
            auth_token: self.identity.auth_token.clone(),
            device_id: self.identity.device_id.clone(),
            app_id: self.identity.app_id.clone(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            os_version: self.identity.os_version.clone(),
            timezone: self.identity.timezone.clone(),
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.transport.max_retries,
            backoff_base: self.transport.backoff_base,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.timeout_secs)
    }

    pub fn background_allowance(&self) -> Duration {
        Duration::from_secs(self.lifecycle.background_allowance_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.lifecycle.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.presets(), PolicyPresets::default());
        assert_eq!(config.retry(), RetryPolicy::default());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            [identity]
            user_id = "u-42"
            auth_token = "secret"

            [scheduler]
            batch_size = 20
            "#,
        )
        .unwrap();
        assert_eq!(config.identity.user_id, "u-42");
        assert_eq!(config.identity.timezone, "UTC");
        assert_eq!(config.scheduler.batch_size, 20);
        assert_eq!(config.transport.max_retries, 5);
        assert_eq!(config.headers().auth_token, "secret");
        assert_eq!(config.presets().batch_size, 20);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut c = PipelineConfig::default();
        c.scheduler.batch_size = 0;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = PipelineConfig::default();
        c.controls.passive_interval_secs = 0;
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::default();
        c.transport.backoff_base = 1.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[scheduler\nbatch_size = ").unwrap();
        assert!(matches!(PipelineConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}
