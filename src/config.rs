//! Configuration management for the admission limiters.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};
use crate::ratelimit::TimeWindow;

/// Prefix for environment overrides, e.g. `ADMISSION__TOKEN_BUCKET__PERMITS_PER_SECOND=5`.
const ENV_PREFIX: &str = "ADMISSION";

/// Main configuration, one section per limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Fixed-window limiter configuration
    #[serde(default)]
    pub fixed_window: FixedWindowConfig,

    /// Leaky-bucket limiter configuration
    #[serde(default)]
    pub leaky_bucket: LeakyBucketConfig,

    /// Token-bucket limiter configuration
    #[serde(default)]
    pub token_bucket: TokenBucketConfig,

    /// Distributed limiter configuration
    #[serde(default)]
    pub distributed: DistributedConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Fixed-window limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedWindowConfig {
    /// Calls admitted per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length
    #[serde(default)]
    pub window: TimeWindow,
}

impl Default for FixedWindowConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window: TimeWindow::default(),
        }
    }
}

/// Leaky-bucket limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakyBucketConfig {
    /// Maximum number of waiting callers
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Releases per second
    #[serde(default = "default_rate")]
    pub rate: f64,
}

impl Default for LeakyBucketConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            rate: default_rate(),
        }
    }
}

/// Token-bucket limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Permits issued per second
    #[serde(default = "default_rate")]
    pub permits_per_second: f64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            permits_per_second: default_rate(),
        }
    }
}

/// Distributed limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Store key holding the shared counter
    #[serde(default = "default_key")]
    pub key: String,

    /// Calls admitted per second across all processes
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Redis URL; the in-memory store is used when unset
    pub redis_url: Option<String>,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            key: default_key(),
            limit: default_limit(),
            redis_url: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `admission=debug`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_limit() -> u64 {
    10
}

fn default_capacity() -> usize {
    10
}

fn default_rate() -> f64 {
    1.0
}

fn default_key() -> String {
    "admission:limit".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AdmissionConfig {
    /// Load configuration from an optional file, overridden by
    /// `ADMISSION__<SECTION>__<FIELD>` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| LimiterError::Config(e.to_string()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AdmissionConfig::default();
        assert_eq!(config.fixed_window.limit, 10);
        assert_eq!(config.fixed_window.window, TimeWindow::Second);
        assert_eq!(config.leaky_bucket.capacity, 10);
        assert_eq!(config.token_bucket.permits_per_second, 1.0);
        assert_eq!(config.distributed.key, "admission:limit");
        assert!(config.distributed.redis_url.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
fixed_window:
  limit: 5
  window: minute
token_bucket:
  permits_per_second: 0.5
distributed:
  key: orders
  redis_url: redis://127.0.0.1:6379/
"#;
        let config = AdmissionConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.fixed_window.limit, 5);
        assert_eq!(config.fixed_window.window, TimeWindow::Minute);
        assert_eq!(config.token_bucket.permits_per_second, 0.5);
        assert_eq!(config.distributed.key, "orders");
        assert_eq!(config.distributed.limit, 10);
        assert_eq!(
            config.distributed.redis_url.as_deref(),
            Some("redis://127.0.0.1:6379/")
        );
        assert_eq!(config.leaky_bucket.rate, 1.0);
    }

    #[test]
    fn test_invalid_yaml() {
        let err = AdmissionConfig::from_yaml("fixed_window:\n  limit: lots\n").unwrap_err();
        assert!(matches!(err, LimiterError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("admission-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "leaky_bucket:\n  capacity: 3\n  rate: 5.0\n").unwrap();

        let config = AdmissionConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.leaky_bucket.capacity, 3);
        assert_eq!(config.leaky_bucket.rate, 5.0);
        assert_eq!(config.fixed_window.limit, 10);
    }
}
