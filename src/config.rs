//! Configuration management for quota-pacer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, ThrottleError};

/// Prefix for environment overrides, e.g. `QUOTA_PACER__LOGGING__LEVEL=debug`.
const ENV_PREFIX: &str = "QUOTA_PACER";

/// Main configuration for quota-pacer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named limiters, each enforcing its own quota
    #[serde(default = "default_limiters")]
    pub limiters: BTreeMap<String, LimiterConfig>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            limiters: default_limiters(),
        }
    }
}

/// Public and private endpoint quotas, each kept 20 below the remote's published
/// ceiling of 150 and 140 requests per second.
fn default_limiters() -> BTreeMap<String, LimiterConfig> {
    BTreeMap::from([
        ("public".to_string(), LimiterConfig::new(130, 1000)),
        ("private".to_string(), LimiterConfig::new(120, 1000)),
    ])
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Quota for a single limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum tasks admitted per interval
    pub limit: u32,

    /// Interval length in milliseconds
    pub interval_ms: u64,

    /// Pending tasks allowed before new submissions are held back
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

fn default_max_queue_size() -> usize {
    1000
}

impl LimiterConfig {
    /// Create a limiter configuration with the default queue size.
    pub fn new(limit: u32, interval_ms: u64) -> Self {
        Self {
            limit,
            interval_ms,
            max_queue_size: default_max_queue_size(),
        }
    }

    /// Replace the queue size.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// The interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Reject zero limits, intervals and queue sizes.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(ThrottleError::Config("limit must be positive".to_string()));
        }
        if self.interval_ms == 0 {
            return Err(ThrottleError::Config("interval_ms must be positive".to_string()));
        }
        if self.max_queue_size == 0 {
            return Err(ThrottleError::Config(
                "max_queue_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl ThrottleConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `QUOTA_PACER__*` environment overrides.
    ///
    /// Both layers sit on top of the defaults, so an override can change a
    /// single field of a default limiter. A file that lists its own `limiters`
    /// replaces the default set instead of extending it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut seed = ThrottleConfig::default();
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            let file = config::File::from(path)
                .format(config::FileFormat::Yaml)
                .required(true);

            let file_settings = config::Config::builder()
                .add_source(file.clone())
                .build()?;
            if file_settings.get_table("limiters").is_ok() {
                seed.limiters.clear();
            }
            builder = builder.add_source(file);
        }

        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&seed)?)
            .add_source(builder.build()?)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ThrottleConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ThrottleConfig = serde_yaml::from_str(yaml)
            .map_err(|e| ThrottleError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every configured limiter.
    pub fn validate(&self) -> Result<()> {
        if self.limiters.is_empty() {
            return Err(ThrottleError::Config("no limiters configured".to_string()));
        }
        for (name, limiter) in &self.limiters {
            limiter.validate().map_err(|e| e.for_limiter(name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limiters() {
        let config = ThrottleConfig::default();
        assert_eq!(config.limiters["public"], LimiterConfig::new(130, 1000));
        assert_eq!(config.limiters["private"], LimiterConfig::new(120, 1000));
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_applies_defaults() {
        let yaml = r#"
logging:
  level: debug
  format: json
limiters:
  orders:
    limit: 5
    interval_ms: 250
"#;
        let config = ThrottleConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);

        let orders = &config.limiters["orders"];
        assert_eq!(orders.limit, 5);
        assert_eq!(orders.interval(), Duration::from_millis(250));
        assert_eq!(orders.max_queue_size, 1000);
        assert!(!config.limiters.contains_key("public"));
    }

    #[test]
    fn test_from_yaml_without_limiters_uses_defaults() {
        let config = ThrottleConfig::from_yaml("logging:\n  level: warn\n").unwrap();
        assert_eq!(config.limiters.len(), 2);
    }

    #[test]
    fn test_from_yaml_rejects_zero_limit() {
        let yaml = "limiters:\n  broken:\n    limit: 0\n    interval_ms: 1000\n";
        let err = ThrottleConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ThrottleError::Config(_)));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_limiter_config_validation() {
        assert!(LimiterConfig::new(1, 1).validate().is_ok());
        assert!(LimiterConfig::new(0, 1000).validate().is_err());
        assert!(LimiterConfig::new(10, 0).validate().is_err());
        assert!(LimiterConfig::new(10, 1000)
            .with_max_queue_size(0)
            .validate()
            .is_err());
    }

    /// Serializes tests that read or write `QUOTA_PACER__*` variables.
    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    #[test]
    fn test_load_without_file_uses_defaults() {
        let _env = ENV_LOCK.lock();

        let config = ThrottleConfig::load(None).unwrap();
        assert_eq!(config.limiters, default_limiters());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_overrides_single_default_field() {
        let _env = ENV_LOCK.lock();
        std::env::set_var("QUOTA_PACER__LIMITERS__PUBLIC__LIMIT", "5");
        std::env::set_var("QUOTA_PACER__LOGGING__LEVEL", "debug");

        let loaded = ThrottleConfig::load(None);
        std::env::remove_var("QUOTA_PACER__LIMITERS__PUBLIC__LIMIT");
        std::env::remove_var("QUOTA_PACER__LOGGING__LEVEL");

        let config = loaded.unwrap();
        let public = &config.limiters["public"];
        assert_eq!(public.limit, 5);
        assert_eq!(public.interval_ms, 1000);
        assert_eq!(public.max_queue_size, 1000);
        assert_eq!(config.limiters["private"], LimiterConfig::new(120, 1000));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_env_overrides_file_limiter() {
        let _env = ENV_LOCK.lock();
        let path = std::env::temp_dir().join(format!("quota-pacer-env-{}.yaml", std::process::id()));
        std::fs::write(&path, "limiters:\n  search:\n    limit: 3\n    interval_ms: 500\n").unwrap();
        std::env::set_var("QUOTA_PACER__LIMITERS__SEARCH__MAX_QUEUE_SIZE", "9");

        let loaded = ThrottleConfig::load(Some(&path));
        std::env::remove_var("QUOTA_PACER__LIMITERS__SEARCH__MAX_QUEUE_SIZE");
        std::fs::remove_file(&path).unwrap();

        let search = &loaded.unwrap().limiters["search"];
        assert_eq!(search.limit, 3);
        assert_eq!(search.max_queue_size, 9);
    }

    #[test]
    fn test_load_from_file() {
        let _env = ENV_LOCK.lock();
        let path = std::env::temp_dir().join(format!("quota-pacer-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "limiters:\n  search:\n    limit: 3\n    interval_ms: 500\n    max_queue_size: 7\n",
        )
        .unwrap();

        let config = ThrottleConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        let search = &config.limiters["search"];
        assert_eq!(search.limit, 3);
        assert_eq!(search.max_queue_size, 7);
        assert!(!config.limiters.contains_key("public"));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let _env = ENV_LOCK.lock();
        let path = std::env::temp_dir().join("quota-pacer-does-not-exist.yaml");
        assert!(matches!(
            ThrottleConfig::load(Some(&path)),
            Err(ThrottleError::Settings(_))
        ));
    }
}
