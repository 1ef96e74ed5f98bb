//! Configuration module for Turnstile
//!
//! The configuration file is a JSON document holding the key pool, the
//! per-model budget limits, and the daily quota-reset schedule, plus the
//! server/logging sections. A missing file is created with placeholder
//! values so a first run comes up serving.

pub mod error;
pub mod logging;
pub mod server;

pub use error::ConfigError;
pub use logging::{LogFormat, LoggingConfig};
pub use server::ServerConfig;

use chrono::{NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Datetime format used by `next_quota_reset_datetime`.
pub const RESET_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Per-model token budget limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelConfig {
    /// Tokens-per-minute budget for each key
    pub tpm_limit: u64,
    /// Optional tokens-per-day budget for each key; absent means unlimited
    #[serde(default)]
    pub tpd_limit: Option<u64>,
}

/// Upstream vendor endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "https://generativelanguage.googleapis.com".to_string(),
        }
    }
}

/// Main configuration struct that holds the key pool, model budgets,
/// reset schedule, and server sub-configurations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub priority_keys: Vec<String>,
    pub secondary_keys: Vec<String>,
    pub models: HashMap<String, ModelConfig>,
    /// Daily reset time of day, "HH:MM" in `timezone`
    pub reset_after: String,
    /// Next scheduled quota reset, "YYYY-MM-DD HH:MM" in `timezone`
    pub next_quota_reset_datetime: String,
    /// IANA timezone name, e.g. "America/Los_Angeles"
    pub timezone: String,
    pub default_model: String,
    /// Path of the usage snapshot file
    #[serde(default = "default_usage_file")]
    pub usage_file: PathBuf,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_usage_file() -> PathBuf {
    PathBuf::from("key_usage.json")
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let mut models = HashMap::new();
        models.insert(
            "gemini-1.5-pro-latest".to_string(),
            ModelConfig {
                tpm_limit: 250_000,
                tpd_limit: Some(6_000_000),
            },
        );
        models.insert(
            "gemini-1.5-flash-latest".to_string(),
            ModelConfig {
                tpm_limit: 250_000,
                tpd_limit: None,
            },
        );

        let tomorrow = Utc::now().date_naive() + chrono::Days::new(1);

        Self {
            priority_keys: vec![
                "PriorityKeysHere-Key1".to_string(),
                "PriorityKeysHere-Key2".to_string(),
            ],
            secondary_keys: vec![
                "SecondaryKeysHere-Key1".to_string(),
                "SecondaryKeysHere-Key2".to_string(),
            ],
            models,
            reset_after: "01:00".to_string(),
            next_quota_reset_datetime: format!("{} 01:00", tomorrow.format("%Y-%m-%d")),
            timezone: "UTC".to_string(),
            default_model: "gemini-1.5-pro-latest".to_string(),
            usage_file: default_usage_file(),
            upstream: UpstreamConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load configuration, creating the file with placeholder defaults if
    /// it does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "Created default configuration file");
            return Ok(config);
        }
        Self::load(path)
    }

    /// Save configuration to a JSON file (pretty-printed).
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration. Schedule fields must parse and the default
    /// model must carry a budget entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.models.contains_key(&self.default_model) {
            return Err(ConfigError::Validation {
                field: "default_model".to_string(),
                message: format!("'{}' has no entry in models", self.default_model),
            });
        }

        for (name, model) in &self.models {
            if model.tpm_limit == 0 {
                return Err(ConfigError::Validation {
                    field: format!("models.{}.tpm_limit", name),
                    message: "must be a positive integer".to_string(),
                });
            }
            if model.tpd_limit == Some(0) {
                return Err(ConfigError::Validation {
                    field: format!("models.{}.tpd_limit", name),
                    message: "must be a positive integer or null".to_string(),
                });
            }
        }

        self.parsed_timezone()?;
        self.parsed_reset_after()?;
        self.parsed_next_reset()?;

        Ok(())
    }

    /// Resolve the configured IANA timezone.
    pub fn parsed_timezone(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimezone(self.timezone.clone()))
    }

    /// Parse `reset_after` ("HH:MM") as a local time of day.
    pub fn parsed_reset_after(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(&self.reset_after, "%H:%M")
            .map_err(|_| ConfigError::InvalidResetTime(self.reset_after.clone()))
    }

    /// Parse `next_quota_reset_datetime` in the configured timezone.
    pub fn parsed_next_reset(&self) -> Result<chrono::DateTime<Tz>, ConfigError> {
        let tz = self.parsed_timezone()?;
        let naive = NaiveDateTime::parse_from_str(
            &self.next_quota_reset_datetime,
            RESET_DATETIME_FORMAT,
        )
        .map_err(|_| {
            ConfigError::InvalidResetDatetime(self.next_quota_reset_datetime.clone())
        })?;
        tz.from_local_datetime(&naive).earliest().ok_or_else(|| {
            ConfigError::InvalidResetDatetime(self.next_quota_reset_datetime.clone())
        })
    }

    /// All keys in canonical order: priority keys first, then secondary.
    pub fn all_keys(&self) -> impl Iterator<Item = &String> {
        self.priority_keys.iter().chain(self.secondary_keys.iter())
    }
}
