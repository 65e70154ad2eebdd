//! Configuration models for mailsift.
//!
//! Every tunable of the two phases lives here. Values come from a TOML file;
//! anything omitted falls back to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for mailsift.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Phase 1 (extraction) settings
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Phase 2 (delivery) settings
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Remote system-of-record endpoint
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Run report output
    #[serde(default)]
    pub reports: ReportConfig,
}

/// Extraction phase configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Checkpoint file for the extraction phase
    #[serde(default = "default_extraction_checkpoint")]
    pub checkpoint_path: PathBuf,

    /// Save the checkpoint every N successfully processed units
    #[serde(default = "default_save_interval")]
    pub checkpoint_save_interval: usize,

    /// Show a progress bar on stderr
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

fn default_extraction_checkpoint() -> PathBuf {
    PathBuf::from("data/bulk_checkpoint.json")
}

fn default_save_interval() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: default_extraction_checkpoint(),
            checkpoint_save_interval: default_save_interval(),
            show_progress: true,
        }
    }
}

/// Delivery phase configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Checkpoint file for the delivery phase
    #[serde(default = "default_delivery_checkpoint")]
    pub checkpoint_path: PathBuf,

    /// Records per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Fixed pause between batches, in seconds
    #[serde(default = "default_rate_limit_delay")]
    pub rate_limit_delay_secs: f64,

    /// Total attempts per batch when a batch reports zero successes
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff before attempt `n` (0-based) is `n * backoff_unit_secs`
    #[serde(default = "default_backoff_unit")]
    pub backoff_unit_secs: f64,

    /// Show a progress bar on stderr
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

fn default_delivery_checkpoint() -> PathBuf {
    PathBuf::from("data/upload_checkpoint.json")
}

fn default_batch_size() -> usize {
    50
}

fn default_rate_limit_delay() -> f64 {
    1.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_unit() -> f64 {
    2.0
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: default_delivery_checkpoint(),
            batch_size: default_batch_size(),
            rate_limit_delay_secs: default_rate_limit_delay(),
            max_retries: default_max_retries(),
            backoff_unit_secs: default_backoff_unit(),
            show_progress: true,
        }
    }
}

impl DeliveryConfig {
    /// Pause between batches.
    pub fn rate_limit_delay(&self) -> Duration {
        seconds(self.rate_limit_delay_secs)
    }

    /// Backoff step between retry attempts.
    pub fn backoff_unit(&self) -> Duration {
        seconds(self.backoff_unit_secs)
    }
}

/// Zero for negative or unrepresentable values; `validate` rejects those.
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::ZERO)
}

/// Remote endpoint configuration for the HTTP delivery sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL of the records API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Object (collection) the records are inserted into
    #[serde(default = "default_object")]
    pub object: String,

    /// API key; supports ${VAR} expansion
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080/api/v1".to_string()
}

fn default_object() -> String {
    "Article".to_string()
}

fn default_api_key_env() -> String {
    "MAILSIFT_API_KEY".to_string()
}

fn default_timeout() -> u64 {
    60
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            object: default_object(),
            api_key: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Where run reports are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Directory for JSON and text reports
    #[serde(default = "default_report_dir")]
    pub dir: PathBuf,

    /// Disable writing report files (summary is still printed)
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("reports")
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            dir: default_report_dir(),
            enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delivery.batch_size == 0 {
            return Err(ConfigError::Invalid("delivery.batch_size must be > 0".into()));
        }
        if self.delivery.max_retries == 0 {
            return Err(ConfigError::Invalid("delivery.max_retries must be > 0".into()));
        }
        for (name, secs) in [
            ("delivery.rate_limit_delay_secs", self.delivery.rate_limit_delay_secs),
            ("delivery.backoff_unit_secs", self.delivery.backoff_unit_secs),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a finite number >= 0, got {secs}"
                )));
            }
        }
        if self.extraction.checkpoint_save_interval == 0 {
            return Err(ConfigError::Invalid(
                "extraction.checkpoint_save_interval must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the endpoint API key from config or environment.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.endpoint.api_key {
            return Ok(expand_env_vars(key));
        }

        std::env::var(&self.endpoint.api_key_env).map_err(|_| ConfigError::MissingApiKey {
            env_var: self.endpoint.api_key_env.clone(),
        })
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax. Unset variables are left as-is.
pub fn expand_env_vars(s: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }
    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API key: set {env_var} env var or endpoint.api_key in config")]
    MissingApiKey { env_var: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
