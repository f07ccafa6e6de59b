//! Pipeline configuration
//!
//! Loaded once at startup from JSON, YAML or TOML (chosen by file extension).
//! Every section has defaults so a partial file is enough.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Configuration file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Detect config format from file extension
    pub fn detect(path: &Path) -> Self {
        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            Some("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub ingress: IngressConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub encoder: EncoderConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub quota: QuotaConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load and validate configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ConfigNotFound(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        let format = ConfigFormat::detect(path);
        let config = Self::parse(&content, format)?;
        if let Err(e) = config.validate() {
            warn!(path = %path.display(), "Rejected config file: {}", e);
            return Err(e);
        }
        debug!(path = %path.display(), ?format, "Loaded config file");
        Ok(config)
    }

    /// Parse configuration without validating it
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        match format {
            ConfigFormat::Json => serde_json::from_str(content)
                .map_err(|e| Error::Config(format!("JSON parse error: {}", e))),
            ConfigFormat::Yaml => serde_yaml::from_str(content)
                .map_err(|e| Error::Config(format!("YAML parse error: {}", e))),
            ConfigFormat::Toml => toml::from_str(content)
                .map_err(|e| Error::Config(format!("TOML parse error: {}", e))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.ingress
            .validate()
            .and_then(|_| self.log.validate())
            .and_then(|_| self.metrics.validate())
            .and_then(|_| self.encoder.validate())
            .and_then(|_| self.upload.validate())
            .and_then(|_| self.quota.validate())
            .map_err(Error::ConfigValidation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Capacity of the ingestion queue; readings beyond it are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Minimum spacing between accepted readings of one scalar metric
    #[serde(default)]
    pub min_interval_ms: u64,

    /// Minimum spacing between accepted location fixes
    #[serde(default = "default_location_min_interval_ms")]
    pub location_min_interval_ms: u64,

    /// Fixes closer than this to the last accepted fix are discarded
    #[serde(default = "default_location_min_distance_m")]
    pub location_min_distance_m: f64,

    /// A fix is accepted regardless of distance once this much time has passed
    #[serde(default = "default_location_keepalive_ms")]
    pub location_keepalive_ms: u64,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            min_interval_ms: 0,
            location_min_interval_ms: default_location_min_interval_ms(),
            location_min_distance_m: default_location_min_distance_m(),
            location_keepalive_ms: default_location_keepalive_ms(),
        }
    }
}

impl IngressConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("ingress.queue_capacity must be at least 1".to_string());
        }
        if !self.location_min_distance_m.is_finite() || self.location_min_distance_m < 0.0 {
            return Err("ingress.location_min_distance_m must be a non-negative number".to_string());
        }
        Ok(())
    }
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_location_min_interval_ms() -> u64 {
    1000
}

fn default_location_min_distance_m() -> f64 {
    2.0
}

fn default_location_keepalive_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory holding one subdirectory per session log
    #[serde(default = "default_log_root")]
    pub root: PathBuf,

    /// Flush the active chunk at least this often
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Flush as soon as the active chunk holds this many entries
    #[serde(default = "default_max_chunk_entries")]
    pub max_chunk_entries: usize,

    /// Attempts per chunk before the log degrades to memory-only
    #[serde(default = "default_flush_max_attempts")]
    pub flush_max_attempts: u32,

    #[serde(default = "default_flush_backoff_base_ms")]
    pub flush_backoff_base_ms: u64,

    #[serde(default = "default_flush_backoff_max_ms")]
    pub flush_backoff_max_ms: u64,

    /// Unfinished logs older than this are orphaned instead of resumable
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            root: default_log_root(),
            flush_interval_ms: default_flush_interval_ms(),
            max_chunk_entries: default_max_chunk_entries(),
            flush_max_attempts: default_flush_max_attempts(),
            flush_backoff_base_ms: default_flush_backoff_base_ms(),
            flush_backoff_max_ms: default_flush_backoff_max_ms(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl LogConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.flush_interval_ms == 0 {
            return Err("log.flush_interval_ms must be at least 1".to_string());
        }
        if self.max_chunk_entries == 0 {
            return Err("log.max_chunk_entries must be at least 1".to_string());
        }
        if self.flush_max_attempts == 0 {
            return Err("log.flush_max_attempts must be at least 1".to_string());
        }
        if self.flush_backoff_base_ms > self.flush_backoff_max_ms {
            return Err("log.flush_backoff_base_ms must not exceed flush_backoff_max_ms".to_string());
        }
        Ok(())
    }
}

fn default_log_root() -> PathBuf {
    PathBuf::from("pacer-data/logs")
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_max_chunk_entries() -> usize {
    300
}

fn default_flush_max_attempts() -> u32 {
    5
}

fn default_flush_backoff_base_ms() -> u64 {
    50
}

fn default_flush_backoff_max_ms() -> u64 {
    2_000
}

fn default_stale_after_secs() -> u64 {
    6 * 60 * 60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Live snapshot refresh period
    #[serde(default = "default_live_refresh_ms")]
    pub live_refresh_ms: u64,

    /// Zone upper bounds as fractions of threshold power
    #[serde(default = "default_power_zone_fractions")]
    pub power_zone_fractions: Vec<f64>,

    /// Zone upper bounds as fractions of max heart rate
    #[serde(default = "default_heart_rate_zone_fractions")]
    pub heart_rate_zone_fractions: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            live_refresh_ms: default_live_refresh_ms(),
            power_zone_fractions: default_power_zone_fractions(),
            heart_rate_zone_fractions: default_heart_rate_zone_fractions(),
        }
    }
}

fn strictly_increasing(name: &str, fractions: &[f64]) -> std::result::Result<(), String> {
    if fractions.iter().any(|f| !f.is_finite() || *f <= 0.0) {
        return Err(format!("metrics.{} must contain positive numbers", name));
    }
    if fractions.windows(2).any(|w| w[0] >= w[1]) {
        return Err(format!("metrics.{} must be strictly increasing", name));
    }
    Ok(())
}

impl MetricsConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.live_refresh_ms == 0 {
            return Err("metrics.live_refresh_ms must be at least 1".to_string());
        }
        strictly_increasing("power_zone_fractions", &self.power_zone_fractions)?;
        strictly_increasing("heart_rate_zone_fractions", &self.heart_rate_zone_fractions)
    }
}

fn default_live_refresh_ms() -> u64 {
    1_000
}

fn default_power_zone_fractions() -> Vec<f64> {
    vec![0.55, 0.75, 0.90, 1.05, 1.20, 1.50]
}

fn default_heart_rate_zone_fractions() -> Vec<f64> {
    vec![0.60, 0.70, 0.80, 0.90]
}

/// Sport written into the session summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sport {
    Generic,
    Running,
    #[default]
    Cycling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Local message slots available for definitions (1..=16)
    #[serde(default = "default_max_local_definitions")]
    pub max_local_definitions: u8,

    #[serde(default = "default_product_id")]
    pub product_id: u16,

    #[serde(default = "default_serial_number")]
    pub serial_number: u32,

    #[serde(default)]
    pub sport: Sport,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            max_local_definitions: default_max_local_definitions(),
            product_id: default_product_id(),
            serial_number: default_serial_number(),
            sport: Sport::default(),
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_local_definitions == 0 || self.max_local_definitions > 16 {
            return Err("encoder.max_local_definitions must be within 1..=16".to_string());
        }
        if self.serial_number == 0 {
            return Err("encoder.serial_number must be non-zero".to_string());
        }
        Ok(())
    }
}

fn default_max_local_definitions() -> u8 {
    16
}

fn default_product_id() -> u16 {
    1
}

fn default_serial_number() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Directory holding finalized artifacts and persisted upload tasks
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Attempts before a task moves to the dead-letter queue
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Random extra delay as a fraction of the computed backoff (0.0 disables)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Upper bound on how long the scheduler sleeps between checks
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Base URL of the HTTP object store
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter_ratio: default_jitter_ratio(),
            poll_interval_ms: default_poll_interval_ms(),
            endpoint: None,
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("upload.max_attempts must be at least 1".to_string());
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err("upload.backoff_base_ms must not exceed backoff_max_ms".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err("upload.jitter_ratio must be within 0.0..=1.0".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("upload.poll_interval_ms must be at least 1".to_string());
        }
        if let Some(endpoint) = &self.endpoint
            && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            return Err(format!("upload.endpoint '{}' must be an http(s) URL", endpoint));
        }
        Ok(())
    }
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("pacer-data/uploads")
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    5 * 60 * 1_000
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_poll_interval_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Upper bound for logs plus artifacts on disk (None = no limit)
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: Option<u64>,

    /// Run quota enforcement every N seconds
    #[serde(default = "default_quota_interval_secs")]
    pub interval_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_total_bytes: default_max_total_bytes(),
            interval_secs: default_quota_interval_secs(),
        }
    }
}

impl QuotaConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_total_bytes == Some(0) {
            return Err("quota.max_total_bytes must be at least 1".to_string());
        }
        if self.interval_secs == 0 {
            return Err("quota.interval_secs must be at least 1".to_string());
        }
        Ok(())
    }
}

fn default_max_total_bytes() -> Option<u64> {
    Some(512 * 1024 * 1024)
}

fn default_quota_interval_secs() -> u64 {
    600
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; RUST_LOG takes precedence
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

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
            [log]
            root = "/var/lib/pacer/logs"
            max_chunk_entries = 60

            [upload]
            max_attempts = 3
            endpoint = "https://store.example.com"
        "#;
        let config = PipelineConfig::parse(toml, ConfigFormat::Toml).unwrap();
        assert_eq!(config.log.root, PathBuf::from("/var/lib/pacer/logs"));
        assert_eq!(config.log.max_chunk_entries, 60);
        assert_eq!(config.log.flush_interval_ms, 5_000);
        assert_eq!(config.upload.max_attempts, 3);
        assert_eq!(config.ingress, IngressConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = "metrics:\n  power_zone_fractions: [0.5, 0.8, 1.0]\nencoder:\n  sport: running\n";
        let config = PipelineConfig::parse(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.metrics.power_zone_fractions, vec![0.5, 0.8, 1.0]);
        assert_eq!(config.encoder.sport, Sport::Running);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = PipelineConfig::default();
        config.metrics.power_zone_fractions = vec![0.9, 0.8];
        assert!(matches!(config.validate(), Err(Error::ConfigValidation(_))));

        let mut config = PipelineConfig::default();
        config.encoder.max_local_definitions = 17;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.upload.endpoint = Some("ftp://nope".to_string());
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.upload.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_detects_format() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(file, r#"{{"quota": {{"max_total_bytes": 1024}}}}"#).unwrap();
        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.quota.max_total_bytes, Some(1024));
    }

    #[test]
    fn test_from_file_validates_yaml() {
        let mut file = NamedTempFile::with_suffix(".yml").unwrap();
        write!(file, "upload:\n  max_attempts: 0\n").unwrap();
        let err = PipelineConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigValidation(_)));
    }

    #[test]
    fn test_from_file_missing() {
        let err = PipelineConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }
}
