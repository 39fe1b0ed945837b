//! Clearwell Configuration - scheduler, pipeline, storage and server settings
//!
//! Every struct implements `Default` with the values in `defaults`, so a
//! missing section or key keeps the built-in behaviour.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for a Clearwell deployment.
///
/// Load with `ClearwellConfig::load()` which searches:
/// 1. `$CLEARWELL_CONFIG` env var
/// 2. `./clearwell.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClearwellConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    /// Stage orchestration tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Model artifact location
    #[serde(default)]
    pub models: ModelsConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

impl ClearwellConfig {
    /// Load configuration using the standard search order:
    /// 1. `$CLEARWELL_CONFIG` environment variable
    /// 2. `./clearwell.toml` in the current working directory
    /// 3. Built-in defaults
    ///
    /// Environment overrides are applied on top of whichever source won.
    pub fn load() -> Self {
        let mut config = Self::load_file_or_default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    fn load_file_or_default() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var(defaults::CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded config from {}", defaults::CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", defaults::CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", defaults::CONFIG_ENV_VAR);
            }
        }

        // 2. Check ./clearwell.toml
        let local = PathBuf::from(defaults::CONFIG_FILE_NAME);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded config from ./{}", defaults::CONFIG_FILE_NAME);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", defaults::CONFIG_FILE_NAME);
                }
            }
        }

        // 3. Defaults
        info!("No {} found, using built-in defaults", defaults::CONFIG_FILE_NAME);
        Self::default()
    }

    /// Load from a specific TOML file path.
    ///
    /// Unknown keys are logged as warnings; range errors fail the load.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        // Two-pass: check for unknown keys first (warnings only)
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    ///
    /// Precedence: `CLEARWELL_INTERVAL_SECS` env var > TOML > default. An
    /// unparseable or zero value is ignored with a warning.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(defaults::INTERVAL_ENV_VAR) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => {
                    info!(interval_secs = secs, "Scheduler interval overridden by {}", defaults::INTERVAL_ENV_VAR);
                    self.scheduler.interval_secs = secs;
                }
                _ => warn!(value = %raw, "Ignoring invalid {}", defaults::INTERVAL_ENV_VAR),
            }
        }
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate all ranges, collecting every problem before failing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.scheduler.interval_secs == 0 {
            errors.push("scheduler.interval_secs must be >= 1".to_string());
        }
        if self.scanner.window_limit == 0 {
            errors.push("scanner.window_limit must be >= 1".to_string());
        }
        let workers = self.pipeline.max_concurrent_records;
        if workers == 0 || workers > defaults::MAX_CONCURRENT_RECORDS_LIMIT {
            errors.push(format!(
                "pipeline.max_concurrent_records = {workers} must be between 1 and {}",
                defaults::MAX_CONCURRENT_RECORDS_LIMIT
            ));
        }
        if self.pipeline.store_timeout_ms == 0 {
            errors.push("pipeline.store_timeout_ms must be >= 1".to_string());
        }
        if self.storage.path.as_os_str().is_empty() {
            errors.push("storage.path must not be empty".to_string());
        }
        if self.models.dir.as_os_str().is_empty() {
            errors.push("models.dir must not be empty".to_string());
        }
        if self.server.addr.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "server.addr = '{}' is not a valid socket address",
                self.server.addr
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),
    #[error("Config parse error ({}): {}", .0.display(), .1)]
    Parse(PathBuf, toml::de::Error),
    #[error("Config serialization error: {0}")]
    Serialize(toml::ser::Error),
    #[error("Config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Pause after each completed cycle (seconds).
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    defaults::SCHEDULER_INTERVAL_SECS
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Newest sensor readings fetched each cycle.
    #[serde(default = "default_window_limit")]
    pub window_limit: usize,
}

fn default_window_limit() -> usize {
    defaults::SCAN_WINDOW_LIMIT
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            window_limit: default_window_limit(),
        }
    }
}

/// Where Post-Lime takes the settled pH from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostLimeInput {
    /// Recompute Pre-Lime in memory whenever Post-Lime needs it.
    #[default]
    Recompute,
    /// Read the stored Pre-Lime prediction, recomputing only if none exists.
    Persisted,
}

impl std::fmt::Display for PostLimeInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recompute => write!(f, "recompute"),
            Self::Persisted => write!(f, "persisted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_concurrent_records")]
    pub max_concurrent_records: usize,

    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    #[serde(default)]
    pub post_lime_input: PostLimeInput,

    /// Only scan readings newer than the last failure-free cycle.
    #[serde(default)]
    pub use_watermark: bool,
}

fn default_max_concurrent_records() -> usize {
    defaults::MAX_CONCURRENT_RECORDS
}
fn default_store_timeout_ms() -> u64 {
    defaults::STORE_TIMEOUT_MS
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_records: default_max_concurrent_records(),
            store_timeout_ms: default_store_timeout_ms(),
            post_lime_input: PostLimeInput::default(),
            use_watermark: false,
        }
    }
}

impl PipelineConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Sled database directory. Overridden by `--data`.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(defaults::STORAGE_PATH)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Directory holding the JSON model artifacts. Overridden by `--models`.
    #[serde(default = "default_models_dir")]
    pub dir: PathBuf,
}

fn default_models_dir() -> PathBuf {
    PathBuf::from(defaults::MODELS_DIR)
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: default_models_dir(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server bind address.
    ///
    /// Can be overridden by the `--addr` CLI flag.
    #[serde(default = "default_server_addr")]
    pub addr: String,

    /// Run the HTTP API alongside the scheduler.
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
}

fn default_server_addr() -> String {
    defaults::SERVER_ADDR.to_string()
}
fn default_server_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
            enabled: default_server_enabled(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = ClearwellConfig::default();
        assert!(config.validate().is_ok(), "Default config must always validate");
    }

    #[test]
    fn test_empty_toml_produces_defaults() {
        let config = ClearwellConfig::from_toml_str("").unwrap();
        assert_eq!(config, ClearwellConfig::default());
        assert_eq!(config.scheduler.interval_secs, 10);
        assert_eq!(config.scanner.window_limit, 8_000);
        assert_eq!(config.pipeline.max_concurrent_records, 4);
        assert_eq!(config.pipeline.post_lime_input, PostLimeInput::Recompute);
        assert!(!config.pipeline.use_watermark);
    }

    #[test]
    fn test_partial_toml_override() {
        let config = ClearwellConfig::from_toml_str(
            r#"
            [pipeline]
            post_lime_input = "persisted"
            use_watermark = true
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline.post_lime_input, PostLimeInput::Persisted);
        assert!(config.pipeline.use_watermark);
        assert_eq!(config.pipeline.store_timeout_ms, 5_000);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = ClearwellConfig::default();
        config.scheduler.interval_secs = 0;
        config.pipeline.max_concurrent_records = 0;
        config.server.addr = "not-an-addr".to_string();
        match config.validate() {
            Err(ConfigError::Validation(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_env_override_precedence() {
        let mut config = ClearwellConfig::from_toml_str("[scheduler]\ninterval_secs = 30").unwrap();
        config.apply_env_overrides(|_| Some("5".to_string()));
        assert_eq!(config.scheduler.interval_secs, 5);

        config.apply_env_overrides(|_| Some("zero".to_string()));
        assert_eq!(config.scheduler.interval_secs, 5);

        config.apply_env_overrides(|_| None);
        assert_eq!(config.scheduler.interval_secs, 5);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = ClearwellConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(ClearwellConfig::from_toml_str(&text).unwrap(), config);
    }
}
