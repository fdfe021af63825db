//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::encoding::{EncodingKind, EncodingMethod, DEFAULT_CHUNK_SIZE};
use crate::storage::database::DatabaseOptions;
use crate::storage::interval::{IntervalRule, TimeBuckets};
use crate::storage::series::DEFAULT_PART_SIZE;
use crate::storage::wal::WalSyncMode;
use crate::stream::StreamOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_root")]
    pub root: String,

    /// Used when a database is created without a schema
    #[serde(default = "default_shard_num")]
    pub shard_num: u32,

    /// `plain` or `lz4`
    #[serde(default = "default_encoding")]
    pub encoding: String,

    #[serde(default = "default_segment_interval")]
    pub segment_interval: String,

    #[serde(default = "default_block_interval")]
    pub block_interval: String,

    #[serde(default)]
    pub wal_sync: WalSyncMode,

    #[serde(default = "default_part_size")]
    pub part_size: usize,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_root() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("canopy").to_string_lossy().to_string())
        .unwrap_or_else(|| "./canopy_data".to_string())
}

fn default_shard_num() -> u32 {
    1
}

fn default_encoding() -> String {
    "plain".to_string()
}

fn default_segment_interval() -> String {
    "1d".to_string()
}

fn default_block_interval() -> String {
    "2h".to_string()
}

fn default_part_size() -> usize {
    DEFAULT_PART_SIZE
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            shard_num: default_shard_num(),
            encoding: default_encoding(),
            segment_interval: default_segment_interval(),
            block_interval: default_block_interval(),
            wal_sync: WalSyncMode::default(),
            part_size: default_part_size(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl StorageConfig {
    pub fn encoding_method(&self) -> Result<EncodingMethod, ConfigError> {
        let kind: EncodingKind = self
            .encoding
            .parse()
            .map_err(|e| ConfigError::invalid("storage.encoding", e))?;
        Ok(EncodingMethod::for_kind(kind, self.chunk_size))
    }

    pub fn intervals(&self) -> Result<(IntervalRule, IntervalRule), ConfigError> {
        let segment = self
            .segment_interval
            .parse()
            .map_err(|e| ConfigError::invalid("storage.segment_interval", e))?;
        let block = self
            .block_interval
            .parse()
            .map_err(|e| ConfigError::invalid("storage.block_interval", e))?;
        TimeBuckets::new(segment, block)
            .map_err(|e| ConfigError::invalid("storage.block_interval", e))?;
        Ok((segment, block))
    }

    /// Database options for `root` with the configured shard count
    pub fn database_options(&self) -> Result<DatabaseOptions, ConfigError> {
        let (segment_interval, block_interval) = self.intervals()?;
        let mut opts = DatabaseOptions::new(&self.root, self.shard_num);
        opts.encoding = self.encoding_method()?;
        opts.segment_interval = segment_interval;
        opts.block_interval = block_interval;
        opts.wal_sync = self.wal_sync;
        opts.part_size = self.part_size;
        Ok(opts)
    }

    /// Stream options; the shard count comes from the stream schema
    pub fn stream_options(&self) -> Result<StreamOptions, ConfigError> {
        let (segment_interval, block_interval) = self.intervals()?;
        Ok(StreamOptions {
            encoding: self.encoding_method()?,
            segment_interval,
            block_interval,
            wal_sync: self.wal_sync,
            part_size: self.part_size,
            ..StreamOptions::default()
        })
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("canopy").join("config.toml")),
            Some(PathBuf::from("/etc/canopy/config.toml")),
            Some(PathBuf::from("./canopy.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Check the values serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.shard_num == 0 {
            return Err(ConfigError::Invalid {
                field: "storage.shard_num".into(),
                error: "must be positive".into(),
            });
        }
        self.storage.encoding_method()?;
        self.storage.intervals()?;
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Invalid {
                field: "logging.format".into(),
                error: format!("expected pretty or json, got {}", self.logging.format),
            });
        }
        Ok(())
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Storage overrides
        if let Some(root) = var("CANOPY_ROOT") {
            self.storage.root = root;
        }
        if let Some(shard_num) = var("CANOPY_SHARD_NUM") {
            match shard_num.parse() {
                Ok(n) => self.storage.shard_num = n,
                Err(_) => tracing::warn!("Ignoring CANOPY_SHARD_NUM={:?}", shard_num),
            }
        }
        if let Some(encoding) = var("CANOPY_ENCODING") {
            self.storage.encoding = encoding;
        }

        // Logging overrides
        if let Some(level) = var("CANOPY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("CANOPY_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid value for {field}: {error}")]
    Invalid { field: String, error: String },
}

impl ConfigError {
    fn invalid(field: &str, error: impl ToString) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            error: error.to_string(),
        }
    }
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Canopy Configuration
#
# Environment variables override these settings:
# - CANOPY_ROOT
# - CANOPY_SHARD_NUM
# - CANOPY_ENCODING
# - CANOPY_LOG_LEVEL
# - CANOPY_LOG_FORMAT

[storage]
# Database root directory
root = "~/.local/share/canopy"

# Shard count for databases created without a stream schema
shard_num = 1

# Column encoding: plain or lz4
encoding = "plain"

# Segment and block windows. Fixed once a database exists.
segment_interval = "1d"
block_interval = "2h"

# WAL sync mode: every_write, batched or none
wal_sync = "batched"

# Buffered bytes that seal an open block part (0 = only on rotation/close)
part_size = 4194304

# Upper bound of one encoded chunk (bytes)
chunk_size = 1048576

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
