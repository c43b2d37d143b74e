//! Instance configuration.
//!
//! Loaded from `ceruleanlog.json` in the data directory. Unknown values for
//! the journal mode or shard time spec fail deserialization, so a bad config
//! is fatal at startup rather than a runtime surprise.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gelf::is_valid_identifier;
use crate::storage::{JournalMode, ShardTimeSpec};

/// Default staging-buffer flush interval in seconds.
pub const DEFAULT_MEMORY_BUFFER_TIME_SECONDS: u32 = 30;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read or write the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the JSON configuration.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    Validation(String),
}

/// Instance configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CeruleanConfig {
    /// Journal mode applied to newly created shard databases.
    #[serde(default)]
    pub sqlite_journal_mode: JournalMode,

    /// Shard granularity (default: week).
    #[serde(default = "default_shard_time_spec")]
    pub shard_time_spec: ShardTimeSpec,

    /// Staging-buffer flush interval; 0 selects synchronous writes.
    #[serde(default = "default_memory_buffer_time_seconds")]
    pub memory_buffer_time_seconds: u32,

    /// Additional field names that get an index when their column is
    /// created.
    #[serde(default)]
    pub index_field_list: Vec<String>,
}

fn default_shard_time_spec() -> ShardTimeSpec {
    ShardTimeSpec::Week
}

fn default_memory_buffer_time_seconds() -> u32 {
    DEFAULT_MEMORY_BUFFER_TIME_SECONDS
}

impl Default for CeruleanConfig {
    fn default() -> Self {
        CeruleanConfig {
            sqlite_journal_mode: JournalMode::Delete,
            shard_time_spec: ShardTimeSpec::Week,
            memory_buffer_time_seconds: DEFAULT_MEMORY_BUFFER_TIME_SECONDS,
            index_field_list: Vec::new(),
        }
    }
}

impl CeruleanConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to `path` as JSON.
    pub fn store(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Validate configuration values.
    ///
    /// Index field names end up inlined into `CREATE INDEX` statements, so
    /// they must satisfy the same identifier rule as ingested field names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for field in &self.index_field_list {
            if !is_valid_identifier(field) {
                return Err(ConfigError::Validation(format!(
                    "invalid index field name: '{field}'"
                )));
            }
        }
        Ok(())
    }
}
