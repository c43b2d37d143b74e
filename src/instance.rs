//! The owning instance: one data directory, one config, one staging buffer,
//! one shard collection.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::{CeruleanConfig, ConfigError};
use crate::gelf::GelfMessage;
use crate::storage::{MsgBuffer, QueryRow, ShardCollection, StorageError};

/// Config file name inside the data directory.
const CONFIG_FILE: &str = "ceruleanlog.json";

/// Shards subdirectory inside the data directory.
const SHARDS_DIR: &str = "shards";

/// Errors opening an instance.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// A running CeruleanLog instance.
///
/// Owns the config, the staging buffer, and the shard collection. The shard
/// collection gets copies of the config fields it needs instead of a
/// back-reference; the committer thread holds an `Arc` of the whole
/// instance.
#[derive(Debug)]
pub struct CeruleanInstance {
    data_dir: PathBuf,
    config: CeruleanConfig,
    buffer: MsgBuffer,
    shards: ShardCollection,
}

impl CeruleanInstance {
    /// Open (and if needed initialise) the data directory at `data_dir`.
    ///
    /// A fresh directory gets a default `ceruleanlog.json` and an empty
    /// `shards/` subdirectory. An existing config that fails to parse or
    /// validate is fatal.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, InstanceError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if data_dir.exists() && !data_dir.is_dir() {
            return Err(InstanceError::NotADirectory(data_dir));
        }
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir)?;
            tracing::info!(dir = %data_dir.display(), "initialised data directory");
        }

        let config_path = data_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            CeruleanConfig::default().store(&config_path)?;
        }
        let config = CeruleanConfig::load(&config_path)?;

        let shards = ShardCollection::open(
            data_dir.join(SHARDS_DIR),
            config.shard_time_spec,
            config.sqlite_journal_mode,
            config.index_field_list.clone(),
        )?;

        Ok(CeruleanInstance {
            data_dir,
            config,
            buffer: MsgBuffer::new(),
            shards,
        })
    }

    /// Ingest one message into the staging buffer (or straight to the
    /// shards when `memory_buffer_time_seconds` is 0).
    pub fn add_message(&self, msg: GelfMessage) -> Result<(), StorageError> {
        self.buffer
            .add(msg, self.config.memory_buffer_time_seconds, &self.shards)
    }

    /// Run a time-range query across shards. Timestamps are UTC Unix
    /// seconds; `predicate` is a raw SQL boolean fragment under operator
    /// control, with `""` meaning no extra filtering.
    pub fn query(
        &self,
        t_from: u32,
        t_to: u32,
        limit: u32,
        predicate: &str,
    ) -> Result<Vec<QueryRow>, StorageError> {
        self.shards.query(t_from, t_to, limit, predicate)
    }

    pub fn config(&self) -> &CeruleanConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub(crate) fn buffer(&self) -> &MsgBuffer {
        &self.buffer
    }

    pub(crate) fn shards(&self) -> &ShardCollection {
        &self.shards
    }
}
