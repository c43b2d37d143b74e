//! CeruleanLog - Self-hosted Log Engine
//!
//! This crate provides the core of the CeruleanLog log ingestion and query
//! system. It can be used as a library by other Rust projects, or run as a
//! standalone binary with the `ceruleanlog` executable.
//!
//! # Architecture
//!
//! - **GELF ingest**: JSON log messages with a fixed-field core and
//!   validated additional fields
//! - **Staging buffer**: in-memory batching with a background committer
//! - **Storage**: time-partitioned SQLite shards (year/month/week/day) with
//!   on-demand schema evolution
//! - **Query planner**: time-range fan-out across shards with a shrinking
//!   limit budget
//! - **HTTP surface**: axum adapter exposing ingest and query endpoints
//!
//! The query predicate is passed to SQL verbatim; it is an operator-only
//! feature, always applied after the built-in timestamp range filter.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ceruleanlog::{CeruleanInstance, Committer, parse_gelf};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Open (or initialise) the data directory.
//!     let instance = Arc::new(CeruleanInstance::open("./cerulean_data")?);
//!
//!     // Background committer flushes the staging buffer.
//!     let committer = Committer::spawn(Arc::clone(&instance));
//!
//!     // Ingest a message and query it back.
//!     let msg = parse_gelf(br#"{"host": "web1", "short_message": "boot", "_env": "prod"}"#)?;
//!     instance.add_message(msg)?;
//!
//!     let rows = instance.query(1_700_000_000, 1_800_000_000, 100, "host = 'web1'")?;
//!     println!("{} rows", rows.len());
//!
//!     committer.shutdown()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod gelf;
pub mod instance;
pub mod server;
pub mod storage;

// Re-export public types
pub use config::{CeruleanConfig, ConfigError};
pub use gelf::{GelfError, GelfMessage, parse_gelf};
pub use instance::{CeruleanInstance, InstanceError};
pub use storage::{
    CellValue, Committer, CommitterHandle, JournalMode, QueryRow, ShardTimeSpec, StorageError,
};
