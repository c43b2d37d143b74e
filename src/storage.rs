//! Storage layer: time-partitioned SQLite shards.
//!
//! # Components
//!
//! - [`ShardTimeSpec`]: the reversible timestamp-to-bucket policy
//! - [`Shard`]: one on-disk partition with dynamic schema evolution
//! - [`ShardCollection`]: lazy shard registry, commit pipeline, query planner
//! - [`Committer`] / [`CommitterHandle`]: the background flush actor over
//!   the in-memory staging buffer

mod buffer;
mod collection;
mod error;
mod shard;
mod timespec;

pub use buffer::{Committer, CommitterHandle};
pub use collection::ShardCollection;
pub use error::StorageError;
pub use shard::{CellValue, JournalMode, QueryRow, Shard};
pub use timespec::ShardTimeSpec;

pub(crate) use buffer::MsgBuffer;
