//! The shard registry plus the two operations that span shards: the commit
//! pipeline on the write path and the fan-out query planner on the read path.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::gelf::GelfMessage;
use crate::storage::shard::{JournalMode, QueryRow, Shard, sorted_contains, sorted_insert};
use crate::storage::timespec::ShardTimeSpec;
use crate::storage::StorageError;

#[derive(Debug)]
struct CollectionInner {
    /// Shards loaded in memory, keyed by id.
    shards: HashMap<u32, Arc<Shard>>,
    /// All shard names known on disk, sorted. Lexical order is
    /// chronological order because every name starts with the year.
    names: Vec<String>,
}

/// Registry of time-partitioned shards under one directory.
///
/// Carries its own copies of the config fields it needs (time spec, journal
/// mode, index list) instead of a back-reference to the owning instance.
#[derive(Debug)]
pub struct ShardCollection {
    shards_dir: PathBuf,
    time_spec: ShardTimeSpec,
    journal_mode: JournalMode,
    index_fields: Vec<String>,
    inner: RwLock<CollectionInner>,
}

impl ShardCollection {
    /// Open a collection rooted at `shards_dir`, enumerating existing shard
    /// directories into the sorted name list. Databases are opened lazily on
    /// first access.
    pub(crate) fn open(
        shards_dir: PathBuf,
        time_spec: ShardTimeSpec,
        journal_mode: JournalMode,
        index_fields: Vec<String>,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(&shards_dir)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&shards_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                sorted_insert(&mut names, entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(ShardCollection {
            shards_dir,
            time_spec,
            journal_mode,
            index_fields,
            inner: RwLock::new(CollectionInner {
                shards: HashMap::new(),
                names,
            }),
        })
    }

    /// The shard containing `ts`, opened or created on demand.
    pub fn shard_for_timestamp(&self, ts: u32) -> Result<Arc<Shard>, StorageError> {
        let (name, id) = self.time_spec.name_and_id(ts);
        self.shard_by_name_id(&name, id)
    }

    /// Look up a shard by its decoded name and id, opening it if needed.
    ///
    /// The whole open sequence (mkdir, open, DDL or reflection, install)
    /// runs under the collection write lock, which doubles as the
    /// single-flight guard: concurrent callers for the same missing id
    /// serialize here, and the second one hits the re-check. Shard creation
    /// is rare, once per time bucket.
    pub fn shard_by_name_id(&self, name: &str, id: u32) -> Result<Arc<Shard>, StorageError> {
        {
            let inner = self.read_lock()?;
            if let Some(shard) = inner.shards.get(&id) {
                return Ok(Arc::clone(shard));
            }
        }

        let mut inner = self.write_lock()?;
        if let Some(shard) = inner.shards.get(&id) {
            return Ok(Arc::clone(shard));
        }

        let shard = Arc::new(Shard::open(
            &self.shards_dir,
            name,
            id,
            self.journal_mode,
        )?);
        if !sorted_contains(&inner.names, name) {
            sorted_insert(&mut inner.names, name.to_string());
        }
        inner.shards.insert(id, Arc::clone(&shard));
        Ok(shard)
    }

    /// The lexicographically (and therefore chronologically) first known
    /// shard: `(name, start_ts, id)`.
    pub fn earliest_shard(&self) -> Result<(String, u32, u32), StorageError> {
        let inner = self.read_lock()?;
        let name = inner.names.first().ok_or(StorageError::NoShards)?;
        let (ts, id) = self.time_spec.parse_name(name)?;
        Ok((name.clone(), ts, id))
    }

    /// Commit an ordered batch of messages, grouping contiguous runs with
    /// the same destination shard into a single transaction.
    ///
    /// Timestamp normalization happens here, for both the committer path and
    /// the synchronous path: a zero timestamp becomes the current UTC time.
    pub fn commit_messages(&self, messages: &mut [GelfMessage]) -> Result<(), StorageError> {
        let now = now_unix();
        for msg in messages.iter_mut() {
            if msg.timestamp == 0 {
                msg.timestamp = now;
            }
        }

        let mut start = 0;
        while start < messages.len() {
            let shard = self.shard_for_timestamp(messages[start].timestamp)?;
            let mut end = start + 1;
            while end < messages.len() {
                let (_, id) = self.time_spec.name_and_id(messages[end].timestamp);
                if id != shard.id() {
                    break;
                }
                end += 1;
            }
            shard.insert_batch(&messages[start..end], &self.index_fields)?;
            start = end;
        }
        Ok(())
    }

    /// Time-range query across shards.
    ///
    /// `t_from` is clamped to the earliest known shard; an empty predicate
    /// becomes the always-true `1`. Shards are visited in time order with a
    /// shrinking limit budget; a query error on one shard is logged and that
    /// shard skipped, so the result may be partial. Rows are globally
    /// timestamp-ascending because buckets are disjoint.
    ///
    /// The predicate is an operator-supplied raw SQL fragment, appended
    /// verbatim after the built-in range filter.
    pub fn query(
        &self,
        t_from: u32,
        t_to: u32,
        limit: u32,
        predicate: &str,
    ) -> Result<Vec<QueryRow>, StorageError> {
        let t_from = match self.earliest_shard() {
            Ok((_, first_ts, _)) => t_from.max(first_ts),
            Err(StorageError::NoShards) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let predicate = if predicate.is_empty() { "1" } else { predicate };
        let base = format!(
            "SELECT * FROM data WHERE timestamp BETWEEN {t_from} AND {t_to} AND ({predicate}) ORDER BY timestamp"
        );

        let mut result = Vec::new();
        for (name, id) in self.time_spec.ids_in_range(t_from, t_to) {
            if result.len() >= limit as usize {
                break;
            }
            let shard = self.shard_by_name_id(&name, id)?;
            let remaining = limit as usize - result.len();
            match shard.query_rows(&format!("{base} LIMIT {remaining}")) {
                Ok(mut rows) => result.append(&mut rows),
                Err(e) => {
                    tracing::warn!(shard = %name, error = %e, "query failed on shard, skipping");
                }
            }
        }
        Ok(result)
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, CollectionInner>, StorageError> {
        self.inner
            .read()
            .map_err(|e| StorageError::Internal(format!("collection lock poisoned: {e}")))
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, CollectionInner>, StorageError> {
        self.inner
            .write()
            .map_err(|e| StorageError::Internal(format!("collection lock poisoned: {e}")))
    }
}

fn now_unix() -> u32 {
    Utc::now().timestamp().clamp(0, i64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::shard::CellValue;
    use tempfile::tempdir;

    fn collection(dir: &std::path::Path, spec: ShardTimeSpec) -> ShardCollection {
        ShardCollection::open(
            dir.join("shards"),
            spec,
            JournalMode::Delete,
            Vec::new(),
        )
        .unwrap()
    }

    fn message(short_message: &str, timestamp: u32) -> GelfMessage {
        GelfMessage {
            host: "h".to_string(),
            short_message: short_message.to_string(),
            timestamp,
            ..Default::default()
        }
    }

    #[test]
    fn test_weekly_commit_at_iso_year_boundary() {
        let dir = tempdir().unwrap();
        let sc = collection(dir.path(), ShardTimeSpec::Week);

        let mut messages = vec![
            message("a", 1_609_372_800), // 2020-12-31, week 53 of 2020
            message("b", 1_609_459_200), // 2021-01-01, still week 53 of 2020
            message("c", 1_609_804_800), // 2021-01-05, week 1 of 2021
        ];
        sc.commit_messages(&mut messages).unwrap();

        assert!(dir.path().join("shards/2020-W53/shard.db").exists());
        assert!(dir.path().join("shards/2021-W01/shard.db").exists());

        let w53 = sc.shard_by_name_id("2020-W53", 202053).unwrap();
        assert_eq!(w53.query_rows("SELECT * FROM data").unwrap().len(), 2);
        let w01 = sc.shard_by_name_id("2021-W01", 202101).unwrap();
        assert_eq!(w01.query_rows("SELECT * FROM data").unwrap().len(), 1);

        let (name, ts, id) = sc.earliest_shard().unwrap();
        assert_eq!(name, "2020-W53");
        assert_eq!(ts, 1_609_113_600);
        assert_eq!(id, 202053);
    }

    #[test]
    fn test_query_merge_and_limit() {
        let dir = tempdir().unwrap();
        let sc = collection(dir.path(), ShardTimeSpec::Day);

        let t = 1_700_006_400; // midnight UTC
        let mut messages = Vec::new();
        for i in 0..10 {
            messages.push(message("a", t + i));
        }
        for i in 0..10 {
            messages.push(message("b", t + 86_400 + i));
        }
        sc.commit_messages(&mut messages).unwrap();

        let rows = sc.query(t, t + 86_410, 15, "1").unwrap();
        assert_eq!(rows.len(), 15);

        let timestamps: Vec<i64> = rows
            .iter()
            .map(|r| match r["timestamp"] {
                CellValue::Integer(v) => v,
                _ => panic!("timestamp must be an integer"),
            })
            .collect();
        for pair in timestamps.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        // All ten rows of the first day, then the earliest five of the next.
        assert_eq!(timestamps[0], i64::from(t));
        assert_eq!(timestamps[9], i64::from(t) + 9);
        assert_eq!(timestamps[10], i64::from(t) + 86_400);
        assert_eq!(timestamps[14], i64::from(t) + 86_404);
        // Range containment.
        for ts in &timestamps {
            assert!(*ts >= i64::from(t) && *ts <= i64::from(t) + 86_410);
        }
    }

    #[test]
    fn test_query_empty_predicate_and_limit_zero() {
        let dir = tempdir().unwrap();
        let sc = collection(dir.path(), ShardTimeSpec::Day);
        let t = 1_700_006_400;
        sc.commit_messages(&mut [message("a", t)]).unwrap();

        let rows = sc.query(t - 100, t + 100, 10, "").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(sc.query(t - 100, t + 100, 0, "").unwrap().is_empty());
    }

    #[test]
    fn test_query_skips_failing_shard() {
        let dir = tempdir().unwrap();
        let sc = collection(dir.path(), ShardTimeSpec::Day);

        let t = 1_700_006_400;
        let mut with_latency = message("a", t);
        with_latency
            .additional_numbers
            .insert("latency".to_string(), 3.5);
        sc.commit_messages(&mut [with_latency]).unwrap();
        sc.commit_messages(&mut [message("b", t + 86_400)]).unwrap();

        // The second shard has no latency column; its query errors and is
        // skipped, the first shard's rows still come back.
        let rows = sc.query(t, t + 86_400 + 100, 10, "latency >= 0").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["latency"], CellValue::Real(3.5));
    }

    #[test]
    fn test_query_with_no_shards() {
        let dir = tempdir().unwrap();
        let sc = collection(dir.path(), ShardTimeSpec::Week);
        assert!(sc.query(0, 2_000_000_000, 100, "1").unwrap().is_empty());
        assert!(matches!(
            sc.earliest_shard().unwrap_err(),
            StorageError::NoShards
        ));
    }

    #[test]
    fn test_query_materializes_empty_buckets() {
        let dir = tempdir().unwrap();
        let sc = collection(dir.path(), ShardTimeSpec::Day);
        let t = 1_700_006_400;
        sc.commit_messages(&mut [message("a", t)]).unwrap();

        let rows = sc.query(t, t + 86_400 + 100, 10, "1").unwrap();
        assert_eq!(rows.len(), 1);
        // The day after has no data but was opened by the planner.
        assert!(dir.path().join("shards/2023-11-16/shard.db").exists());
    }

    #[test]
    fn test_timestamp_normalization_at_commit() {
        let dir = tempdir().unwrap();
        let sc = collection(dir.path(), ShardTimeSpec::Day);

        let mut messages = vec![message("unset", 0)];
        sc.commit_messages(&mut messages).unwrap();
        let stamped = messages[0].timestamp;
        assert!(stamped > 1_700_000_000);

        let rows = sc
            .query(stamped - 10, stamped + 10, 10, "1")
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["timestamp"], CellValue::Integer(i64::from(stamped)));
    }

    #[test]
    fn test_names_survive_reopen() {
        let dir = tempdir().unwrap();
        let t = 1_700_006_400;
        {
            let sc = collection(dir.path(), ShardTimeSpec::Day);
            sc.commit_messages(&mut [message("a", t), message("b", t + 86_400)])
                .unwrap();
        }

        let sc = collection(dir.path(), ShardTimeSpec::Day);
        let (name, _, id) = sc.earliest_shard().unwrap();
        assert_eq!(name, "2023-11-15");
        assert_eq!(id, 19676);

        let rows = sc.query(t, t + 2 * 86_400, 10, "1").unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_earliest_shard_rejects_foreign_directory() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("shards/junk")).unwrap();
        let sc = collection(dir.path(), ShardTimeSpec::Week);
        assert!(matches!(
            sc.earliest_shard().unwrap_err(),
            StorageError::ShardName { .. }
        ));
    }
}
