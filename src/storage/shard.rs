//! A single time-partitioned shard: one SQLite database under
//! `<shards-dir>/<name>/shard.db`.
//!
//! Each shard owns its connection plus the reflected schema: the sorted set
//! of `data` columns and the sorted set of indexed columns. Schema is
//! reconstructed from the database itself on reopen (`PRAGMA table_info`,
//! `index_list`, `index_info`), so the on-disk format stays the single
//! source of truth.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::Value;
use rusqlite::{Connection, Transaction, params_from_iter};
use serde::{Deserialize, Serialize};

use crate::gelf::GelfMessage;
use crate::storage::StorageError;

/// SQLite journal mode applied when a shard database is first created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    Wal,
    #[default]
    Delete,
    Memory,
}

impl JournalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            JournalMode::Wal => "wal",
            JournalMode::Delete => "delete",
            JournalMode::Memory => "memory",
        }
    }
}

/// One typed cell of a query result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Text(String),
    Integer(i64),
    Real(f64),
    Null,
}

/// A query result row: column name to typed cell.
pub type QueryRow = BTreeMap<String, CellValue>;

/// Fixed schema for a freshly created shard.
const DATA_TABLE_DDL: &str = r#"
CREATE TABLE data (
    id            INTEGER PRIMARY KEY,
    timestamp     INTEGER NOT NULL,
    facility      TEXT,
    host          TEXT,
    full_message  TEXT,
    short_message TEXT
);
CREATE INDEX idx_data_timestamp ON data(timestamp);
CREATE INDEX idx_data_host ON data(host);
CREATE INDEX idx_data_facility ON data(facility);
"#;

/// Columns of a fresh `data` table, excluding the synthetic primary key.
/// Must stay sorted.
const SEED_DATA_FIELDS: [&str; 5] = [
    "facility",
    "full_message",
    "host",
    "short_message",
    "timestamp",
];

/// Indexed columns of a fresh `data` table. Must stay sorted.
const SEED_INDEXED_FIELDS: [&str; 3] = ["facility", "host", "timestamp"];

#[derive(Debug)]
struct ShardState {
    conn: Connection,
    /// Columns present in `data`, sorted for binary search.
    data_fields: Vec<String>,
    /// Columns backed by an index, sorted for binary search.
    indexed_fields: Vec<String>,
}

/// One on-disk time partition.
#[derive(Debug)]
pub struct Shard {
    id: u32,
    name: String,
    state: Mutex<ShardState>,
}

impl Shard {
    /// Open the shard database under `<shards_dir>/<name>/`, creating the
    /// directory, the database, and the fixed schema when absent.
    ///
    /// The journal-mode pragma is applied on creation only; an existing
    /// database keeps whatever mode it was created with.
    pub(crate) fn open(
        shards_dir: &Path,
        name: &str,
        id: u32,
        journal_mode: JournalMode,
    ) -> Result<Shard, StorageError> {
        let dir = shards_dir.join(name);
        fs::create_dir_all(&dir)?;
        let db_path = dir.join("shard.db");
        let existed = db_path.exists();

        let conn = Connection::open(&db_path)?;

        let (data_fields, indexed_fields) = if existed {
            reflect_schema(&conn)?
        } else {
            let _mode: String = conn.query_row(
                &format!("PRAGMA journal_mode={}", journal_mode.as_str()),
                [],
                |row| row.get(0),
            )?;
            conn.execute_batch(DATA_TABLE_DDL)?;
            tracing::info!(shard = name, path = %db_path.display(), "created shard database");
            (
                SEED_DATA_FIELDS.iter().map(|s| s.to_string()).collect(),
                SEED_INDEXED_FIELDS.iter().map(|s| s.to_string()).collect(),
            )
        };

        Ok(Shard {
            id,
            name: name.to_string(),
            state: Mutex::new(ShardState {
                conn,
                data_fields,
                indexed_fields,
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the sorted `data` column set (without the primary key).
    pub fn data_fields(&self) -> Vec<String> {
        self.lock().map(|s| s.data_fields.clone()).unwrap_or_default()
    }

    /// Snapshot of the sorted indexed column set.
    pub fn indexed_fields(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.indexed_fields.clone())
            .unwrap_or_default()
    }

    /// Insert a contiguous run of messages in one transaction, evolving the
    /// schema on demand.
    ///
    /// Column names in `index_fields` get an index created alongside the
    /// column. Schema additions become visible in `data_fields` /
    /// `indexed_fields` only after the transaction commits; a rolled-back
    /// batch leaves the in-memory sets matching the database.
    pub(crate) fn insert_batch(
        &self,
        messages: &[GelfMessage],
        index_fields: &[String],
    ) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let ShardState {
            conn,
            data_fields,
            indexed_fields,
        } = &mut *state;

        let mut fields = data_fields.clone();
        let mut indexed = indexed_fields.clone();

        let tx = conn.transaction()?;
        for msg in messages {
            insert_message(&tx, &self.name, &mut fields, &mut indexed, index_fields, msg)?;
        }
        tx.commit()?;

        *data_fields = fields;
        *indexed_fields = indexed;
        Ok(())
    }

    /// Run a SELECT against this shard and marshal the result set.
    ///
    /// Cells are decoded by the declared type of their column: `TEXT` to
    /// string, `INTEGER` to i64, `NUMERIC` to f64. Any other declared type
    /// fails the whole shard query.
    pub(crate) fn query_rows(&self, sql: &str) -> Result<Vec<QueryRow>, StorageError> {
        tracing::debug!(shard = %self.name, sql, "shard query");
        let state = self.lock()?;
        let mut stmt = state.conn.prepare(sql)?;

        let columns: Vec<(String, Option<String>)> = stmt
            .columns()
            .iter()
            .map(|c| {
                (
                    c.name().to_string(),
                    c.decl_type().map(str::to_ascii_uppercase),
                )
            })
            .collect();

        let mut result = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut out = QueryRow::new();
            for (i, (name, decl)) in columns.iter().enumerate() {
                let cell = match decl.as_deref() {
                    Some("TEXT") => row
                        .get::<_, Option<String>>(i)?
                        .map_or(CellValue::Null, CellValue::Text),
                    Some("INTEGER") => row
                        .get::<_, Option<i64>>(i)?
                        .map_or(CellValue::Null, CellValue::Integer),
                    Some("NUMERIC") => row
                        .get::<_, Option<f64>>(i)?
                        .map_or(CellValue::Null, CellValue::Real),
                    other => {
                        return Err(StorageError::UnknownColumnType(
                            other.unwrap_or("<none>").to_string(),
                        ));
                    }
                };
                out.insert(name.clone(), cell);
            }
            result.push(out);
        }
        Ok(result)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ShardState>, StorageError> {
        self.state
            .lock()
            .map_err(|e| StorageError::Internal(format!("shard lock poisoned: {e}")))
    }
}

/// Insert one message on an open transaction.
///
/// Additional fields missing from the schema are added first: `NUMERIC` for
/// numeric fields, `TEXT` for string fields, `NUMERIC` winning when a name
/// appears in both maps. Values are parameter-bound; identifiers are inlined
/// and must already satisfy the ingest identifier rule.
fn insert_message(
    tx: &Transaction<'_>,
    shard_name: &str,
    fields: &mut Vec<String>,
    indexed: &mut Vec<String>,
    index_fields: &[String],
    msg: &GelfMessage,
) -> Result<(), StorageError> {
    let mut new_columns: BTreeMap<&str, &'static str> = BTreeMap::new();
    for name in msg.additional_numbers.keys() {
        if !sorted_contains(fields, name) {
            new_columns.insert(name.as_str(), "NUMERIC");
        }
    }
    for name in msg.additional_strings.keys() {
        if !sorted_contains(fields, name) && !new_columns.contains_key(name.as_str()) {
            new_columns.insert(name.as_str(), "TEXT");
        }
    }

    for (name, column_type) in new_columns {
        tx.execute(&format!("ALTER TABLE data ADD COLUMN {name} {column_type}"), [])?;
        tracing::info!(shard = shard_name, column = name, column_type, "added column");
        sorted_insert(fields, name.to_string());
        if index_fields.iter().any(|f| f.as_str() == name) {
            tx.execute(&format!("CREATE INDEX idx_data_{name} ON data({name})"), [])?;
            sorted_insert(indexed, name.to_string());
        }
    }

    let mut values: Vec<Value> = Vec::with_capacity(fields.len());
    for column in fields.iter() {
        let value = match column.as_str() {
            "full_message" => Value::Text(msg.full_message.clone()),
            "host" => Value::Text(msg.host.clone()),
            "short_message" => Value::Text(msg.short_message.clone()),
            "facility" => Value::Text(msg.facility.clone()),
            "timestamp" => Value::Integer(i64::from(msg.timestamp)),
            _ => {
                if let Some(n) = msg.additional_numbers.get(column) {
                    Value::Real(*n)
                } else {
                    match msg.additional_strings.get(column) {
                        Some(s) if !s.is_empty() => Value::Text(s.clone()),
                        _ => Value::Null,
                    }
                }
            }
        };
        values.push(value);
    }

    let placeholders = vec!["?"; fields.len()].join(",");
    let sql = format!(
        "INSERT INTO data({}) VALUES({})",
        fields.join(","),
        placeholders
    );
    tx.execute(&sql, params_from_iter(values))?;
    Ok(())
}

/// Reconstruct the column and index sets from an existing database.
fn reflect_schema(conn: &Connection) -> Result<(Vec<String>, Vec<String>), StorageError> {
    let mut data_fields = Vec::new();
    {
        let mut stmt = conn.prepare("PRAGMA table_info(data)")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let column: String = row.get(1)?;
            if column != "id" {
                sorted_insert(&mut data_fields, column);
            }
        }
    }

    let mut index_names = Vec::new();
    {
        let mut stmt = conn.prepare("PRAGMA index_list(data)")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            index_names.push(row.get::<_, String>(1)?);
        }
    }

    let mut indexed_fields = Vec::new();
    for index in index_names {
        let mut stmt = conn.prepare(&format!("PRAGMA index_info({index})"))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            if let Some(column) = row.get::<_, Option<String>>(2)? {
                if !sorted_contains(&indexed_fields, &column) {
                    sorted_insert(&mut indexed_fields, column);
                }
            }
        }
    }

    Ok((data_fields, indexed_fields))
}

/// Binary-search membership in a sorted slice.
pub(crate) fn sorted_contains(sorted: &[String], name: &str) -> bool {
    sorted.binary_search_by(|e| e.as_str().cmp(name)).is_ok()
}

/// Insert into a sorted vector, keeping it sorted.
pub(crate) fn sorted_insert(sorted: &mut Vec<String>, name: String) {
    if let Err(idx) = sorted.binary_search(&name) {
        sorted.insert(idx, name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn message(host: &str, short_message: &str, timestamp: u32) -> GelfMessage {
        GelfMessage {
            host: host.to_string(),
            short_message: short_message.to_string(),
            timestamp,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_seeds_schema() {
        let dir = tempdir().unwrap();
        let shard = Shard::open(dir.path(), "2023-11-14", 19675, JournalMode::Delete).unwrap();

        assert_eq!(shard.id(), 19675);
        assert_eq!(shard.name(), "2023-11-14");
        assert_eq!(
            shard.data_fields(),
            vec!["facility", "full_message", "host", "short_message", "timestamp"]
        );
        assert_eq!(shard.indexed_fields(), vec!["facility", "host", "timestamp"]);
        assert!(dir.path().join("2023-11-14/shard.db").exists());
    }

    #[test]
    fn test_dynamic_column_addition() {
        let dir = tempdir().unwrap();
        let shard = Shard::open(dir.path(), "2023-11-14", 19675, JournalMode::Delete).unwrap();

        let mut msg = message("h", "s", 1_700_000_000);
        msg.additional_numbers.insert("latency".to_string(), 12.5);
        msg.additional_strings
            .insert("region".to_string(), "eu".to_string());
        shard.insert_batch(&[msg], &[]).unwrap();

        assert_eq!(
            shard.data_fields(),
            vec![
                "facility",
                "full_message",
                "host",
                "latency",
                "region",
                "short_message",
                "timestamp"
            ]
        );

        let rows = shard
            .query_rows("SELECT * FROM data ORDER BY timestamp")
            .unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row["host"], CellValue::Text("h".to_string()));
        assert_eq!(row["short_message"], CellValue::Text("s".to_string()));
        assert_eq!(row["timestamp"], CellValue::Integer(1_700_000_000));
        assert_eq!(row["latency"], CellValue::Real(12.5));
        assert_eq!(row["region"], CellValue::Text("eu".to_string()));
    }

    #[test]
    fn test_numeric_wins_on_name_collision() {
        let dir = tempdir().unwrap();
        let shard = Shard::open(dir.path(), "2023-11-14", 19675, JournalMode::Delete).unwrap();

        let mut msg = message("h", "s", 1_700_000_000);
        msg.additional_numbers.insert("code".to_string(), 7.0);
        msg.additional_strings
            .insert("code".to_string(), "seven".to_string());
        shard.insert_batch(&[msg], &[]).unwrap();

        // The column is NUMERIC and the numeric value wins the cell too.
        let rows = shard.query_rows("SELECT * FROM data").unwrap();
        assert_eq!(rows[0]["code"], CellValue::Real(7.0));
    }

    #[test]
    fn test_empty_additional_string_stored_as_null() {
        let dir = tempdir().unwrap();
        let shard = Shard::open(dir.path(), "2023-11-14", 19675, JournalMode::Delete).unwrap();

        let mut first = message("h", "one", 1_700_000_000);
        first
            .additional_strings
            .insert("note".to_string(), String::new());
        let second = message("h", "two", 1_700_000_001);
        shard.insert_batch(&[first, second], &[]).unwrap();

        let rows = shard
            .query_rows("SELECT * FROM data ORDER BY timestamp")
            .unwrap();
        assert_eq!(rows[0]["note"], CellValue::Null);
        assert_eq!(rows[1]["note"], CellValue::Null);
    }

    #[test]
    fn test_quote_round_trip() {
        let dir = tempdir().unwrap();
        let shard = Shard::open(dir.path(), "2023-11-14", 19675, JournalMode::Delete).unwrap();

        let msg = message("h", "it's a test", 1_700_000_000);
        shard.insert_batch(&[msg], &[]).unwrap();

        let rows = shard
            .query_rows("SELECT * FROM data WHERE short_message = 'it''s a test'")
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0]["short_message"],
            CellValue::Text("it's a test".to_string())
        );
    }

    #[test]
    fn test_reflection_on_reopen() {
        let dir = tempdir().unwrap();
        {
            let shard = Shard::open(dir.path(), "2023-11-14", 19675, JournalMode::Delete).unwrap();
            let mut msg = message("h", "s", 1_700_000_000);
            msg.additional_numbers.insert("latency".to_string(), 1.0);
            msg.additional_strings
                .insert("region".to_string(), "eu".to_string());
            shard
                .insert_batch(&[msg], &["latency".to_string()])
                .unwrap();
        }

        let shard = Shard::open(dir.path(), "2023-11-14", 19675, JournalMode::Delete).unwrap();
        assert_eq!(
            shard.data_fields(),
            vec![
                "facility",
                "full_message",
                "host",
                "latency",
                "region",
                "short_message",
                "timestamp"
            ]
        );
        // The configured index on latency is reflected back from disk.
        assert_eq!(
            shard.indexed_fields(),
            vec!["facility", "host", "latency", "timestamp"]
        );

        // Reopened shards accept further writes against the reflected schema.
        let msg = message("h2", "later", 1_700_000_002);
        shard.insert_batch(&[msg], &[]).unwrap();
        let rows = shard.query_rows("SELECT * FROM data").unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_failed_batch_leaves_schema_sets_consistent() {
        let dir = tempdir().unwrap();
        let shard = Shard::open(dir.path(), "2023-11-14", 19675, JournalMode::Delete).unwrap();

        // A column name that bypassed ingest validation breaks the ALTER;
        // the in-memory field set must not drift from the rolled-back schema.
        let mut bad = message("h", "s", 1_700_000_000);
        bad.additional_numbers.insert("not a column".to_string(), 1.0);
        assert!(shard.insert_batch(&[bad], &[]).is_err());

        assert_eq!(
            shard.data_fields(),
            vec!["facility", "full_message", "host", "short_message", "timestamp"]
        );

        let good = message("h", "s", 1_700_000_000);
        shard.insert_batch(&[good], &[]).unwrap();
        assert_eq!(shard.query_rows("SELECT * FROM data").unwrap().len(), 1);
    }

    #[test]
    fn test_sorted_helpers() {
        let mut v = Vec::new();
        for name in ["m", "a", "z", "m"] {
            sorted_insert(&mut v, name.to_string());
        }
        assert_eq!(v, vec!["a", "m", "z"]);
        assert!(sorted_contains(&v, "m"));
        assert!(!sorted_contains(&v, "q"));
    }
}
