//! [`KeyValueStore`] backed by an embedded `redb` database.
//!
//! Hashes live in one table keyed by `"{key}\0{field}"`, so every field of a
//! hash is a contiguous key range. Sets are a multimap table (members come
//! back sorted). Bounded lists are stored as one JSON array per key; they are
//! only used for short audit logs.
//!
//! redb is synchronous, so every call hops onto the blocking pool.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{
    Database, MultimapTableDefinition, ReadableDatabase, ReadableTable, TableDefinition,
};

use crate::error::{LetheError, Result};
use crate::kv::{KeyValueStore, WriteBatch, WriteOp};

const HASHES: TableDefinition<&str, &str> = TableDefinition::new("hashes");
const SETS: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("sets");
const LISTS: TableDefinition<&str, &str> = TableDefinition::new("lists");

const FIELD_SEPARATOR: char = '\0';

fn hash_key(key: &str, field: &str) -> String {
    format!("{key}{FIELD_SEPARATOR}{field}")
}

/// Embedded key-value store. Cloning shares the same database handle.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create a store at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create a store that lives only in memory. Data is lost on drop.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(HASHES)?;
            write_txn.open_multimap_table(SETS)?;
            write_txn.open_table(LISTS)?;
            write_txn.commit()?;
        }
        Ok(Self { db: Arc::new(db) })
    }

    /// Run `f` against the database on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    fn apply_in_txn(write_txn: &redb::WriteTransaction, ops: Vec<WriteOp>) -> Result<()> {
        let mut hashes = write_txn.open_table(HASHES)?;
        let mut sets = write_txn.open_multimap_table(SETS)?;
        let mut lists = write_txn.open_table(LISTS)?;

        for op in ops {
            match op {
                WriteOp::HashSet { key, fields } => {
                    for (field, value) in fields {
                        hashes.insert(hash_key(&key, &field).as_str(), value.as_str())?;
                    }
                }
                WriteOp::HashDelete { key, field } => {
                    hashes.remove(hash_key(&key, &field).as_str())?;
                }
                WriteOp::Expect { key, field, value } => {
                    let current: Option<String> = hashes
                        .get(hash_key(&key, &field).as_str())?
                        .map(|g| g.value().to_string());
                    if current != value {
                        return Err(LetheError::Conflict(format!(
                            "{key}.{field} changed concurrently"
                        )));
                    }
                }
                WriteOp::SetAdd { key, members } => {
                    for member in members {
                        sets.insert(key.as_str(), member.as_str())?;
                    }
                }
                WriteOp::SetRemove { key, members } => {
                    for member in members {
                        sets.remove(key.as_str(), member.as_str())?;
                    }
                }
                WriteOp::ListPush {
                    key,
                    value,
                    max_len,
                } => {
                    let existing: Option<String> =
                        lists.get(key.as_str())?.map(|g| g.value().to_string());
                    let mut entries: Vec<String> = match existing {
                        Some(raw) => serde_json::from_str(&raw)?,
                        None => Vec::new(),
                    };
                    entries.insert(0, value);
                    entries.truncate(max_len.max(1));
                    let raw = serde_json::to_string(&entries)?;
                    lists.insert(key.as_str(), raw.as_str())?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for RedbStore {
    async fn ping(&self) -> Result<()> {
        self.blocking(|db| {
            let read_txn = db
                .begin_read()
                .map_err(|e| LetheError::Unavailable(e.to_string()))?;
            read_txn
                .open_table(HASHES)
                .map_err(|e| LetheError::Unavailable(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let composite = hash_key(key, field);
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(HASHES)?;
            let value = table
                .get(composite.as_str())?
                .map(|g| g.value().to_string());
            Ok(value)
        })
        .await
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>> {
        let prefix = hash_key(key, "");
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(HASHES)?;
            let mut fields = Vec::new();
            for entry in table.range(prefix.as_str()..)? {
                let (k, v) = entry?;
                let Some(field) = k.value().strip_prefix(prefix.as_str()) else {
                    break;
                };
                fields.push((field.to_string(), v.value().to_string()));
            }
            Ok(fields)
        })
        .await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let key = key.to_string();
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let sets = read_txn.open_multimap_table(SETS)?;
            let mut members = Vec::new();
            for member in sets.get(key.as_str())? {
                members.push(member?.value().to_string());
            }
            Ok(members)
        })
        .await
    }

    async fn set_intersect(&self, keys: &[String]) -> Result<Vec<String>> {
        let keys = keys.to_vec();
        self.blocking(move |db| {
            let Some((first, rest)) = keys.split_first() else {
                return Ok(Vec::new());
            };
            let read_txn = db.begin_read()?;
            let sets = read_txn.open_multimap_table(SETS)?;

            let mut acc = BTreeSet::new();
            for member in sets.get(first.as_str())? {
                acc.insert(member?.value().to_string());
            }
            for key in rest {
                if acc.is_empty() {
                    break;
                }
                let mut other = HashSet::new();
                for member in sets.get(key.as_str())? {
                    other.insert(member?.value().to_string());
                }
                acc.retain(|m| other.contains(m));
            }
            Ok(acc.into_iter().collect())
        })
        .await
    }

    async fn set_len(&self, key: &str) -> Result<usize> {
        let key = key.to_string();
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let sets = read_txn.open_multimap_table(SETS)?;
            let mut count = 0;
            for member in sets.get(key.as_str())? {
                member?;
                count += 1;
            }
            Ok(count)
        })
        .await
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        let key = key.to_string();
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let lists = read_txn.open_table(LISTS)?;
            let raw: Option<String> = lists.get(key.as_str())?.map(|g| g.value().to_string());
            let mut entries: Vec<String> = match raw {
                Some(raw) => serde_json::from_str(&raw)?,
                None => Vec::new(),
            };
            entries.truncate(limit);
            Ok(entries)
        })
        .await
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            // Dropping the transaction on error rolls everything back.
            Self::apply_in_txn(&write_txn, batch.into_ops())?;
            write_txn.commit()?;
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
