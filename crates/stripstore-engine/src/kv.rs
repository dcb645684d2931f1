//! Ordered key-value backend
//!
//! The store talks to its backing database through the narrow [`KeyValueDb`]
//! trait: point reads, ordered prefix scans, and atomic batch commit. The
//! shipped implementation is [`RedbStore`], a single-table redb database.

use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use stripstore_common::{Error, Result};
use tracing::debug;

/// All rows live in one table; the first key byte selects the namespace
/// (header rows, data rows, system rows).
const STORE_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("store");

/// A single staged mutation
#[derive(Debug, Clone)]
pub enum KvOp {
    /// Insert or overwrite a key
    Set { key: Vec<u8>, value: Vec<u8> },
    /// Remove a key (absent keys are fine)
    Remove { key: Vec<u8> },
    /// Remove every key starting with the prefix
    RemovePrefix { prefix: Vec<u8> },
}

/// An ordered batch of mutations applied atomically by [`KeyValueDb::submit`].
///
/// Later ops see the effect of earlier ops in the same batch (a `Set` after a
/// `RemovePrefix` covering it survives).
#[derive(Debug, Default)]
pub struct KvBatch {
    ops: Vec<KvOp>,
}

impl KvBatch {
    /// Create an empty batch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a set
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(KvOp::Set { key, value });
    }

    /// Stage a removal
    pub fn remove(&mut self, key: Vec<u8>) {
        self.ops.push(KvOp::Remove { key });
    }

    /// Stage a prefix removal
    pub fn remove_prefix(&mut self, prefix: Vec<u8>) {
        self.ops.push(KvOp::RemovePrefix { prefix });
    }

    /// Number of staged ops
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Staged ops in submission order
    #[must_use]
    pub fn ops(&self) -> &[KvOp] {
        &self.ops
    }
}

/// Contract the store requires from its backing database: atomic multi-key
/// batches, point reads, and ordered prefix iteration.
pub trait KeyValueDb: Send + Sync + 'static {
    /// Point read
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Point reads for several keys within one read snapshot
    fn get_many(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>>;

    /// All `(key, value)` pairs starting with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Up to `limit` pairs starting with `prefix`, beginning at `start`
    /// (inclusive; `None` starts at the prefix). `limit == 0` is unlimited.
    fn scan_prefix_from(
        &self,
        prefix: &[u8],
        start: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply a batch atomically
    fn submit(&self, batch: KvBatch) -> Result<()>;
}

fn db_err(ctx: &str, e: impl std::fmt::Display) -> Error {
    Error::storage(format!("{ctx}: {e}"))
}

/// Embedded redb-backed store
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(|e| db_err("open redb database", e))?;

        // Ensure the table exists so read transactions never miss it
        let wtx = db.begin_write().map_err(|e| db_err("begin write", e))?;
        wtx.open_table(STORE_TABLE)
            .map_err(|e| db_err("open table", e))?;
        wtx.commit().map_err(|e| db_err("commit", e))?;

        debug!(path = %path.display(), "opened kv backend");
        Ok(Self { db })
    }
}

impl KeyValueDb for RedbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let rtx = self.db.begin_read().map_err(|e| db_err("begin read", e))?;
        let table = rtx
            .open_table(STORE_TABLE)
            .map_err(|e| db_err("open table", e))?;
        let value = table
            .get(key)
            .map_err(|e| db_err("get", e))?
            .map(|v| v.value().to_vec());
        Ok(value)
    }

    fn get_many(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        let rtx = self.db.begin_read().map_err(|e| db_err("begin read", e))?;
        let table = rtx
            .open_table(STORE_TABLE)
            .map_err(|e| db_err("open table", e))?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let value = table
                .get(key.as_slice())
                .map_err(|e| db_err("get", e))?
                .map(|v| v.value().to_vec());
            out.push(value);
        }
        Ok(out)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_prefix_from(prefix, None, 0)
    }

    fn scan_prefix_from(
        &self,
        prefix: &[u8],
        start: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let rtx = self.db.begin_read().map_err(|e| db_err("begin read", e))?;
        let table = rtx
            .open_table(STORE_TABLE)
            .map_err(|e| db_err("open table", e))?;

        let from = start.unwrap_or(prefix);
        let from = if from < prefix { prefix } else { from };
        let mut out = Vec::new();
        for entry in table.range(from..).map_err(|e| db_err("range", e))? {
            let (k, v) = entry.map_err(|e| db_err("range entry", e))?;
            let key = k.value();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), v.value().to_vec()));
            if limit != 0 && out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    fn submit(&self, batch: KvBatch) -> Result<()> {
        let wtx = self.db.begin_write().map_err(|e| db_err("begin write", e))?;
        {
            let mut table = wtx
                .open_table(STORE_TABLE)
                .map_err(|e| db_err("open table", e))?;
            for op in batch.ops {
                match op {
                    KvOp::Set { key, value } => {
                        table
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(|e| db_err("insert", e))?;
                    }
                    KvOp::Remove { key } => {
                        table
                            .remove(key.as_slice())
                            .map_err(|e| db_err("remove", e))?;
                    }
                    KvOp::RemovePrefix { prefix } => {
                        let to_delete: Vec<Vec<u8>> = table
                            .range(prefix.as_slice()..)
                            .map_err(|e| db_err("range", e))?
                            .map_while(|entry| {
                                entry.ok().and_then(|(k, _)| {
                                    let key = k.value();
                                    if key.starts_with(&prefix) {
                                        Some(key.to_vec())
                                    } else {
                                        None
                                    }
                                })
                            })
                            .collect();
                        for key in &to_delete {
                            table
                                .remove(key.as_slice())
                                .map_err(|e| db_err("remove", e))?;
                        }
                    }
                }
            }
        }
        wtx.commit().map_err(|e| db_err("commit", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> RedbStore {
        RedbStore::open(dir.path().join("store.redb")).unwrap()
    }

    #[test]
    fn test_set_get_remove() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let mut batch = KvBatch::new();
        batch.set(b"k1".to_vec(), b"v1".to_vec());
        store.submit(batch).unwrap();

        assert_eq!(store.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.get(b"k2").unwrap(), None);

        let mut batch = KvBatch::new();
        batch.remove(b"k1".to_vec());
        store.submit(batch).unwrap();
        assert_eq!(store.get(b"k1").unwrap(), None);
    }

    #[test]
    fn test_batch_is_atomic_and_ordered() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let mut batch = KvBatch::new();
        batch.set(b"p/a".to_vec(), b"1".to_vec());
        batch.set(b"p/b".to_vec(), b"2".to_vec());
        batch.remove_prefix(b"p/".to_vec());
        batch.set(b"p/c".to_vec(), b"3".to_vec());
        store.submit(batch).unwrap();

        let rows = store.scan_prefix(b"p/").unwrap();
        assert_eq!(rows, vec![(b"p/c".to_vec(), b"3".to_vec())]);
    }

    #[test]
    fn test_scan_prefix_ordered() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let mut batch = KvBatch::new();
        for k in ["p/b", "p/a", "p/c", "q/x"] {
            batch.set(k.as_bytes().to_vec(), b"v".to_vec());
        }
        store.submit(batch).unwrap();

        let rows = store.scan_prefix(b"p/").unwrap();
        let keys: Vec<&[u8]> = rows.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"p/a".as_slice(), b"p/b", b"p/c"]);
    }

    #[test]
    fn test_scan_prefix_from_with_limit() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let mut batch = KvBatch::new();
        for i in 0..10u8 {
            batch.set(vec![b'p', i], vec![i]);
        }
        store.submit(batch).unwrap();

        let rows = store
            .scan_prefix_from(b"p", Some(&[b'p', 3]), 4)
            .unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].0, vec![b'p', 3]);
        assert_eq!(rows[3].0, vec![b'p', 6]);
    }

    #[test]
    fn test_get_many() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let mut batch = KvBatch::new();
        batch.set(b"a".to_vec(), b"1".to_vec());
        batch.set(b"c".to_vec(), b"3".to_vec());
        store.submit(batch).unwrap();

        let got = store
            .get_many(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()])
            .unwrap();
        assert_eq!(got, vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]);
    }
}
