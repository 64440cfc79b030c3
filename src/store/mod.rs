//! Key/value store backing the replicated state machine.
//!
//! The master persists every cluster-visible record through the consensus
//! log; the apply path lands committed records here. Two backends are
//! provided: [`MemStore`] for tests and embedded use, and [`RocksStore`]
//! for production.

use crate::error::Result;
use parking_lot::RwLock;
use rocksdb::{Options, DB};
use std::collections::BTreeMap;
use std::path::Path;

/// Key/value interface consumed by the ID allocator and the FSM apply path.
pub trait MetaStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Return all `(key, value)` pairs whose key starts with `prefix`,
    /// in ascending key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// In-memory store over an ordered map.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for MemStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.inner.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let inner = self.inner.read();
        Ok(inner
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// RocksDB-backed store.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl MetaStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db.put(key.as_bytes(), value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.delete(key.as_bytes())?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            prefix.as_bytes(),
            rocksdb::Direction::Forward,
        ));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8_lossy(&key).into_owned();
            out.push((key, value.to_vec()));
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn MetaStore) {
        store.put("vol/a", b"1").unwrap();
        store.put("vol/b", b"2").unwrap();
        store.put("dp/1/7", b"3").unwrap();

        assert_eq!(store.get("vol/a").unwrap().unwrap(), b"1");
        assert!(store.get("vol/missing").unwrap().is_none());

        let vols = store.scan_prefix("vol/").unwrap();
        assert_eq!(vols.len(), 2);
        assert_eq!(vols[0].0, "vol/a");
        assert_eq!(vols[1].0, "vol/b");

        store.delete("vol/a").unwrap();
        assert!(store.get("vol/a").unwrap().is_none());
        assert_eq!(store.scan_prefix("vol/").unwrap().len(), 1);
    }

    #[test]
    fn test_mem_store() {
        exercise(&MemStore::new());
    }

    #[test]
    fn test_rocks_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path().join("meta")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_rocks_store_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta");
        {
            let store = RocksStore::open(&path).unwrap();
            store.put("id/common", b"42").unwrap();
            store.flush().unwrap();
        }
        let store = RocksStore::open(&path).unwrap();
        assert_eq!(store.get("id/common").unwrap().unwrap(), b"42");
    }
}
