//! Ordered key-value store abstraction
//!
//! A shard engine only needs point reads, atomic batches, ordered range
//! iteration and an offline repair. RocksDB is the default backend; an
//! in-memory backend serves tests and ephemeral nodes, and sled is available
//! behind the `sled-backend` feature.

use crate::common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// Iterator over `(key, value)` pairs in ascending key order
pub type KvIter<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Puts and deletes applied all-or-nothing, in order
#[derive(Debug, Default, Clone)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// An open store instance
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn write_batch(&self, batch: Batch) -> Result<()>;
    /// Keys in `[start, end)`, ascending
    fn scan<'a>(&'a self, start: &[u8], end: &[u8]) -> Result<KvIter<'a>>;
    fn flush(&self) -> Result<()>;
}

/// Opens and repairs store instances at a path
pub trait KvBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn version(&self) -> &'static str;
    /// Open (creating if missing). A damaged store must surface an error.
    fn open(&self, path: &Path) -> Result<Arc<dyn KvStore>>;
    /// Offline repair in place; the caller guarantees nobody has it open
    fn repair(&self, path: &Path) -> Result<()>;
}

/// Build the backend named in the storage config
pub fn backend_from_config(config: &crate::common::StorageConfig) -> Result<Arc<dyn KvBackend>> {
    match config.backend.as_str() {
        "rocksdb" => Ok(Arc::new(RocksBackend::new(config.sync_writes))),
        "memory" => Ok(Arc::new(MemBackend::new())),
        #[cfg(feature = "sled-backend")]
        "sled" => Ok(Arc::new(sled_backend::SledBackend)),
        other => Err(Error::InvalidConfig(format!(
            "unknown storage backend: {}",
            other
        ))),
    }
}

// === RocksDB ===

/// RocksDB release bundled by `librocksdb-sys` for rocksdb 0.22
pub const ROCKSDB_VERSION: &str = "8.10.0";

/// RocksDB backend
pub struct RocksBackend {
    sync_writes: bool,
}

impl RocksBackend {
    pub fn new(sync_writes: bool) -> Self {
        Self { sync_writes }
    }

    fn options() -> rocksdb::Options {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.set_paranoid_checks(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }
}

impl KvBackend for RocksBackend {
    fn name(&self) -> &'static str {
        "rocksdb"
    }

    fn version(&self) -> &'static str {
        ROCKSDB_VERSION
    }

    fn open(&self, path: &Path) -> Result<Arc<dyn KvStore>> {
        let db = rocksdb::DB::open(&Self::options(), path)?;
        let mut write_opts = rocksdb::WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        Ok(Arc::new(RocksStore { db, write_opts }))
    }

    fn repair(&self, path: &Path) -> Result<()> {
        rocksdb::DB::repair(&Self::options(), path)?;
        // A repaired store must open cleanly; anything else is irrecoverable
        let db = rocksdb::DB::open(&Self::options(), path)?;
        db.flush()?;
        Ok(())
    }
}

/// RocksDB store
pub struct RocksStore {
    db: rocksdb::DB,
    write_opts: rocksdb::WriteOptions,
}

impl KvStore for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put_opt(key, value, &self.write_opts)?;
        Ok(())
    }

    fn write_batch(&self, batch: Batch) -> Result<()> {
        let mut wb = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => wb.put(key, value),
                BatchOp::Delete(key) => wb.delete(key),
            }
        }
        self.db.write_opt(wb, &self.write_opts)?;
        Ok(())
    }

    fn scan<'a>(&'a self, start: &[u8], end: &[u8]) -> Result<KvIter<'a>> {
        let end = end.to_vec();
        let iter = self
            .db
            .iterator(rocksdb::IteratorMode::From(start, rocksdb::Direction::Forward))
            .map(|item| {
                item.map(|(k, v)| (k.into_vec(), v.into_vec()))
                    .map_err(Error::from)
            })
            .take_while(move |item| match item {
                Ok((k, _)) => k.as_slice() < end.as_slice(),
                Err(_) => true,
            });
        Ok(Box::new(iter))
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

// === In-memory ===

type MemMap = Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>;

/// In-memory backend. Stores live as long as the backend, keyed by path, so
/// reopening a path sees earlier writes.
#[derive(Default)]
pub struct MemBackend {
    stores: Mutex<HashMap<PathBuf, MemMap>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn version(&self) -> &'static str {
        crate::VERSION
    }

    fn open(&self, path: &Path) -> Result<Arc<dyn KvStore>> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| Error::Internal("memory backend lock poisoned".into()))?;
        let map = stores.entry(path.to_path_buf()).or_default().clone();
        Ok(Arc::new(MemStore { map }))
    }

    fn repair(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// In-memory ordered store
pub struct MemStore {
    map: MemMap,
}

impl MemStore {
    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>> {
        self.map
            .read()
            .map_err(|_| Error::Internal("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>> {
        self.map
            .write()
            .map_err(|_| Error::Internal("memory store lock poisoned".into()))
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write()?.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn write_batch(&self, batch: Batch) -> Result<()> {
        let mut map = self.write()?;
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => {
                    map.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan<'a>(&'a self, start: &[u8], end: &[u8]) -> Result<KvIter<'a>> {
        if start >= end {
            return Ok(Box::new(std::iter::empty()));
        }
        // Copy the range out so the iterator does not pin the lock
        let items: Vec<_> = self
            .read()?
            .range(start.to_vec()..end.to_vec())
            .map(|(k, v)| Ok((k.clone(), v.clone())))
            .collect();
        Ok(Box::new(items.into_iter()))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// === sled ===

#[cfg(feature = "sled-backend")]
pub mod sled_backend {
    use super::*;

    /// sled backend. sled recovers on open, so repair is open + flush.
    pub struct SledBackend;

    impl KvBackend for SledBackend {
        fn name(&self) -> &'static str {
            "sled"
        }

        fn version(&self) -> &'static str {
            "0.34"
        }

        fn open(&self, path: &Path) -> Result<Arc<dyn KvStore>> {
            let db = sled::open(path).map_err(|e| Error::Store(e.to_string()))?;
            Ok(Arc::new(SledStore { db }))
        }

        fn repair(&self, path: &Path) -> Result<()> {
            let db = sled::open(path).map_err(|e| Error::Corrupted(e.to_string()))?;
            db.flush().map_err(|e| Error::Store(e.to_string()))?;
            Ok(())
        }
    }

    pub struct SledStore {
        db: sled::Db,
    }

    impl KvStore for SledStore {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.db
                .get(key)
                .map(|v| v.map(|ivec| ivec.to_vec()))
                .map_err(|e| Error::Store(e.to_string()))
        }

        fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
            self.db
                .insert(key, value)
                .map(|_| ())
                .map_err(|e| Error::Store(e.to_string()))
        }

        fn write_batch(&self, batch: Batch) -> Result<()> {
            let mut sled_batch = sled::Batch::default();
            for op in batch.into_ops() {
                match op {
                    BatchOp::Put(key, value) => sled_batch.insert(key, value),
                    BatchOp::Delete(key) => sled_batch.remove(key),
                }
            }
            self.db
                .apply_batch(sled_batch)
                .map_err(|e| Error::Store(e.to_string()))
        }

        fn scan<'a>(&'a self, start: &[u8], end: &[u8]) -> Result<KvIter<'a>> {
            if start >= end {
                return Ok(Box::new(std::iter::empty()));
            }
            let iter = self.db.range(start.to_vec()..end.to_vec()).map(|item| {
                item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(|e| Error::Store(e.to_string()))
            });
            Ok(Box::new(iter))
        }

        fn flush(&self) -> Result<()> {
            self.db
                .flush()
                .map(|_| ())
                .map_err(|e| Error::Store(e.to_string()))
        }
    }
}
