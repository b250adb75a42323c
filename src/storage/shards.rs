//! Local shard registry
//!
//! Tracks the shard engines this node has opened under the data root. Every
//! shard lives in `data_dir/shard-<id>`. A shard whose store fails to open is
//! remembered as unavailable; other shards keep serving.

use crate::common::{Error, Result};
use crate::storage::codec::{SeriesPoint, VersionedPoint};
use crate::storage::kv::KvBackend;
use crate::storage::shard::ShardEngine;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const SHARD_DIR_PREFIX: &str = "shard-";

/// Data-root entry holding the write hints for unreachable replicas
pub const HINTS_DIR: &str = "hints";

enum Slot {
    Ready(Arc<ShardEngine>),
    Failed(String),
}

pub struct LocalShards {
    data_dir: PathBuf,
    backend: Arc<dyn KvBackend>,
    slots: RwLock<HashMap<u64, Slot>>,
}

/// Directory name for a shard
pub fn shard_dir_name(shard_id: u64) -> String {
    format!("{}{}", SHARD_DIR_PREFIX, shard_id)
}

fn parse_shard_dir(name: &str) -> Option<u64> {
    name.strip_prefix(SHARD_DIR_PREFIX)?.parse().ok()
}

impl LocalShards {
    /// Open every shard directory already present under `data_dir`
    pub fn open(data_dir: impl AsRef<Path>, backend: Arc<dyn KvBackend>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let mut slots = HashMap::new();
        for entry in std::fs::read_dir(&data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if name == HINTS_DIR {
                continue;
            }
            let Some(shard_id) = name.to_str().and_then(parse_shard_dir) else {
                tracing::warn!("Ignoring unexpected entry {} in data dir", entry.path().display());
                continue;
            };
            match ShardEngine::open(backend.as_ref(), entry.path()) {
                Ok(engine) => {
                    slots.insert(shard_id, Slot::Ready(Arc::new(engine)));
                }
                Err(e) => {
                    tracing::error!("Shard {} unavailable: {}", shard_id, e);
                    slots.insert(shard_id, Slot::Failed(e.to_string()));
                }
            }
        }

        let ready = slots.values().filter(|s| matches!(s, Slot::Ready(_))).count();
        tracing::info!(
            "Opened {} of {} local shards ({} backend)",
            ready,
            slots.len(),
            backend.name()
        );

        Ok(Self {
            data_dir,
            backend,
            slots: RwLock::new(slots),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn read_slots(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<u64, Slot>>> {
        self.slots
            .read()
            .map_err(|_| Error::Internal("shard registry lock poisoned".into()))
    }

    /// Engine for a shard already opened, `None` if never written here
    pub fn get(&self, shard_id: u64) -> Result<Option<Arc<ShardEngine>>> {
        match self.read_slots()?.get(&shard_id) {
            Some(Slot::Ready(engine)) => Ok(Some(engine.clone())),
            Some(Slot::Failed(reason)) => Err(Error::ShardUnavailable {
                shard: shard_id,
                reason: reason.clone(),
            }),
            None => Ok(None),
        }
    }

    /// Engine for a shard, creating its directory on first use
    pub fn get_or_create(&self, shard_id: u64) -> Result<Arc<ShardEngine>> {
        if let Some(engine) = self.get(shard_id)? {
            return Ok(engine);
        }
        let mut slots = self
            .slots
            .write()
            .map_err(|_| Error::Internal("shard registry lock poisoned".into()))?;
        match slots.get(&shard_id) {
            Some(Slot::Ready(engine)) => return Ok(engine.clone()),
            Some(Slot::Failed(reason)) => {
                return Err(Error::ShardUnavailable {
                    shard: shard_id,
                    reason: reason.clone(),
                })
            }
            None => {}
        }
        let path = self.data_dir.join(shard_dir_name(shard_id));
        let engine = Arc::new(ShardEngine::open(self.backend.as_ref(), &path)?);
        tracing::info!("Created shard {} at {}", shard_id, path.display());
        slots.insert(shard_id, Slot::Ready(engine.clone()));
        Ok(engine)
    }

    /// Apply a batch to a local shard
    pub fn write(&self, shard_id: u64, points: &[SeriesPoint]) -> Result<()> {
        self.get_or_create(shard_id)?.write_batch(points)
    }

    /// Apply a batch stamped with the coordinator's version
    pub fn write_versioned(
        &self,
        shard_id: u64,
        points: &[SeriesPoint],
        written_at: u64,
    ) -> Result<usize> {
        self.get_or_create(shard_id)?
            .write_versioned(points, written_at)
    }

    /// Read a range of several series from a local shard, with versions.
    /// An empty `series` reads every series. A shard never written on this
    /// node reads as empty; callers merge it with other replicas.
    pub fn scan(
        &self,
        shard_id: u64,
        series: &[String],
        start: i64,
        end: i64,
    ) -> Result<Vec<VersionedPoint>> {
        let Some(engine) = self.get(shard_id)? else {
            return Ok(Vec::new());
        };
        let mut points = Vec::new();
        if series.is_empty() {
            for stored in engine.scan_all()? {
                let stored = stored?;
                if (start..end).contains(&stored.point.timestamp) {
                    points.push(stored);
                }
            }
            return Ok(points);
        }
        for name in series {
            for point in engine.scan_versioned(name, start, end)? {
                points.push(point?);
            }
        }
        Ok(points)
    }

    /// Ids of shards present locally, including failed ones
    pub fn shard_ids(&self) -> Result<Vec<u64>> {
        let mut ids: Vec<u64> = self.read_slots()?.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Flush every open shard
    pub fn flush_all(&self) -> Result<()> {
        for slot in self.read_slots()?.values() {
            if let Slot::Ready(engine) = slot {
                engine.flush()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::FieldValue;
    use crate::storage::kv::{MemBackend, RocksBackend};
    use tempfile::tempdir;

    #[test]
    fn test_lazy_creation_and_reopen() {
        let dir = tempdir().unwrap();
        let backend: Arc<dyn KvBackend> = Arc::new(RocksBackend::new(false));
        {
            let shards = LocalShards::open(dir.path(), backend.clone()).unwrap();
            assert!(shards.shard_ids().unwrap().is_empty());
            assert!(shards.scan(7, &["cpu".into()], 0, 10).unwrap().is_empty());
            assert!(shards.scan(7, &[], 0, 10).unwrap().is_empty());
            assert!(!dir.path().join("shard-7").exists());

            let p = SeriesPoint::with_field("cpu", 5, "value", FieldValue::Int(1));
            shards.write(7, &[p]).unwrap();
            assert!(dir.path().join("shard-7").is_dir());
        }

        let shards = LocalShards::open(dir.path(), backend).unwrap();
        assert_eq!(shards.shard_ids().unwrap(), vec![7]);
        assert_eq!(shards.scan(7, &["cpu".into()], 0, 10).unwrap().len(), 1);
        assert_eq!(shards.scan(7, &[], 0, 10).unwrap().len(), 1);
        assert!(shards.scan(7, &[], 6, 10).unwrap().is_empty());
    }

    #[test]
    fn test_damaged_shard_is_isolated() {
        let dir = tempdir().unwrap();
        let backend: Arc<dyn KvBackend> = Arc::new(RocksBackend::new(false));
        {
            let shards = LocalShards::open(dir.path(), backend.clone()).unwrap();
            let p = SeriesPoint::with_field("cpu", 1, "value", FieldValue::Int(1));
            shards.write(1, &[p.clone()]).unwrap();
            shards.write(2, &[p]).unwrap();
        }

        // Destroy shard 2's manifest pointer
        std::fs::write(dir.path().join("shard-2").join("CURRENT"), b"MANIFEST-999999\n").unwrap();

        let shards = LocalShards::open(dir.path(), backend).unwrap();
        assert_eq!(shards.scan(1, &["cpu".into()], 0, 10).unwrap().len(), 1);
        assert!(matches!(
            shards.scan(2, &["cpu".into()], 0, 10),
            Err(Error::ShardUnavailable { shard: 2, .. })
        ));
    }

    #[test]
    fn test_ignores_foreign_entries() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lost+found")).unwrap();
        std::fs::write(dir.path().join("README"), b"x").unwrap();
        let shards = LocalShards::open(dir.path(), Arc::new(MemBackend::new())).unwrap();
        assert!(shards.shard_ids().unwrap().is_empty());
    }
}
