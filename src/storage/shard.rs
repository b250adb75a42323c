//! Shard storage engine
//!
//! One engine owns one shard directory and the store opened in it. Points are
//! written as atomic batches; scans walk a single series' key range lazily.

use crate::common::{timestamp_now_nanos, Result};
use crate::storage::codec::{self, SeriesPoint, VersionedPoint};
use crate::storage::kv::{Batch, KvBackend, KvIter, KvStore};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub struct ShardEngine {
    path: PathBuf,
    store: Arc<dyn KvStore>,
    /// Serializes version checks with the batch that follows them
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for ShardEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardEngine").field("path", &self.path).finish()
    }
}

impl ShardEngine {
    /// Open the shard store at `path`, creating it if missing.
    /// A damaged store surfaces its error instead of being recreated.
    pub fn open(backend: &dyn KvBackend, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        let store = backend.open(&path)?;
        tracing::debug!("Opened shard store at {}", path.display());
        Ok(Self {
            path,
            store,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a single point
    pub fn write(&self, point: &SeriesPoint) -> Result<()> {
        self.write_batch(std::slice::from_ref(point))
    }

    /// Write points atomically: all become visible or none do.
    /// Later points overwrite earlier ones with the same series and timestamp.
    pub fn write_batch(&self, points: &[SeriesPoint]) -> Result<()> {
        self.write_versioned(points, timestamp_now_nanos()).map(|_| ())
    }

    /// Write points carrying version `written_at`. A key already holding a
    /// newer version keeps it. Returns how many points were stored.
    pub fn write_versioned(&self, points: &[SeriesPoint], written_at: u64) -> Result<usize> {
        let mut latest: BTreeMap<Vec<u8>, &SeriesPoint> = BTreeMap::new();
        for point in points {
            codec::validate_series(&point.series)?;
            latest.insert(codec::encode_key(&point.series, point.timestamp), point);
        }
        if latest.is_empty() {
            return Ok(0);
        }

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| crate::Error::Internal("shard write lock poisoned".into()))?;
        let mut batch = Batch::new();
        for (key, point) in latest {
            if let Some(existing) = self.store.get(&key)? {
                let (stored_at, _) = codec::decode_value(&existing)?;
                if stored_at > written_at {
                    continue;
                }
            }
            batch.put(key, codec::encode_value(&point.fields, written_at)?);
        }
        let stored = batch.len();
        if stored > 0 {
            self.store.write_batch(batch)?;
        }
        Ok(stored)
    }

    /// Points of `series` with `start <= timestamp < end`, ascending
    pub fn scan_range(&self, series: &str, start: i64, end: i64) -> Result<SeriesScan<'_>> {
        Ok(SeriesScan {
            inner: self.scan_versioned(series, start, end)?,
        })
    }

    /// Like `scan_range`, keeping each point's version
    pub fn scan_versioned(&self, series: &str, start: i64, end: i64) -> Result<VersionedScan<'_>> {
        codec::validate_series(series)?;
        let inner = if start >= end {
            Box::new(std::iter::empty()) as KvIter<'_>
        } else {
            self.store.scan(
                &codec::encode_key(series, start),
                &codec::encode_key(series, end),
            )?
        };
        Ok(VersionedScan {
            series: Some(series.to_string()),
            inner,
        })
    }

    /// Every point in the shard, ordered by series then timestamp
    pub fn scan_all(&self) -> Result<VersionedScan<'_>> {
        // UTF-8 never contains 0xff, so this bounds every key
        let inner = self.store.scan(&[], &[0xff])?;
        Ok(VersionedScan {
            series: None,
            inner,
        })
    }

    /// Persist buffered writes
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    /// Flush and release the store
    pub fn close(self) -> Result<()> {
        self.store.flush()?;
        tracing::debug!("Closed shard store at {}", self.path.display());
        Ok(())
    }
}

/// Lazy, single-pass scan over one series or the whole shard
pub struct VersionedScan<'a> {
    series: Option<String>,
    inner: KvIter<'a>,
}

impl Iterator for VersionedScan<'_> {
    type Item = Result<VersionedPoint>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        Some(item.and_then(|(key, value)| {
            let (series, timestamp) = codec::decode_key(&key)?;
            debug_assert!(self.series.as_ref().map_or(true, |s| *s == series));
            let (written_at, fields) = codec::decode_value(&value)?;
            Ok(VersionedPoint {
                point: SeriesPoint {
                    series,
                    timestamp,
                    fields,
                },
                written_at,
            })
        }))
    }
}

/// `VersionedScan` without the versions
pub struct SeriesScan<'a> {
    inner: VersionedScan<'a>,
}

impl Iterator for SeriesScan<'_> {
    type Item = Result<SeriesPoint>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.inner.next()?.map(|v| v.point))
    }
}
