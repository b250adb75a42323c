//! Durable Raft state on RocksDB
//!
//! Column families:
//! - `log`: index (big-endian) → bincode `LogEntry`
//! - `state`: hard state and the latest snapshot (crc32-prefixed)
//!
//! Every write is synced before it returns.

use crate::common::{crc32, Error, NodeId, Result};
use crate::raft::message::{LogEntry, Snapshot};
use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;

const CF_LOG: &str = "log";
const CF_STATE: &str = "state";

const KEY_HARD_STATE: &[u8] = b"hard_state";
const KEY_SNAPSHOT: &[u8] = b"snapshot";

/// Term and vote; must hit disk before answering any RPC that changed them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
}

/// Everything needed to rebuild a node after restart
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub hard_state: HardState,
    pub snapshot: Option<Snapshot>,
    pub entries: Vec<LogEntry>,
}

pub struct RaftStorage {
    db: DB,
}

fn log_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

impl RaftStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_paranoid_checks(true);

        let db = DB::open_cf(&opts, path, vec![CF_LOG, CF_STATE])?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Store(format!("missing column family {}", name)))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    pub fn load(&self) -> Result<RecoveredState> {
        let state_cf = self.cf(CF_STATE)?;
        let hard_state = match self.db.get_cf(state_cf, KEY_HARD_STATE)? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => HardState::default(),
        };
        let snapshot = match self.db.get_cf(state_cf, KEY_SNAPSHOT)? {
            Some(bytes) => Some(decode_snapshot(&bytes)?),
            None => None,
        };

        let mut entries = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_LOG)?, IteratorMode::Start) {
            let (_, value) = item?;
            let entry: LogEntry = bincode::deserialize(&value)?;
            entries.push(entry);
        }

        // A gap means a torn write; keep only the contiguous prefix
        let first = snapshot.as_ref().map(|s| s.last_included_index).unwrap_or(0) + 1;
        let mut expected = first;
        let mut contiguous = Vec::with_capacity(entries.len());
        for entry in entries.into_iter().filter(|e| e.index >= first) {
            if entry.index != expected {
                tracing::warn!(
                    "Raft log gap at {} (found {}), dropping the tail",
                    expected,
                    entry.index
                );
                break;
            }
            expected += 1;
            contiguous.push(entry);
        }

        Ok(RecoveredState {
            hard_state,
            snapshot,
            entries: contiguous,
        })
    }

    pub fn save_hard_state(&self, state: &HardState) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_STATE)?, KEY_HARD_STATE, bincode::serialize(state)?);
        self.write(batch)
    }

    pub fn append(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let cf = self.cf(CF_LOG)?;
        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.put_cf(cf, log_key(entry.index), bincode::serialize(entry)?);
        }
        self.write(batch)
    }

    /// Delete entries at or after `index`
    pub fn truncate_from(&self, index: u64) -> Result<()> {
        let cf = self.cf(CF_LOG)?;
        let mut batch = WriteBatch::default();
        batch.delete_range_cf(cf, log_key(index), log_key(u64::MAX));
        batch.delete_cf(cf, log_key(u64::MAX));
        self.write(batch)
    }

    /// Persist a snapshot and drop the log prefix it covers, atomically
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_STATE)?, KEY_SNAPSHOT, encode_snapshot(snapshot)?);
        batch.delete_range_cf(
            self.cf(CF_LOG)?,
            log_key(0),
            log_key(snapshot.last_included_index.saturating_add(1)),
        );
        self.write(batch)
    }

    /// Install a snapshot received from the leader, discarding the whole log
    pub fn install_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let log_cf = self.cf(CF_LOG)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_STATE)?, KEY_SNAPSHOT, encode_snapshot(snapshot)?);
        batch.delete_range_cf(log_cf, log_key(0), log_key(u64::MAX));
        batch.delete_cf(log_cf, log_key(u64::MAX));
        self.write(batch)
    }
}

fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>> {
    let body = bincode::serialize(snapshot)?;
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&crc32(&body).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot> {
    if bytes.len() < 4 {
        return Err(Error::Corrupted("snapshot record too short".into()));
    }
    let (head, body) = bytes.split_at(4);
    let expected = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    let actual = crc32(body);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }
    Ok(bincode::deserialize(body)?)
}
