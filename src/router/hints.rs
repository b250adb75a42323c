//! Hinted handoff
//!
//! A replica write that fails or times out is kept here, keyed by the node it
//! was meant for, and replayed in the background until that node accepts it.
//! Hints live in their own store under the data root so a restart does not
//! lose them.
//!
//! Key format: `[TARGET NODE u64 BE][SEQUENCE u64 BE]`, so one target's hints
//! are contiguous and replay in the order they were recorded.

use crate::common::{Error, NodeId, Result};
use crate::storage::kv::{Batch, KvBackend, KvStore};
use crate::storage::SeriesPoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const KEY_LEN: usize = 16;

/// One missed replica write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hint {
    pub shard: u64,
    pub written_at: u64,
    pub points: Vec<SeriesPoint>,
}

pub struct HintQueue {
    store: Arc<dyn KvStore>,
    next_seq: AtomicU64,
}

fn hint_key(target: NodeId, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_LEN);
    key.extend_from_slice(&target.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Sorts after every key of `target`
fn target_end(target: NodeId) -> Vec<u8> {
    let mut key = target.to_be_bytes().to_vec();
    key.extend_from_slice(&[0xff; KEY_LEN - 8 + 1]);
    key
}

fn decode_key(key: &[u8]) -> Result<(NodeId, u64)> {
    if key.len() != KEY_LEN {
        return Err(Error::Corrupted(format!("hint key of {} bytes", key.len())));
    }
    let mut target = [0u8; 8];
    let mut seq = [0u8; 8];
    target.copy_from_slice(&key[..8]);
    seq.copy_from_slice(&key[8..]);
    Ok((u64::from_be_bytes(target), u64::from_be_bytes(seq)))
}

fn decode_hint(bytes: &[u8]) -> Result<Hint> {
    bincode::deserialize(bytes).map_err(|e| Error::Corrupted(format!("bad hint: {}", e)))
}

impl HintQueue {
    /// Open the hint store at `path`, resuming its sequence
    pub fn open(backend: &dyn KvBackend, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let store = backend.open(path)?;

        let mut next_seq = 0;
        let mut pending = 0usize;
        for item in store.scan(&[], &[0xff; KEY_LEN + 1])? {
            let (key, _) = item?;
            let (_, seq) = decode_key(&key)?;
            next_seq = next_seq.max(seq + 1);
            pending += 1;
        }
        if pending > 0 {
            tracing::info!("{} write hints pending from the last run", pending);
        }

        Ok(Self {
            store,
            next_seq: AtomicU64::new(next_seq),
        })
    }

    pub fn push(&self, target: NodeId, hint: &Hint) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.store
            .put(&hint_key(target, seq), &bincode::serialize(hint)?)
    }

    /// Oldest hints for `target`, at most `limit`, with their sequence numbers
    pub fn pending(&self, target: NodeId, limit: usize) -> Result<Vec<(u64, Hint)>> {
        let mut hints = Vec::new();
        for item in self
            .store
            .scan(&hint_key(target, 0), &target_end(target))?
            .take(limit)
        {
            let (key, value) = item?;
            let (_, seq) = decode_key(&key)?;
            hints.push((seq, decode_hint(&value)?));
        }
        Ok(hints)
    }

    /// Drop delivered or obsolete hints
    pub fn remove(&self, target: NodeId, seqs: &[u64]) -> Result<()> {
        if seqs.is_empty() {
            return Ok(());
        }
        let mut batch = Batch::new();
        for &seq in seqs {
            batch.delete(hint_key(target, seq));
        }
        self.store.write_batch(batch)
    }

    /// Nodes with at least one hint queued
    pub fn targets(&self) -> Result<Vec<NodeId>> {
        let mut targets = BTreeSet::new();
        for item in self.store.scan(&[], &[0xff; KEY_LEN + 1])? {
            let (key, _) = item?;
            targets.insert(decode_key(&key)?.0);
        }
        Ok(targets.into_iter().collect())
    }

    pub fn len(&self) -> Result<usize> {
        let mut count = 0;
        for item in self.store.scan(&[], &[0xff; KEY_LEN + 1])? {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::{MemBackend, RocksBackend};
    use crate::storage::FieldValue;
    use tempfile::tempdir;

    fn hint(shard: u64, ts: i64) -> Hint {
        Hint {
            shard,
            written_at: ts as u64,
            points: vec![SeriesPoint::with_field("cpu", ts, "value", FieldValue::Int(ts))],
        }
    }

    #[test]
    fn test_hints_replay_in_order_per_target() {
        let dir = tempdir().unwrap();
        let queue = HintQueue::open(&MemBackend::new(), dir.path().join("hints")).unwrap();
        queue.push(2, &hint(1, 10)).unwrap();
        queue.push(3, &hint(1, 11)).unwrap();
        queue.push(2, &hint(4, 12)).unwrap();
        queue.push(u64::MAX, &hint(1, 13)).unwrap();

        assert_eq!(queue.targets().unwrap(), vec![2, 3, u64::MAX]);
        let for_two = queue.pending(2, 10).unwrap();
        assert_eq!(
            for_two.iter().map(|(_, h)| h.written_at).collect::<Vec<_>>(),
            vec![10, 12]
        );
        assert_eq!(queue.pending(2, 1).unwrap().len(), 1);
        assert_eq!(queue.pending(u64::MAX, 10).unwrap().len(), 1);

        queue.remove(2, &[for_two[0].0]).unwrap();
        assert_eq!(queue.pending(2, 10).unwrap()[0].1, hint(4, 12));
        assert_eq!(queue.len().unwrap(), 3);
    }

    #[test]
    fn test_hints_survive_reopen() {
        let dir = tempdir().unwrap();
        let backend = RocksBackend::new(true);
        let path = dir.path().join("hints");
        {
            let queue = HintQueue::open(&backend, &path).unwrap();
            queue.push(2, &hint(1, 10)).unwrap();
            queue.push(2, &hint(1, 11)).unwrap();
            queue.flush().unwrap();
        }

        let queue = HintQueue::open(&backend, &path).unwrap();
        assert_eq!(queue.len().unwrap(), 2);
        // New hints sort after the recovered ones
        queue.push(2, &hint(1, 12)).unwrap();
        let order: Vec<u64> = queue
            .pending(2, 10)
            .unwrap()
            .iter()
            .map(|(_, h)| h.written_at)
            .collect();
        assert_eq!(order, vec![10, 11, 12]);

        let seqs: Vec<u64> = queue.pending(2, 10).unwrap().iter().map(|(s, _)| *s).collect();
        queue.remove(2, &seqs).unwrap();
        assert!(queue.is_empty().unwrap());
    }
}
