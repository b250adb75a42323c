//! Replicated metadata state machine
//!
//! Readers clone an `Arc` of the current metadata; apply clones, mutates and
//! swaps it. Only committed log entries reach `apply`.

use crate::common::{Error, NodeId, Peer, Result};
use crate::metadata::command::{apply_command, ApplyOutcome, Proposal};
use crate::metadata::types::{ClusterMetadata, Database, Shard, ShardKey, User};
use crate::raft::{EntryKind, LogEntry, StateMachine};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;

/// A shard that a write needs but the metadata does not hold yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    pub database: String,
    pub space: String,
    pub start: i64,
    pub end: i64,
    pub replication_factor: usize,
}

impl ShardPlan {
    /// Placement key fed to HRW hashing
    pub fn placement_key(&self) -> String {
        format!("{}/{}/{}", self.database, self.space, self.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Existing(Shard),
    Missing(ShardPlan),
}

pub struct MetadataStore {
    current: RwLock<Arc<ClusterMetadata>>,
    // Serializes writers; readers never take it
    write_lock: Mutex<()>,
    version_tx: watch::Sender<u64>,
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStore {
    pub fn new() -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            current: RwLock::new(Arc::new(ClusterMetadata::default())),
            write_lock: Mutex::new(()),
            version_tx,
        }
    }

    /// Consistent view of the metadata at some committed version
    pub fn snapshot(&self) -> Arc<ClusterMetadata> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn version(&self) -> u64 {
        *self.version_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// Wait until entries up to `index` are applied locally
    pub async fn wait_for_version(&self, index: u64, timeout: Duration) -> Result<()> {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|v| *v >= index)).await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::Internal("metadata store dropped".into())),
            Err(_) => Err(Error::Timeout(format!(
                "metadata version {} not applied within {:?}",
                index, timeout
            ))),
        }
    }

    fn swap(&self, next: ClusterMetadata) -> Result<()> {
        let version = next.version;
        let mut guard = self
            .current
            .write()
            .map_err(|_| Error::Internal("metadata lock poisoned".into()))?;
        *guard = Arc::new(next);
        drop(guard);
        self.version_tx.send_replace(version);
        Ok(())
    }

    /// Apply the committed entry at `index`. Indexes at or below the
    /// current version are ignored.
    pub fn apply(&self, index: u64, kind: EntryKind, data: &[u8]) -> Result<ApplyOutcome> {
        let _writer = self
            .write_lock
            .lock()
            .map_err(|_| Error::Internal("metadata writer lock poisoned".into()))?;
        let current = self.snapshot();
        if index <= current.version {
            return Ok(ApplyOutcome::Unchanged);
        }

        let mut next = (*current).clone();
        next.version = index;
        let outcome = match kind {
            EntryKind::Noop => ApplyOutcome::Unchanged,
            EntryKind::Command | EntryKind::Membership => match Proposal::decode(data) {
                Ok(proposal) => {
                    let request = proposal.id.as_u128();
                    if next.seen_request(request) {
                        ApplyOutcome::Duplicate
                    } else {
                        next.remember_request(request);
                        apply_command(&mut next, &proposal.command)
                    }
                }
                Err(e) => {
                    tracing::error!("Skipping undecodable entry {}: {}", index, e);
                    ApplyOutcome::Rejected(format!("undecodable entry: {}", e))
                }
            },
        };

        match &outcome {
            ApplyOutcome::Rejected(reason) => {
                tracing::debug!("Entry {} rejected: {}", index, reason)
            }
            ApplyOutcome::Duplicate => tracing::debug!("Entry {} is a duplicate request", index),
            _ => {}
        }

        self.swap(next)?;
        Ok(outcome)
    }

    /// Serialized metadata, version included
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self.snapshot().as_ref())?)
    }

    /// Replace everything with a serialized snapshot
    pub fn restore_from(&self, data: &[u8]) -> Result<()> {
        let next: ClusterMetadata = bincode::deserialize(data)?;
        let _writer = self
            .write_lock
            .lock()
            .map_err(|_| Error::Internal("metadata writer lock poisoned".into()))?;
        tracing::info!("Restoring metadata at version {}", next.version);
        self.swap(next)
    }

    pub fn database(&self, name: &str) -> Result<Database> {
        self.snapshot()
            .databases
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DatabaseNotFound(name.to_string()))
    }

    pub fn user(&self, name: &str) -> Option<User> {
        self.snapshot().users.get(name).cloned()
    }

    pub fn shard(&self, id: u64) -> Result<Shard> {
        self.snapshot()
            .shards
            .get(&id)
            .cloned()
            .ok_or(Error::ShardNotFound(id))
    }

    /// Map a point of `database` to its shard, or to the shard it needs
    pub fn resolve(&self, database: &str, timestamp: i64) -> Result<Resolution> {
        let meta = self.snapshot();
        let db = meta
            .databases
            .get(database)
            .ok_or_else(|| Error::DatabaseNotFound(database.to_string()))?;
        let space = db.active_space().ok_or_else(|| {
            Error::Internal(format!("database {} has no default space", database))
        })?;
        let (start, end) = space.window(timestamp).ok_or_else(|| {
            Error::InvalidRequest(format!(
                "timestamp {} has no shard window in {}/{}",
                timestamp, database, space.name
            ))
        })?;
        let key = ShardKey {
            database: database.to_string(),
            space: space.name.clone(),
            start,
        };
        Ok(match meta.shard_for(&key) {
            Some(shard) => Resolution::Existing(shard.clone()),
            None => Resolution::Missing(ShardPlan {
                database: database.to_string(),
                space: space.name.clone(),
                start,
                end,
                replication_factor: space.replication_factor,
            }),
        })
    }

    /// Shards of `database` intersecting `[start, end)`
    pub fn shards_overlapping(&self, database: &str, start: i64, end: i64) -> Result<Vec<Shard>> {
        let meta = self.snapshot();
        if !meta.databases.contains_key(database) {
            return Err(Error::DatabaseNotFound(database.to_string()));
        }
        Ok(meta.shards_overlapping(database, start, end))
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.snapshot().node_ids()
    }
}

impl StateMachine for MetadataStore {
    fn apply(&self, entry: &LogEntry) -> Result<Vec<u8>> {
        MetadataStore::apply(self, entry.index, entry.kind, &entry.data)?.encode()
    }

    fn snapshot(&self) -> Result<(u64, Vec<u8>)> {
        let meta = MetadataStore::snapshot(self);
        Ok((meta.version, bincode::serialize(meta.as_ref())?))
    }

    fn restore(&self, data: &[u8]) -> Result<()> {
        self.restore_from(data)
    }

    fn members(&self) -> Vec<Peer> {
        self.snapshot()
            .nodes
            .values()
            .map(|n| Peer::new(n.id, n.addr.clone()))
            .collect()
    }
}
