//! Cluster metadata model

use crate::common::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

pub type ShardId = u64;

/// Name of the account created by the root bootstrap
pub const ROOT_USER: &str = "root";

/// Documented default credential for the root account
pub const DEFAULT_ROOT_PASSWORD: &str = "root";

/// Name of the shard space every database gets on creation
pub const DEFAULT_SPACE: &str = "default";

/// How many applied request ids are remembered for duplicate detection
pub const RECENT_REQUEST_CAPACITY: usize = 4096;

/// A cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: String,
}

/// Time partitioning and replication policy of a database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpace {
    pub name: String,
    /// Width of each shard window, in timestamp units (nanoseconds)
    pub shard_duration: i64,
    /// Informational; retention enforcement happens outside this crate
    pub retention: Option<Duration>,
    pub replication_factor: usize,
}

impl ShardSpace {
    pub fn new(name: impl Into<String>, shard_duration: Duration, replication_factor: usize) -> Self {
        Self {
            name: name.into(),
            shard_duration: i64::try_from(shard_duration.as_nanos()).unwrap_or(i64::MAX),
            retention: None,
            replication_factor,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Floor-aligned window `[start, end)` containing `timestamp`.
    /// `None` when the window start is not representable.
    pub fn window(&self, timestamp: i64) -> Option<(i64, i64)> {
        if self.shard_duration <= 0 {
            return None;
        }
        let start = timestamp
            .div_euclid(self.shard_duration)
            .checked_mul(self.shard_duration)?;
        Some((start, start.saturating_add(self.shard_duration)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    /// Space used to resolve writes and queries
    pub default_space: String,
    pub spaces: BTreeMap<String, ShardSpace>,
}

impl Database {
    pub fn active_space(&self) -> Option<&ShardSpace> {
        self.spaces.get(&self.default_space)
    }
}

/// A time-bounded, replicated partition of a database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub database: String,
    pub space: String,
    pub start: i64,
    pub end: i64,
    pub replicas: Vec<NodeId>,
}

impl Shard {
    pub fn contains(&self, timestamp: i64) -> bool {
        self.start <= timestamp && timestamp < self.end
    }

    /// Does `[start, end)` intersect this shard's range?
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start < end && start < self.end
    }
}

/// Lookup key of a shard inside its space
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    pub database: String,
    pub space: String,
    pub start: i64,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    /// argon2 PHC string; never the clear-text credential
    pub password_hash: String,
    pub is_admin: bool,
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("name", &self.name)
            .field("password_hash", &"<redacted>")
            .field("is_admin", &self.is_admin)
            .finish()
    }
}

/// Everything replicated through the consensus log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    /// Index of the last applied log entry
    pub version: u64,
    pub nodes: BTreeMap<NodeId, NodeInfo>,
    pub databases: BTreeMap<String, Database>,
    pub shards: BTreeMap<ShardId, Shard>,
    pub shard_index: BTreeMap<ShardKey, ShardId>,
    pub users: BTreeMap<String, User>,
    pub next_shard_id: ShardId,
    /// Recently applied request ids, oldest first
    pub recent_requests: VecDeque<u128>,
}

impl ClusterMetadata {
    pub fn admin(&self) -> Option<&User> {
        self.users.values().find(|u| u.is_admin)
    }

    pub fn has_admin(&self) -> bool {
        self.admin().is_some()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn shard_for(&self, key: &ShardKey) -> Option<&Shard> {
        self.shard_index.get(key).and_then(|id| self.shards.get(id))
    }

    /// Shards of `database` intersecting `[start, end)`, ordered by start
    pub fn shards_overlapping(&self, database: &str, start: i64, end: i64) -> Vec<Shard> {
        let mut shards: Vec<Shard> = self
            .shards
            .values()
            .filter(|s| s.database == database && s.overlaps(start, end))
            .cloned()
            .collect();
        shards.sort_by_key(|s| (s.start, s.id));
        shards
    }

    pub fn seen_request(&self, id: u128) -> bool {
        self.recent_requests.contains(&id)
    }

    pub fn remember_request(&mut self, id: u128) {
        if self.recent_requests.len() >= RECENT_REQUEST_CAPACITY {
            self.recent_requests.pop_front();
        }
        self.recent_requests.push_back(id);
    }
}
