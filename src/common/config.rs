//! Configuration for a chronodb node

use crate::common::{Error, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique within the cluster)
    pub node_id: NodeId,

    /// Bind address for internal RPC and client endpoints
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Address peers use to reach this node (defaults to `bind_addr`)
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// Root directory holding one subdirectory per shard
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory for the consensus log and snapshots
    #[serde(default = "default_raft_dir")]
    pub raft_dir: PathBuf,

    /// Bootstrap voters, including this node when it is one of them
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Addresses of existing members to contact when joining a running cluster
    #[serde(default)]
    pub join: Vec<String>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log destination: `stdout` or a file path
    #[serde(default = "default_log_file")]
    pub log_file: String,

    #[serde(default)]
    pub raft: RaftConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// One bootstrap voter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub addr: String,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8086))
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/db")
}
fn default_raft_dir() -> PathBuf {
    PathBuf::from("./data/raft")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_file() -> String {
    "stdout".to_string()
}

/// Consensus timings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Minimum election timeout; the effective timeout is randomized up to twice this
    #[serde(default = "default_election_timeout")]
    pub election_timeout_ms: u64,

    /// Leader heartbeat interval
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Applied entries beyond the last snapshot before compacting the log
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// How long a proposal may wait for commit
    #[serde(default = "default_proposal_timeout")]
    pub proposal_timeout_ms: u64,

    /// Per-RPC timeout between peers
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// Maximum entries shipped in one AppendEntries
    #[serde(default = "default_max_append_entries")]
    pub max_append_entries: usize,
}

fn default_election_timeout() -> u64 {
    300
}
fn default_heartbeat_interval() -> u64 {
    50
}
fn default_snapshot_threshold() -> u64 {
    10_000
}
fn default_proposal_timeout() -> u64 {
    5_000
}
fn default_rpc_timeout() -> u64 {
    1_000
}
fn default_max_append_entries() -> usize {
    256
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: default_election_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            snapshot_threshold: default_snapshot_threshold(),
            proposal_timeout_ms: default_proposal_timeout(),
            rpc_timeout_ms: default_rpc_timeout(),
            max_append_entries: default_max_append_entries(),
        }
    }
}

impl RaftConfig {
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Routing, quorum and bootstrap settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Bounded wait for each replica during write/query fan-out
    #[serde(default = "default_replica_timeout")]
    pub replica_timeout_ms: u64,

    /// Minimum replica acks for a write; majority of the replica set when unset
    #[serde(default)]
    pub write_quorum: Option<usize>,

    /// How long to wait for this node to become a committed member after start
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,

    /// Attempts for retryable metadata proposals
    #[serde(default = "default_propose_retries")]
    pub propose_retries: usize,

    /// How often writes a replica missed are replayed to it
    #[serde(default = "default_hint_interval")]
    pub hint_interval_ms: u64,
}

fn default_replica_timeout() -> u64 {
    2_000
}
fn default_join_timeout() -> u64 {
    30_000
}
fn default_propose_retries() -> usize {
    8
}
fn default_hint_interval() -> u64 {
    1_000
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replica_timeout_ms: default_replica_timeout(),
            write_quorum: None,
            join_timeout_ms: default_join_timeout(),
            propose_retries: default_propose_retries(),
            hint_interval_ms: default_hint_interval(),
        }
    }
}

impl ClusterConfig {
    pub fn replica_timeout(&self) -> Duration {
        Duration::from_millis(self.replica_timeout_ms)
    }
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
    pub fn hint_interval(&self) -> Duration {
        Duration::from_millis(self.hint_interval_ms)
    }
}

/// Shard store options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `rocksdb`, `memory` or `sled` (with the `sled-backend` feature)
    #[serde(default = "default_backend")]
    pub backend: String,

    /// fsync every batch
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,
}

fn default_backend() -> String {
    "rocksdb".to_string()
}
fn default_sync_writes() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sync_writes: default_sync_writes(),
        }
    }
}

impl Config {
    /// A single-node configuration rooted at `dir`
    pub fn single_node(node_id: NodeId, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            node_id,
            bind_addr: default_bind_addr(),
            advertise_addr: None,
            data_dir: dir.join("db"),
            raft_dir: dir.join("raft"),
            peers: Vec::new(),
            join: Vec::new(),
            log_level: default_log_level(),
            log_file: default_log_file(),
            raft: RaftConfig::default(),
            cluster: ClusterConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    /// Load configuration from a TOML file, overridden by `CHRONODB_*` variables
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(config::Environment::with_prefix("CHRONODB").separator("__"))
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("data_dir cannot be empty".into()));
        }
        if self.raft_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("raft_dir cannot be empty".into()));
        }
        if self.data_dir == self.raft_dir {
            return Err(Error::InvalidConfig(
                "data_dir and raft_dir must be distinct".into(),
            ));
        }
        if self.raft.election_timeout_ms == 0 || self.raft.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig("raft timings must be non-zero".into()));
        }
        if self.raft.heartbeat_interval_ms >= self.raft.election_timeout_ms {
            return Err(Error::InvalidConfig(
                "heartbeat interval must be shorter than the election timeout".into(),
            ));
        }
        if self.cluster.replica_timeout_ms == 0 || self.cluster.hint_interval_ms == 0 {
            return Err(Error::InvalidConfig("cluster timings must be non-zero".into()));
        }
        if self.cluster.write_quorum == Some(0) {
            return Err(Error::InvalidConfig("write_quorum must be at least 1".into()));
        }
        match self.storage.backend.as_str() {
            "rocksdb" | "memory" => {}
            #[cfg(feature = "sled-backend")]
            "sled" => {}
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unknown storage backend: {}",
                    other
                )))
            }
        }
        let mut ids: Vec<NodeId> = self.peers.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.peers.len() {
            return Err(Error::InvalidConfig("duplicate peer ids".into()));
        }
        Ok(())
    }

    /// Address other nodes use for this one
    pub fn advertise_addr(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.bind_addr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
node_id = 2
bind_addr = "127.0.0.1:9002"
data_dir = "/var/lib/chronodb/db"
raft_dir = "/var/lib/chronodb/raft"
peers = [{{ id = 1, addr = "10.0.0.1:9001" }}, {{ id = 2, addr = "10.0.0.2:9002" }}]

[raft]
election_timeout_ms = 500

[cluster]
write_quorum = 2
"#
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.node_id, 2);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.raft.election_timeout_ms, 500);
        assert_eq!(config.raft.heartbeat_interval_ms, 50);
        assert_eq!(config.cluster.write_quorum, Some(2));
        assert_eq!(config.storage.backend, "rocksdb");
        assert_eq!(config.advertise_addr(), "127.0.0.1:9002");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::single_node(1, "/tmp/chronodb");
        assert!(config.validate().is_ok());

        config.raft.heartbeat_interval_ms = config.raft.election_timeout_ms;
        assert!(config.validate().is_err());

        let mut config = Config::single_node(1, "/tmp/chronodb");
        config.storage.backend = "leveldb".into();
        assert!(config.validate().is_err());

        let mut config = Config::single_node(1, "/tmp/chronodb");
        config.raft_dir = config.data_dir.clone();
        assert!(config.validate().is_err());
    }
}
