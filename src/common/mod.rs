//! Common utilities and types shared across chronodb

pub mod config;
pub mod error;
pub mod hash;
pub mod logging;
pub mod utils;

pub use config::{ClusterConfig, Config, PeerConfig, RaftConfig, StorageConfig};
pub use error::{Error, Result, RpcError};
pub use hash::{crc32, hrw_hash, select_replicas};
pub use utils::{parse_duration, retry_with_backoff, timestamp_now_nanos};

/// Cluster-wide node identifier
pub type NodeId = u64;

/// A peer as seen by the transport: id plus reachable address
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub addr: String,
}

impl Peer {
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}
