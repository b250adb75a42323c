//! Node-to-node transport
//!
//! `Transport` is what the Raft node and the request router use to reach
//! peers. `HttpTransport` speaks bincode over HTTP to the routes mounted by
//! `server::internal_routes`; tests plug in an in-process network instead.

pub mod handler;
pub mod http;
pub mod server;

use crate::common::{NodeId, Peer, Result};
use crate::metadata::NodeInfo;
use crate::raft::{
    AppendRequest, AppendResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    ProposeRequest, Proposed, VoteRequest, VoteResponse,
};
use crate::storage::{SeriesPoint, VersionedPoint};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

pub use handler::RpcHandler;
pub use http::HttpTransport;
pub use server::{app, client_routes, internal_routes};

/// Ask a member to add `node` to the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node: NodeInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    /// Log index at which the membership change committed
    pub index: u64,
    pub leader: Option<NodeId>,
}

/// Points for one shard replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardWriteRequest {
    pub shard: u64,
    /// Version stamped by the coordinating node
    pub written_at: u64,
    pub points: Vec<SeriesPoint>,
}

/// Range read against one shard replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardScanRequest {
    pub shard: u64,
    /// Empty reads every series of the shard
    pub series: Vec<String>,
    pub start: i64,
    pub end: i64,
}

pub trait Transport: Send + Sync + 'static {
    fn request_vote(&self, peer: &Peer, request: VoteRequest)
        -> BoxFuture<'static, Result<VoteResponse>>;

    fn append_entries(
        &self,
        peer: &Peer,
        request: AppendRequest,
    ) -> BoxFuture<'static, Result<AppendResponse>>;

    fn install_snapshot(
        &self,
        peer: &Peer,
        request: InstallSnapshotRequest,
    ) -> BoxFuture<'static, Result<InstallSnapshotResponse>>;

    fn forward_proposal(
        &self,
        peer: &Peer,
        request: ProposeRequest,
    ) -> BoxFuture<'static, Result<Proposed>>;

    /// Contact a member by address only; the joiner knows no ids yet
    fn join(&self, addr: &str, request: JoinRequest) -> BoxFuture<'static, Result<JoinResponse>>;

    fn write_points(
        &self,
        peer: &Peer,
        request: ShardWriteRequest,
    ) -> BoxFuture<'static, Result<()>>;

    fn scan(
        &self,
        peer: &Peer,
        request: ShardScanRequest,
    ) -> BoxFuture<'static, Result<Vec<VersionedPoint>>>;
}
