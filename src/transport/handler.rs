//! Server-side dispatch of internal RPCs
//!
//! Shared by the HTTP routes and by in-process transports.

use crate::common::Result;
use crate::metadata::MetaClient;
use crate::raft::{
    AppendRequest, AppendResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    ProposeRequest, Proposed, RaftNode, VoteRequest, VoteResponse,
};
use crate::router::RequestRouter;
use crate::storage::VersionedPoint;
use crate::transport::{JoinRequest, JoinResponse, ShardScanRequest, ShardWriteRequest};
use std::sync::Arc;

#[derive(Clone)]
pub struct RpcHandler {
    raft: Arc<RaftNode>,
    meta: MetaClient,
    router: Arc<RequestRouter>,
}

impl RpcHandler {
    pub fn new(raft: Arc<RaftNode>, meta: MetaClient, router: Arc<RequestRouter>) -> Self {
        Self { raft, meta, router }
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub fn meta(&self) -> &MetaClient {
        &self.meta
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    pub fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        self.raft.handle_request_vote(request)
    }

    pub fn append_entries(&self, request: AppendRequest) -> Result<AppendResponse> {
        self.raft.handle_append_entries(request)
    }

    pub fn install_snapshot(&self, request: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        self.raft.handle_install_snapshot(request)
    }

    pub async fn propose(&self, request: ProposeRequest) -> Result<Proposed> {
        self.raft.handle_propose(request).await
    }

    pub async fn join(&self, request: JoinRequest) -> Result<JoinResponse> {
        tracing::info!(
            "Join request from node {} at {}",
            request.node.id,
            request.node.addr
        );
        let committed = self.meta.add_node(request.node).await?;
        Ok(JoinResponse {
            index: committed.index,
            leader: self.raft.leader(),
        })
    }

    pub async fn shard_write(&self, request: ShardWriteRequest) -> Result<()> {
        self.router
            .write_local(request.shard, request.points, request.written_at)
            .await
    }

    pub async fn shard_scan(&self, request: ShardScanRequest) -> Result<Vec<VersionedPoint>> {
        self.router
            .scan_local(request.shard, request.series, request.start, request.end)
            .await
    }
}
