//! HTTP client side of the internal RPCs
//!
//! Requests and replies are bincode. Every reply body is a
//! `Result<T, RpcError>`, so remote failures keep their retryability.

use crate::common::{Error, Peer, Result, RpcError};
use crate::raft::{
    AppendRequest, AppendResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    ProposeRequest, Proposed, VoteRequest, VoteResponse,
};
use crate::storage::VersionedPoint;
use crate::transport::{
    JoinRequest, JoinResponse, ShardScanRequest, ShardWriteRequest, Transport,
};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

pub const PATH_VOTE: &str = "/internal/raft/vote";
pub const PATH_APPEND: &str = "/internal/raft/append";
pub const PATH_SNAPSHOT: &str = "/internal/raft/snapshot";
pub const PATH_PROPOSE: &str = "/internal/raft/propose";
pub const PATH_JOIN: &str = "/internal/cluster/join";
pub const PATH_SHARD_WRITE: &str = "/internal/shard/write";
pub const PATH_SHARD_SCAN: &str = "/internal/shard/scan";

pub const BINCODE_CONTENT_TYPE: &str = "application/x-bincode";

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("http client: {}", e)))?;
        Ok(Self { client })
    }

    fn call<Req, Resp>(&self, addr: &str, path: &str, request: Req) -> BoxFuture<'static, Result<Resp>>
    where
        Req: Serialize + Send + 'static,
        Resp: DeserializeOwned + Send + 'static,
    {
        let client = self.client.clone();
        let url = format!("http://{}{}", addr, path);
        async move {
            let body = Bytes::from(bincode::serialize(&request)?);
            let response = client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, BINCODE_CONTENT_TYPE)
                .body(body)
                .send()
                .await?;
            let status = response.status();
            let body: Bytes = response.bytes().await?;
            let reply: std::result::Result<Resp, RpcError> = bincode::deserialize(&body)
                .map_err(|e| {
                    Error::ConnectionFailed(format!("bad reply from {} ({}): {}", url, status, e))
                })?;
            reply.map_err(Error::from)
        }
        .boxed()
    }
}

impl Transport for HttpTransport {
    fn request_vote(
        &self,
        peer: &Peer,
        request: VoteRequest,
    ) -> BoxFuture<'static, Result<VoteResponse>> {
        self.call(&peer.addr, PATH_VOTE, request)
    }

    fn append_entries(
        &self,
        peer: &Peer,
        request: AppendRequest,
    ) -> BoxFuture<'static, Result<AppendResponse>> {
        self.call(&peer.addr, PATH_APPEND, request)
    }

    fn install_snapshot(
        &self,
        peer: &Peer,
        request: InstallSnapshotRequest,
    ) -> BoxFuture<'static, Result<InstallSnapshotResponse>> {
        self.call(&peer.addr, PATH_SNAPSHOT, request)
    }

    fn forward_proposal(
        &self,
        peer: &Peer,
        request: ProposeRequest,
    ) -> BoxFuture<'static, Result<Proposed>> {
        self.call(&peer.addr, PATH_PROPOSE, request)
    }

    fn join(&self, addr: &str, request: JoinRequest) -> BoxFuture<'static, Result<JoinResponse>> {
        self.call(addr, PATH_JOIN, request)
    }

    fn write_points(
        &self,
        peer: &Peer,
        request: ShardWriteRequest,
    ) -> BoxFuture<'static, Result<()>> {
        self.call(&peer.addr, PATH_SHARD_WRITE, request)
    }

    fn scan(
        &self,
        peer: &Peer,
        request: ShardScanRequest,
    ) -> BoxFuture<'static, Result<Vec<VersionedPoint>>> {
        self.call(&peer.addr, PATH_SHARD_SCAN, request)
    }
}
