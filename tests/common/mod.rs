//! In-process cluster harness: nodes talk through `MemoryNetwork`, which calls
//! the peer's `RpcHandler` directly and can cut links.

#![allow(dead_code)]

use chronodb::common::{Config, Error, NodeId, PeerConfig, Peer, Result};
use chronodb::raft::{
    AppendRequest, AppendResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    ProposeRequest, Proposed, VoteRequest, VoteResponse,
};
use chronodb::storage::VersionedPoint;
use chronodb::transport::{
    JoinRequest, JoinResponse, RpcHandler, ShardScanRequest, ShardWriteRequest, Transport,
};
use chronodb::{Node, NodeOptions};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
pub struct MemoryNetwork {
    handlers: Mutex<HashMap<String, RpcHandler>>,
    /// Cut links, stored in both directions
    cut: Mutex<HashSet<(String, String)>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, addr: &str, handler: RpcHandler) {
        self.handlers
            .lock()
            .unwrap()
            .insert(addr.to_string(), handler);
    }

    pub fn transport_for(self: &Arc<Self>, addr: &str) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport {
            from: addr.to_string(),
            net: self.clone(),
        })
    }

    pub fn cut(&self, a: &str, b: &str) {
        let mut cut = self.cut.lock().unwrap();
        cut.insert((a.to_string(), b.to_string()));
        cut.insert((b.to_string(), a.to_string()));
    }

    /// Cut `addr` off from every registered node
    pub fn isolate(&self, addr: &str) {
        let others: Vec<String> = self.handlers.lock().unwrap().keys().cloned().collect();
        for other in others.iter().filter(|o| o.as_str() != addr) {
            self.cut(addr, other);
        }
    }

    pub fn heal(&self) {
        self.cut.lock().unwrap().clear();
    }

    /// Drop every registered handler so stopped nodes release their stores
    pub fn clear(&self) {
        self.handlers.lock().unwrap().clear();
    }

    fn route(&self, from: &str, to: &str) -> Result<RpcHandler> {
        if self
            .cut
            .lock()
            .unwrap()
            .contains(&(from.to_string(), to.to_string()))
        {
            return Err(Error::ConnectionFailed(format!("{} -> {} is cut", from, to)));
        }
        self.handlers
            .lock()
            .unwrap()
            .get(to)
            .cloned()
            .ok_or_else(|| Error::ConnectionFailed(format!("no node at {}", to)))
    }
}

struct MemoryTransport {
    from: String,
    net: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    fn call<T, F, Fut>(&self, to: &str, f: F) -> BoxFuture<'static, Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(RpcHandler) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let target = self.net.route(&self.from, to);
        async move { f(target?).await }.boxed()
    }
}

impl Transport for MemoryTransport {
    fn request_vote(&self, peer: &Peer, request: VoteRequest) -> BoxFuture<'static, Result<VoteResponse>> {
        self.call(&peer.addr, move |h| async move { h.request_vote(request) })
    }

    fn append_entries(
        &self,
        peer: &Peer,
        request: AppendRequest,
    ) -> BoxFuture<'static, Result<AppendResponse>> {
        self.call(&peer.addr, move |h| async move { h.append_entries(request) })
    }

    fn install_snapshot(
        &self,
        peer: &Peer,
        request: InstallSnapshotRequest,
    ) -> BoxFuture<'static, Result<InstallSnapshotResponse>> {
        self.call(&peer.addr, move |h| async move { h.install_snapshot(request) })
    }

    fn forward_proposal(
        &self,
        peer: &Peer,
        request: ProposeRequest,
    ) -> BoxFuture<'static, Result<Proposed>> {
        self.call(&peer.addr, move |h| async move { h.propose(request).await })
    }

    fn join(&self, addr: &str, request: JoinRequest) -> BoxFuture<'static, Result<JoinResponse>> {
        self.call(addr, move |h| async move { h.join(request).await })
    }

    fn write_points(
        &self,
        peer: &Peer,
        request: ShardWriteRequest,
    ) -> BoxFuture<'static, Result<()>> {
        self.call(&peer.addr, move |h| async move { h.shard_write(request).await })
    }

    fn scan(
        &self,
        peer: &Peer,
        request: ShardScanRequest,
    ) -> BoxFuture<'static, Result<Vec<VersionedPoint>>> {
        self.call(&peer.addr, move |h| async move { h.shard_scan(request).await })
    }
}

pub fn addr(id: NodeId) -> String {
    format!("node-{}", id)
}

/// Fast timings, in-memory shard stores
pub fn test_config(id: NodeId, dir: &std::path::Path, peers: &[NodeId]) -> Config {
    let mut config = Config::single_node(id, dir);
    config.advertise_addr = Some(addr(id));
    config.peers = peers
        .iter()
        .map(|&p| PeerConfig { id: p, addr: addr(p) })
        .collect();
    config.storage.backend = "memory".into();
    config.raft.election_timeout_ms = 150;
    config.raft.heartbeat_interval_ms = 30;
    config.raft.rpc_timeout_ms = 200;
    config.raft.proposal_timeout_ms = 3_000;
    config.cluster.replica_timeout_ms = 500;
    config.cluster.join_timeout_ms = 20_000;
    config.cluster.hint_interval_ms = 100;
    config
}

pub struct TestCluster {
    pub net: Arc<MemoryNetwork>,
    pub nodes: Vec<Node>,
    dirs: Vec<TempDir>,
}

impl TestCluster {
    /// Start `size` bootstrap voters with ids 1..=size
    pub async fn start(size: u64) -> Self {
        Self::start_with(size, |_| {}).await
    }

    pub async fn start_with(size: u64, configure: impl Fn(&mut Config)) -> Self {
        let cluster = Self::open(size, configure);
        for node in &cluster.nodes {
            node.start();
        }
        cluster
    }

    /// Open and register `size` voters without starting anything
    pub fn open(size: u64, configure: impl Fn(&mut Config)) -> Self {
        let ids: Vec<NodeId> = (1..=size).collect();
        let net = MemoryNetwork::new();
        let mut nodes = Vec::new();
        let mut dirs = Vec::new();
        for &id in &ids {
            let dir = TempDir::new().unwrap();
            let mut config = test_config(id, dir.path(), &ids);
            configure(&mut config);
            let node = Node::open(config, NodeOptions::default(), net.transport_for(&addr(id))).unwrap();
            net.register(&addr(id), node.handler().clone());
            nodes.push(node);
            dirs.push(dir);
        }
        Self { net, nodes, dirs }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[(id - 1) as usize]
    }

    pub fn leader(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.raft().is_leader())
    }

    /// Every node joined and the root user visible everywhere
    pub async fn wait_ready(&self) {
        let ready = wait_until(Duration::from_secs(30), || {
            self.nodes
                .iter()
                .all(|n| n.is_joined() && n.meta().store().snapshot().has_admin())
        })
        .await;
        assert!(ready, "cluster did not become ready");
    }

    pub async fn wait_leader(&self) -> &Node {
        assert!(
            wait_until(Duration::from_secs(10), || self.leader().is_some()).await,
            "no leader elected"
        );
        self.leader().unwrap()
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            let _ = node.shutdown();
        }
    }
}

pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
