//! Node lifecycle
//!
//! Startup order:
//! 1. Create the data and consensus directories
//! 2. Repair every shard store when asked (a failure aborts startup)
//! 3. Open local shards and the consensus store, restore metadata
//! 4. Start Raft, then join the cluster and bootstrap the root account in
//!    the background
//! 5. Serve HTTP

pub mod bootstrap;

use crate::common::{Config, Peer, Result};
use crate::metadata::{MetaClient, MetadataStore};
use crate::raft::{RaftNode, RaftStorage};
use crate::router::{HintQueue, RequestRouter};
use crate::storage::shards::HINTS_DIR;
use crate::storage::{backend_from_config, repair_data_dir, LocalShards};
use crate::transport::{app, RpcHandler, Transport};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Startup switches that are not part of the persistent configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeOptions {
    /// Repair every shard store before opening anything
    pub repair: bool,
    /// Reset the root credential to the default once joined
    pub reset_root: bool,
}

pub struct Node {
    config: Config,
    options: NodeOptions,
    raft: Arc<RaftNode>,
    meta: MetaClient,
    router: Arc<RequestRouter>,
    shards: Arc<LocalShards>,
    handler: RpcHandler,
    transport: Arc<dyn Transport>,
}

impl Node {
    /// Open everything on disk. Nothing runs until `start`.
    pub fn open(config: Config, options: NodeOptions, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        tracing::info!("Opening node {}", config.node_id);
        tracing::info!("  data dir: {}", config.data_dir.display());
        tracing::info!("  raft dir: {}", config.raft_dir.display());

        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.raft_dir)?;

        let backend = backend_from_config(&config.storage)?;
        tracing::info!("  storage: {} {}", backend.name(), backend.version());
        if options.repair {
            let report = repair_data_dir(backend.as_ref(), &config.data_dir)?;
            tracing::info!(
                "Repaired {} shard stores ({} entries skipped)",
                report.repaired.len(),
                report.skipped.len()
            );
        }
        let hints = Arc::new(HintQueue::open(
            backend.as_ref(),
            config.data_dir.join(HINTS_DIR),
        )?);
        let shards = Arc::new(LocalShards::open(&config.data_dir, backend)?);

        let store = Arc::new(MetadataStore::new());
        let raft_storage = RaftStorage::open(&config.raft_dir)?;
        let peers: Vec<Peer> = bootstrap::bootstrap_nodes(&config)
            .into_iter()
            .map(|n| Peer::new(n.id, n.addr))
            .collect();
        let raft = RaftNode::new(
            config.node_id,
            config.raft.clone(),
            peers,
            raft_storage,
            store.clone(),
            transport.clone(),
        )?;

        let meta = MetaClient::new(
            raft.clone(),
            store,
            config.cluster.clone(),
            config.raft.proposal_timeout(),
        );
        let router = Arc::new(RequestRouter::new(
            config.node_id,
            meta.clone(),
            shards.clone(),
            hints,
            transport.clone(),
            config.cluster.clone(),
        ));
        let handler = RpcHandler::new(raft.clone(), meta.clone(), router.clone());

        Ok(Self {
            config,
            options,
            raft,
            meta,
            router,
            shards,
            handler,
            transport,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
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

    pub fn shards(&self) -> &Arc<LocalShards> {
        &self.shards
    }

    pub fn handler(&self) -> &RpcHandler {
        &self.handler
    }

    pub fn is_joined(&self) -> bool {
        bootstrap::is_joined(&self.raft)
    }

    /// Seed or join the cluster and wait for committed membership.
    /// `start` already runs this in the background.
    pub async fn join_cluster(&self) -> Result<()> {
        bootstrap::join_cluster(&self.config, &self.raft, &self.meta, &self.transport).await
    }

    /// Start consensus, hint replay and the background join + root bootstrap.
    /// Bootstrap failures are logged; the node keeps serving.
    pub fn start(&self) -> JoinHandle<()> {
        self.raft.start();
        self.router.start();
        let config = self.config.clone();
        let raft = self.raft.clone();
        let meta = self.meta.clone();
        let transport = self.transport.clone();
        let reset_root = self.options.reset_root;
        tokio::spawn(async move {
            let node_id = config.node_id;
            if let Err(e) = bootstrap::run(config, raft, meta, transport, reset_root).await {
                tracing::error!("Bootstrap of node {} failed: {}", node_id, e);
            }
        })
    }

    /// Serve HTTP until ctrl-c
    pub async fn serve(&self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(
            "Node {} listening on {} (advertised as {})",
            self.config.node_id,
            self.config.bind_addr,
            self.config.advertise_addr()
        );
        axum::serve(listener, app(self.handler.clone()))
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown requested");
            })
            .await?;
        Ok(())
    }

    /// Stop consensus and hint replay, flush local shards and hints
    pub fn shutdown(&self) -> Result<()> {
        self.raft.shutdown();
        self.router.shutdown();
        self.shards.flush_all()?;
        self.router.hints().flush()?;
        tracing::info!("Node {} stopped", self.config.node_id);
        Ok(())
    }
}
