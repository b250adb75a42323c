//! Cluster join and root account bootstrap
//!
//! Runs in the background after the node starts. The root account is only
//! touched once this node is a committed member and a leader is known.

use crate::common::{Config, Error, NodeId, Result};
use crate::metadata::{ApplyOutcome, MetaClient, NodeInfo};
use crate::raft::RaftNode;
use crate::transport::{JoinRequest, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Is this node in the committed membership with a known leader?
pub fn is_joined(raft: &RaftNode) -> bool {
    raft.is_member() && raft.leader().is_some()
}

pub(crate) fn bootstrap_nodes(config: &Config) -> Vec<NodeInfo> {
    if config.peers.is_empty() && config.join.is_empty() {
        return vec![NodeInfo {
            id: config.node_id,
            addr: config.advertise_addr(),
        }];
    }
    config
        .peers
        .iter()
        .map(|p| NodeInfo {
            id: p.id,
            addr: p.addr.clone(),
        })
        .collect()
}

fn is_bootstrap_voter(config: &Config, id: NodeId) -> bool {
    bootstrap_nodes(config).iter().any(|n| n.id == id)
}

/// Wait until this node is a committed member, seeding or joining the
/// cluster as needed
pub async fn join_cluster(
    config: &Config,
    raft: &RaftNode,
    meta: &MetaClient,
    transport: &Arc<dyn Transport>,
) -> Result<()> {
    let deadline = Instant::now() + config.cluster.join_timeout();
    let poll = config.raft.heartbeat_interval().max(Duration::from_millis(10));
    let me = NodeInfo {
        id: config.node_id,
        addr: config.advertise_addr(),
    };
    let voter = is_bootstrap_voter(config, config.node_id);
    let mut join_sent = false;

    loop {
        if is_joined(raft) {
            tracing::info!(
                "Node {} joined the cluster (leader {:?})",
                config.node_id,
                raft.leader()
            );
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout(format!(
                "node {} did not join within {:?}",
                config.node_id,
                config.cluster.join_timeout()
            )));
        }

        if voter {
            if raft.leader().is_some() {
                if let Err(e) = meta.ensure_cluster_initialized(bootstrap_nodes(config)).await {
                    tracing::debug!("Cluster initialization pending: {}", e);
                }
            }
        } else if !join_sent {
            for addr in &config.join {
                match transport.join(addr, JoinRequest { node: me.clone() }).await {
                    Ok(response) => {
                        tracing::info!(
                            "Join accepted by {} at index {}",
                            addr,
                            response.index
                        );
                        join_sent = true;
                        break;
                    }
                    Err(e) => tracing::debug!("Join via {} failed: {}", addr, e),
                }
            }
        }

        tokio::time::sleep(poll).await;
    }
}

/// Join, then make sure the root account exists; optionally reset it
pub async fn run(
    config: Config,
    raft: Arc<RaftNode>,
    meta: MetaClient,
    transport: Arc<dyn Transport>,
    reset_root: bool,
) -> Result<()> {
    join_cluster(&config, &raft, &meta, &transport).await?;

    match meta.create_root_user_if_absent().await? {
        ApplyOutcome::Applied => tracing::info!("Root user bootstrapped by node {}", config.node_id),
        outcome => tracing::debug!("Root user already present ({:?})", outcome),
    }

    if reset_root {
        meta.reset_root_password().await?;
    }
    Ok(())
}
