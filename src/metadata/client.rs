//! Metadata operations for the rest of the node
//!
//! Every mutation goes through consensus. Retries reuse the original
//! proposal (and its request id), so a retried mutation applies once.

use crate::common::{retry_with_backoff, select_replicas, ClusterConfig, Error, Result};
use crate::metadata::auth;
use crate::metadata::command::{ApplyOutcome, MetadataCommand, Proposal};
use crate::metadata::store::{MetadataStore, Resolution, ShardPlan};
use crate::metadata::types::{NodeInfo, Shard, ShardSpace, User, DEFAULT_ROOT_PASSWORD};
use crate::raft::{EntryKind, RaftNode};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;

static DEFAULT_ROOT_HASH: OnceCell<String> = OnceCell::new();

const RETRY_DELAY: Duration = Duration::from_millis(50);

/// A committed mutation and what it did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub index: u64,
    pub outcome: ApplyOutcome,
}

#[derive(Clone)]
pub struct MetaClient {
    raft: Arc<RaftNode>,
    store: Arc<MetadataStore>,
    config: ClusterConfig,
    apply_wait: Duration,
}

impl MetaClient {
    pub fn new(
        raft: Arc<RaftNode>,
        store: Arc<MetadataStore>,
        config: ClusterConfig,
        apply_wait: Duration,
    ) -> Self {
        Self {
            raft,
            store,
            config,
            apply_wait,
        }
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    /// Propose, retrying retryable failures with the same proposal, then wait
    /// until the entry is visible in the local store.
    pub async fn propose(&self, command: MetadataCommand) -> Result<Committed> {
        self.propose_with(Proposal::new(command)).await
    }

    pub async fn propose_with(&self, proposal: Proposal) -> Result<Committed> {
        let kind = if proposal.command.is_membership() {
            EntryKind::Membership
        } else {
            EntryKind::Command
        };
        let data = proposal.encode()?;
        let proposed = retry_with_backoff(
            || {
                let raft = self.raft.clone();
                let data = data.clone();
                async move { raft.propose(kind, data).await }
            },
            self.config.propose_retries,
            RETRY_DELAY,
        )
        .await?;

        let outcome = ApplyOutcome::decode(&proposed.response)?;
        self.store
            .wait_for_version(proposed.index, self.apply_wait)
            .await?;
        tracing::debug!(
            "Proposal {} committed at {}: {:?}",
            proposal.id,
            proposed.index,
            outcome
        );
        Ok(Committed {
            index: proposed.index,
            outcome,
        })
    }

    /// Propose and turn a rejection into an error
    async fn mutate(&self, command: MetadataCommand) -> Result<Committed> {
        let committed = self.propose(command).await?;
        if let ApplyOutcome::Rejected(reason) = &committed.outcome {
            return Err(Error::Rejected(reason.clone()));
        }
        Ok(committed)
    }

    /// Seed the voter set from the bootstrap peers if nobody has yet
    pub async fn ensure_cluster_initialized(&self, nodes: Vec<NodeInfo>) -> Result<()> {
        if !self.store.snapshot().nodes.is_empty() {
            return Ok(());
        }
        self.mutate(MetadataCommand::InitializeCluster { nodes })
            .await
            .map(|_| ())
    }

    pub async fn add_node(&self, node: NodeInfo) -> Result<Committed> {
        if self.store.snapshot().nodes.get(&node.id) == Some(&node) {
            return Ok(Committed {
                index: self.store.version(),
                outcome: ApplyOutcome::Unchanged,
            });
        }
        tracing::info!("Adding node {} at {}", node.id, node.addr);
        self.mutate(MetadataCommand::AddNode(node)).await
    }

    pub async fn remove_node(&self, id: u64) -> Result<Committed> {
        tracing::info!("Removing node {}", id);
        self.mutate(MetadataCommand::RemoveNode(id)).await
    }

    pub async fn create_database(&self, name: &str, space: ShardSpace) -> Result<Committed> {
        self.mutate(MetadataCommand::CreateDatabase {
            name: name.to_string(),
            space,
        })
        .await
    }

    pub async fn create_shard_space(
        &self,
        database: &str,
        space: ShardSpace,
        make_default: bool,
    ) -> Result<Committed> {
        self.mutate(MetadataCommand::CreateShardSpace {
            database: database.to_string(),
            space,
            make_default,
        })
        .await
    }

    /// Committed shard for `plan`, creating it first if needed
    pub async fn ensure_shard(&self, plan: &ShardPlan) -> Result<Shard> {
        let nodes = self.store.node_ids();
        if nodes.len() < plan.replication_factor {
            return Err(Error::InsufficientReplicas {
                needed: plan.replication_factor,
                available: nodes.len(),
            });
        }
        let replicas = select_replicas(&plan.placement_key(), &nodes, plan.replication_factor);
        tracing::info!(
            "Creating shard {}/{} [{}, {}) on {:?}",
            plan.database,
            plan.space,
            plan.start,
            plan.end,
            replicas
        );
        self.mutate(MetadataCommand::CreateShard {
            database: plan.database.clone(),
            space: plan.space.clone(),
            start: plan.start,
            end: plan.end,
            replicas,
        })
        .await?;

        match self.store.resolve(&plan.database, plan.start)? {
            Resolution::Existing(shard) => Ok(shard),
            Resolution::Missing(_) => Err(Error::Internal(format!(
                "shard {}/{} at {} missing after commit",
                plan.database, plan.space, plan.start
            ))),
        }
    }

    pub async fn set_shard_replicas(&self, shard: u64, replicas: Vec<u64>) -> Result<Committed> {
        self.mutate(MetadataCommand::SetShardReplicas { shard, replicas })
            .await
    }

    pub async fn create_user(&self, name: &str, password: &str, is_admin: bool) -> Result<Committed> {
        let password_hash = auth::hash_password_blocking(password.to_string()).await?;
        self.mutate(MetadataCommand::CreateUser {
            name: name.to_string(),
            password_hash,
            is_admin,
        })
        .await
    }

    pub async fn change_password(&self, name: &str, password: &str) -> Result<Committed> {
        let password_hash = auth::hash_password_blocking(password.to_string()).await?;
        self.mutate(MetadataCommand::ChangePassword {
            name: name.to_string(),
            password_hash,
        })
        .await
    }

    /// Check credentials against the local metadata
    pub async fn authenticate(&self, name: &str, password: &str) -> Result<User> {
        let user = self
            .store
            .user(name)
            .ok_or_else(|| Error::Auth("invalid credentials".into()))?;
        let hash = user.password_hash.clone();
        let password = password.to_string();
        let valid =
            tokio::task::spawn_blocking(move || auth::verify_password(&password, &hash)).await?;
        if valid {
            Ok(user)
        } else {
            Err(Error::Auth("invalid credentials".into()))
        }
    }

    async fn default_root_hash() -> Result<String> {
        if let Some(hash) = DEFAULT_ROOT_HASH.get() {
            return Ok(hash.clone());
        }
        let hash = auth::hash_password_blocking(DEFAULT_ROOT_PASSWORD.to_string()).await?;
        Ok(DEFAULT_ROOT_HASH.get_or_init(|| hash).clone())
    }

    /// Make sure an admin exists. Safe to run on every node at once: the
    /// mutation is conditional at apply time, so only one proposal creates it.
    pub async fn create_root_user_if_absent(&self) -> Result<ApplyOutcome> {
        if self.store.snapshot().has_admin() {
            tracing::debug!("Admin user already present");
            return Ok(ApplyOutcome::Unchanged);
        }
        let password_hash = Self::default_root_hash().await?;
        let committed = self
            .mutate(MetadataCommand::CreateRootUserIfAbsent { password_hash })
            .await?;
        if committed.outcome == ApplyOutcome::Applied {
            tracing::info!("Created root user");
        }
        Ok(committed.outcome)
    }

    /// Reset the admin credential to the default
    pub async fn reset_root_password(&self) -> Result<ApplyOutcome> {
        let password_hash = Self::default_root_hash().await?;
        let committed = self
            .mutate(MetadataCommand::ResetRootPassword { password_hash })
            .await?;
        tracing::warn!("Root password reset to the default");
        Ok(committed.outcome)
    }
}
