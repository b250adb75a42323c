//! Metadata mutations carried by the consensus log
//!
//! Every field a mutation needs is resolved by the proposer (credential
//! hashes, replica sets) so applying it is a pure function of the current
//! metadata and the command.

use crate::common::{NodeId, Result};
use crate::metadata::types::{
    ClusterMetadata, Database, NodeInfo, Shard, ShardId, ShardKey, ShardSpace, User, ROOT_USER,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataCommand {
    /// Seed the voter set; ignored once any node is known
    InitializeCluster { nodes: Vec<NodeInfo> },
    AddNode(NodeInfo),
    RemoveNode(NodeId),
    /// Create a database with its default space
    CreateDatabase { name: String, space: ShardSpace },
    CreateShardSpace {
        database: String,
        space: ShardSpace,
        make_default: bool,
    },
    /// Create the shard covering `[start, end)` unless one already exists
    CreateShard {
        database: String,
        space: String,
        start: i64,
        end: i64,
        replicas: Vec<NodeId>,
    },
    SetShardReplicas {
        shard: ShardId,
        replicas: Vec<NodeId>,
    },
    CreateUser {
        name: String,
        password_hash: String,
        is_admin: bool,
    },
    ChangePassword { name: String, password_hash: String },
    /// Create the root admin iff no admin exists at apply time
    CreateRootUserIfAbsent { password_hash: String },
    /// Set the admin credential, creating the root admin when none exists
    ResetRootPassword { password_hash: String },
}

impl MetadataCommand {
    /// Does this command change the voter set?
    pub fn is_membership(&self) -> bool {
        matches!(
            self,
            MetadataCommand::InitializeCluster { .. }
                | MetadataCommand::AddNode(_)
                | MetadataCommand::RemoveNode(_)
        )
    }
}

/// A command tagged with the id used for duplicate detection.
/// Retries of the same logical request reuse the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub command: MetadataCommand,
}

impl Proposal {
    pub fn new(command: MetadataCommand) -> Self {
        Self {
            id: Uuid::new_v4(),
            command,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Result of applying one committed command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Applied,
    /// Already in the requested state
    Unchanged,
    /// Same request id applied before
    Duplicate,
    /// Invalid against the state at apply time; nothing changed
    Rejected(String),
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, ApplyOutcome::Rejected(_))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

fn reject(reason: impl Into<String>) -> ApplyOutcome {
    ApplyOutcome::Rejected(reason.into())
}

fn check_space(space: &ShardSpace, node_count: usize) -> Option<ApplyOutcome> {
    if space.name.is_empty() {
        return Some(reject("shard space name cannot be empty"));
    }
    if space.shard_duration <= 0 {
        return Some(reject("shard duration must be positive"));
    }
    if space.replication_factor == 0 || space.replication_factor > node_count {
        return Some(reject(format!(
            "replication factor {} outside 1..={}",
            space.replication_factor, node_count
        )));
    }
    None
}

/// Apply `command` to `meta`. Does not touch `version` or the request log.
pub fn apply_command(meta: &mut ClusterMetadata, command: &MetadataCommand) -> ApplyOutcome {
    match command {
        MetadataCommand::InitializeCluster { nodes } => {
            if !meta.nodes.is_empty() {
                return ApplyOutcome::Unchanged;
            }
            if nodes.is_empty() {
                return reject("initial membership cannot be empty");
            }
            for node in nodes {
                meta.nodes.insert(node.id, node.clone());
            }
            ApplyOutcome::Applied
        }

        MetadataCommand::AddNode(node) => {
            if meta.nodes.is_empty() {
                return reject("cluster not initialized");
            }
            match meta.nodes.get(&node.id) {
                Some(existing) if existing == node => ApplyOutcome::Unchanged,
                _ => {
                    meta.nodes.insert(node.id, node.clone());
                    ApplyOutcome::Applied
                }
            }
        }

        MetadataCommand::RemoveNode(id) => {
            if !meta.nodes.contains_key(id) {
                return ApplyOutcome::Unchanged;
            }
            if meta.nodes.len() == 1 {
                return reject("cannot remove the last node");
            }
            meta.nodes.remove(id);
            ApplyOutcome::Applied
        }

        MetadataCommand::CreateDatabase { name, space } => {
            if meta.databases.contains_key(name) {
                return ApplyOutcome::Unchanged;
            }
            if name.is_empty() {
                return reject("database name cannot be empty");
            }
            if let Some(rejected) = check_space(space, meta.nodes.len()) {
                return rejected;
            }
            let mut spaces = std::collections::BTreeMap::new();
            spaces.insert(space.name.clone(), space.clone());
            meta.databases.insert(
                name.clone(),
                Database {
                    name: name.clone(),
                    default_space: space.name.clone(),
                    spaces,
                },
            );
            ApplyOutcome::Applied
        }

        MetadataCommand::CreateShardSpace {
            database,
            space,
            make_default,
        } => {
            let node_count = meta.nodes.len();
            let Some(db) = meta.databases.get_mut(database) else {
                return reject(format!("database not found: {}", database));
            };
            if let Some(existing) = db.spaces.get(&space.name) {
                if existing != space {
                    return reject(format!("shard space {} already exists", space.name));
                }
                if !*make_default || db.default_space == space.name {
                    return ApplyOutcome::Unchanged;
                }
            } else {
                if let Some(rejected) = check_space(space, node_count) {
                    return rejected;
                }
                db.spaces.insert(space.name.clone(), space.clone());
            }
            if *make_default {
                db.default_space = space.name.clone();
            }
            ApplyOutcome::Applied
        }

        MetadataCommand::CreateShard {
            database,
            space,
            start,
            end,
            replicas,
        } => {
            let key = ShardKey {
                database: database.clone(),
                space: space.clone(),
                start: *start,
            };
            if meta.shard_index.contains_key(&key) {
                return ApplyOutcome::Unchanged;
            }
            let Some(shard_space) = meta
                .databases
                .get(database)
                .and_then(|db| db.spaces.get(space))
            else {
                return reject(format!("shard space {}/{} not found", database, space));
            };
            if shard_space.window(*start) != Some((*start, *end)) {
                return reject(format!(
                    "range [{}, {}) is not a window of {}/{}",
                    start, end, database, space
                ));
            }
            if replicas.is_empty() {
                return reject("shard needs at least one replica");
            }
            meta.next_shard_id += 1;
            let id = meta.next_shard_id;
            meta.shards.insert(
                id,
                Shard {
                    id,
                    database: database.clone(),
                    space: space.clone(),
                    start: *start,
                    end: *end,
                    replicas: replicas.clone(),
                },
            );
            meta.shard_index.insert(key, id);
            ApplyOutcome::Applied
        }

        MetadataCommand::SetShardReplicas { shard, replicas } => {
            if replicas.is_empty() {
                return reject("shard needs at least one replica");
            }
            if let Some(unknown) = replicas.iter().find(|id| !meta.nodes.contains_key(*id)) {
                return reject(format!("node {} is not a cluster member", unknown));
            }
            let mut distinct = replicas.clone();
            distinct.sort_unstable();
            distinct.dedup();
            if distinct.len() != replicas.len() {
                return reject("replica set lists a node twice");
            }
            let Some(existing) = meta.shards.get_mut(shard) else {
                return reject(format!("shard not found: {}", shard));
            };
            if &existing.replicas == replicas {
                return ApplyOutcome::Unchanged;
            }
            // Data is not copied; a surviving replica keeps it readable
            if !replicas.iter().any(|id| existing.replicas.contains(id)) {
                return reject(format!(
                    "new replicas of shard {} must keep one current replica",
                    shard
                ));
            }
            existing.replicas = replicas.clone();
            ApplyOutcome::Applied
        }

        MetadataCommand::CreateUser {
            name,
            password_hash,
            is_admin,
        } => {
            if name.is_empty() {
                return reject("user name cannot be empty");
            }
            if meta.users.contains_key(name) {
                return reject(format!("user {} already exists", name));
            }
            if *is_admin && meta.has_admin() {
                return reject("an admin user already exists");
            }
            meta.users.insert(
                name.clone(),
                User {
                    name: name.clone(),
                    password_hash: password_hash.clone(),
                    is_admin: *is_admin,
                },
            );
            ApplyOutcome::Applied
        }

        MetadataCommand::ChangePassword {
            name,
            password_hash,
        } => {
            let Some(user) = meta.users.get_mut(name) else {
                return reject(format!("user not found: {}", name));
            };
            user.password_hash = password_hash.clone();
            ApplyOutcome::Applied
        }

        MetadataCommand::CreateRootUserIfAbsent { password_hash } => {
            if meta.has_admin() {
                return ApplyOutcome::Unchanged;
            }
            insert_root(meta, password_hash)
        }

        MetadataCommand::ResetRootPassword { password_hash } => {
            if !meta.has_admin() {
                return insert_root(meta, password_hash);
            }
            for user in meta.users.values_mut().filter(|u| u.is_admin) {
                user.password_hash = password_hash.clone();
            }
            ApplyOutcome::Applied
        }
    }
}

/// Create the root admin. An ordinary account already named root is never
/// promoted.
fn insert_root(meta: &mut ClusterMetadata, password_hash: &str) -> ApplyOutcome {
    if meta.users.contains_key(ROOT_USER) {
        return reject(format!("non-admin user {} already exists", ROOT_USER));
    }
    meta.users.insert(
        ROOT_USER.to_string(),
        User {
            name: ROOT_USER.to_string(),
            password_hash: password_hash.to_string(),
            is_admin: true,
        },
    );
    ApplyOutcome::Applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn three_nodes() -> ClusterMetadata {
        let mut meta = ClusterMetadata::default();
        let nodes = (1..=3)
            .map(|id| NodeInfo {
                id,
                addr: format!("10.0.0.{}:8086", id),
            })
            .collect();
        assert_eq!(
            apply_command(&mut meta, &MetadataCommand::InitializeCluster { nodes }),
            ApplyOutcome::Applied
        );
        meta
    }

    fn hour_space(rf: usize) -> ShardSpace {
        ShardSpace::new("default", Duration::from_secs(3600), rf)
    }

    #[test]
    fn test_initialize_only_once() {
        let mut meta = three_nodes();
        let again = MetadataCommand::InitializeCluster {
            nodes: vec![NodeInfo {
                id: 9,
                addr: "x".into(),
            }],
        };
        assert_eq!(apply_command(&mut meta, &again), ApplyOutcome::Unchanged);
        assert_eq!(meta.node_ids(), vec![1, 2, 3]);
    }

    #[test]
    fn test_replication_factor_bounded_by_nodes() {
        let mut meta = three_nodes();
        let too_wide = MetadataCommand::CreateDatabase {
            name: "metrics".into(),
            space: hour_space(4),
        };
        assert!(matches!(
            apply_command(&mut meta, &too_wide),
            ApplyOutcome::Rejected(_)
        ));
        let ok = MetadataCommand::CreateDatabase {
            name: "metrics".into(),
            space: hour_space(3),
        };
        assert_eq!(apply_command(&mut meta, &ok), ApplyOutcome::Applied);
        assert_eq!(apply_command(&mut meta, &ok), ApplyOutcome::Unchanged);
    }

    #[test]
    fn test_create_shard_is_idempotent_per_window() {
        let mut meta = three_nodes();
        apply_command(
            &mut meta,
            &MetadataCommand::CreateDatabase {
                name: "metrics".into(),
                space: hour_space(2),
            },
        );
        let hour = 3_600_000_000_000i64;
        let create = MetadataCommand::CreateShard {
            database: "metrics".into(),
            space: "default".into(),
            start: 0,
            end: hour,
            replicas: vec![2, 3],
        };
        assert_eq!(apply_command(&mut meta, &create), ApplyOutcome::Applied);
        assert_eq!(apply_command(&mut meta, &create), ApplyOutcome::Unchanged);
        assert_eq!(meta.shards.len(), 1);
        assert_eq!(meta.shards[&1].replicas, vec![2, 3]);

        let misaligned = MetadataCommand::CreateShard {
            database: "metrics".into(),
            space: "default".into(),
            start: 10,
            end: hour + 10,
            replicas: vec![1],
        };
        assert!(matches!(
            apply_command(&mut meta, &misaligned),
            ApplyOutcome::Rejected(_)
        ));
    }

    #[test]
    fn test_single_admin() {
        let mut meta = three_nodes();
        let first = MetadataCommand::CreateRootUserIfAbsent {
            password_hash: "h1".into(),
        };
        let second = MetadataCommand::CreateRootUserIfAbsent {
            password_hash: "h2".into(),
        };
        assert_eq!(apply_command(&mut meta, &first), ApplyOutcome::Applied);
        assert_eq!(apply_command(&mut meta, &second), ApplyOutcome::Unchanged);
        assert_eq!(meta.users[ROOT_USER].password_hash, "h1");

        let other_admin = MetadataCommand::CreateUser {
            name: "ops".into(),
            password_hash: "h3".into(),
            is_admin: true,
        };
        assert!(matches!(
            apply_command(&mut meta, &other_admin),
            ApplyOutcome::Rejected(_)
        ));
        assert_eq!(meta.users.values().filter(|u| u.is_admin).count(), 1);
    }

    #[test]
    fn test_reset_root_password() {
        let mut meta = three_nodes();
        let reset = MetadataCommand::ResetRootPassword {
            password_hash: "fresh".into(),
        };
        assert_eq!(apply_command(&mut meta, &reset), ApplyOutcome::Applied);
        assert!(meta.users[ROOT_USER].is_admin);

        let reset = MetadataCommand::ResetRootPassword {
            password_hash: "again".into(),
        };
        apply_command(&mut meta, &reset);
        assert_eq!(meta.users.len(), 1);
        assert_eq!(meta.users[ROOT_USER].password_hash, "again");
    }

    #[test]
    fn test_root_never_promotes_plain_user() {
        let mut meta = three_nodes();
        let plain = MetadataCommand::CreateUser {
            name: ROOT_USER.into(),
            password_hash: "mine".into(),
            is_admin: false,
        };
        assert_eq!(apply_command(&mut meta, &plain), ApplyOutcome::Applied);

        for command in [
            MetadataCommand::CreateRootUserIfAbsent {
                password_hash: "h".into(),
            },
            MetadataCommand::ResetRootPassword {
                password_hash: "h".into(),
            },
        ] {
            assert!(matches!(
                apply_command(&mut meta, &command),
                ApplyOutcome::Rejected(_)
            ));
        }
        assert!(!meta.users[ROOT_USER].is_admin);
        assert_eq!(meta.users[ROOT_USER].password_hash, "mine");
        assert!(!meta.has_admin());
    }

    fn with_shard(meta: &mut ClusterMetadata) {
        apply_command(
            meta,
            &MetadataCommand::CreateDatabase {
                name: "metrics".into(),
                space: hour_space(2),
            },
        );
        let created = apply_command(
            meta,
            &MetadataCommand::CreateShard {
                database: "metrics".into(),
                space: "default".into(),
                start: 0,
                end: 3_600_000_000_000,
                replicas: vec![1, 2],
            },
        );
        assert_eq!(created, ApplyOutcome::Applied);
    }

    #[test]
    fn test_set_shard_replicas() {
        let mut meta = three_nodes();
        with_shard(&mut meta);
        let set = |replicas: Vec<NodeId>| MetadataCommand::SetShardReplicas { shard: 1, replicas };

        assert_eq!(apply_command(&mut meta, &set(vec![1, 2])), ApplyOutcome::Unchanged);
        assert_eq!(apply_command(&mut meta, &set(vec![2, 3])), ApplyOutcome::Applied);
        assert_eq!(meta.shards[&1].replicas, vec![2, 3]);

        let rejected = [
            set(vec![]),
            set(vec![3, 9]),
            set(vec![3, 3]),
            // Shares no replica with [2, 3]
            set(vec![1]),
            MetadataCommand::SetShardReplicas {
                shard: 42,
                replicas: vec![1],
            },
        ];
        for command in &rejected {
            assert!(
                matches!(apply_command(&mut meta, command), ApplyOutcome::Rejected(_)),
                "{:?}",
                command
            );
        }
        assert_eq!(meta.shards[&1].replicas, vec![2, 3]);
    }

    #[test]
    fn test_create_shard_space() {
        let mut meta = three_nodes();
        let fine = ShardSpace::new("fine", Duration::from_secs(60), 1);
        let create = |space: ShardSpace, make_default: bool| MetadataCommand::CreateShardSpace {
            database: "metrics".into(),
            space,
            make_default,
        };

        assert!(matches!(
            apply_command(&mut meta, &create(fine.clone(), false)),
            ApplyOutcome::Rejected(_)
        ));
        with_shard(&mut meta);

        assert_eq!(apply_command(&mut meta, &create(fine.clone(), false)), ApplyOutcome::Applied);
        assert_eq!(meta.databases["metrics"].default_space, "default");
        assert_eq!(apply_command(&mut meta, &create(fine.clone(), false)), ApplyOutcome::Unchanged);

        // Same space again, now as the default
        assert_eq!(apply_command(&mut meta, &create(fine.clone(), true)), ApplyOutcome::Applied);
        assert_eq!(meta.databases["metrics"].default_space, "fine");
        assert_eq!(apply_command(&mut meta, &create(fine.clone(), true)), ApplyOutcome::Unchanged);

        let conflicting = ShardSpace::new("fine", Duration::from_secs(120), 1);
        assert!(matches!(
            apply_command(&mut meta, &create(conflicting, false)),
            ApplyOutcome::Rejected(_)
        ));
        let too_wide = ShardSpace::new("wide", Duration::from_secs(60), 4);
        assert!(matches!(
            apply_command(&mut meta, &create(too_wide, true)),
            ApplyOutcome::Rejected(_)
        ));
        assert_eq!(meta.databases["metrics"].default_space, "fine");
        assert_eq!(meta.databases["metrics"].spaces.len(), 2);
    }

    #[test]
    fn test_change_password() {
        let mut meta = three_nodes();
        let change = |name: &str| MetadataCommand::ChangePassword {
            name: name.into(),
            password_hash: "new".into(),
        };
        assert!(matches!(
            apply_command(&mut meta, &change("alice")),
            ApplyOutcome::Rejected(_)
        ));
        apply_command(
            &mut meta,
            &MetadataCommand::CreateUser {
                name: "alice".into(),
                password_hash: "old".into(),
                is_admin: false,
            },
        );
        assert_eq!(apply_command(&mut meta, &change("alice")), ApplyOutcome::Applied);
        assert_eq!(meta.users["alice"].password_hash, "new");
        assert!(!meta.users["alice"].is_admin);
    }

    #[test]
    fn test_add_and_remove_node() {
        let mut meta = ClusterMetadata::default();
        let four = NodeInfo {
            id: 4,
            addr: "10.0.0.4:8086".into(),
        };
        assert!(matches!(
            apply_command(&mut meta, &MetadataCommand::AddNode(four.clone())),
            ApplyOutcome::Rejected(_)
        ));

        let mut meta = three_nodes();
        assert_eq!(
            apply_command(&mut meta, &MetadataCommand::AddNode(four.clone())),
            ApplyOutcome::Applied
        );
        assert_eq!(
            apply_command(&mut meta, &MetadataCommand::AddNode(four)),
            ApplyOutcome::Unchanged
        );

        assert_eq!(
            apply_command(&mut meta, &MetadataCommand::RemoveNode(9)),
            ApplyOutcome::Unchanged
        );
        for id in [4, 3, 2] {
            assert_eq!(
                apply_command(&mut meta, &MetadataCommand::RemoveNode(id)),
                ApplyOutcome::Applied
            );
        }
        assert!(matches!(
            apply_command(&mut meta, &MetadataCommand::RemoveNode(1)),
            ApplyOutcome::Rejected(_)
        ));
        assert_eq!(meta.node_ids(), vec![1]);
    }

    #[test]
    fn test_membership_flag() {
        assert!(MetadataCommand::RemoveNode(1).is_membership());
        assert!(!MetadataCommand::ChangePassword {
            name: "a".into(),
            password_hash: "b".into()
        }
        .is_membership());
    }
}
