//! Cluster metadata
//!
//! Databases, shard spaces, shard assignments, users and cluster members,
//! replicated through the consensus log.

pub mod auth;
pub mod client;
pub mod command;
pub mod store;
pub mod types;

pub use client::{Committed, MetaClient};
pub use command::{ApplyOutcome, MetadataCommand, Proposal};
pub use store::{MetadataStore, Resolution, ShardPlan};
pub use types::{
    ClusterMetadata, Database, NodeInfo, Shard, ShardId, ShardKey, ShardSpace, User,
    DEFAULT_ROOT_PASSWORD, DEFAULT_SPACE, ROOT_USER,
};
