//! # chronodb
//!
//! One node of a distributed time-series database:
//! - Raft consensus over cluster metadata (members, databases, shards, users)
//! - Time-partitioned shards, each an LSM store (RocksDB by default)
//! - Writes fanned out to shard replicas, acknowledged at a write quorum;
//!   missed replica writes are queued as hints and replayed
//! - Queries read each overlapping shard at a read quorum, newest version wins
//! - bincode over HTTP between nodes, JSON over HTTP for clients
//!
//! ## Architecture
//!
//! ```text
//!            clients (JSON)             peers (bincode)
//!                 │                           │
//!          ┌──────▼───────────────────────────▼──────┐
//!          │                 HTTP (axum)             │
//!          └──────┬───────────────────────────┬──────┘
//!                 │                           │
//!        ┌────────▼────────┐        ┌─────────▼─────────┐
//!        │  RequestRouter  │───────▶│    RaftNode        │
//!        │ (quorum writes, │  meta  │ (metadata log,     │
//!        │  quorum reads,  │        │  MetadataStore)    │
//!        │  hinted handoff)│        │                    │
//!        └────────┬────────┘        └────────────────────┘
//!                 │
//!        ┌────────▼────────┐
//!        │   LocalShards   │  one LSM store per shard directory
//!        └─────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! chronod --config node1.toml
//! chronod --config node1.toml --repair
//! chronod --config node1.toml --reset-root
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod metadata;
pub mod node;
pub mod raft;
pub mod router;
pub mod storage;
pub mod transport;

pub use common::{Config, Error, Result};
pub use node::{Node, NodeOptions};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name and version, as printed by `chronod -v`
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_NAME"), " v", env!("CARGO_PKG_VERSION"));
