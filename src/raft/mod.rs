//! Raft consensus for cluster metadata
//!
//! - Leader election with randomized timeouts
//! - Log replication and majority commit
//! - Snapshots and log compaction
//! - Single-step membership changes driven by the state machine

pub mod log;
pub mod message;
pub mod node;
pub mod storage;

pub use log::RaftLog;
pub use message::{
    AppendRequest, AppendResponse, EntryKind, InstallSnapshotRequest, InstallSnapshotResponse,
    LogEntry, ProposeRequest, Proposed, Snapshot, VoteRequest, VoteResponse,
};
pub use node::{RaftNode, RaftRole, RaftStatus, StateMachine};
pub use storage::{HardState, RaftStorage};
