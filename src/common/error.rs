//! Error types for chronodb

use crate::common::NodeId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Store error: {0}")]
    Store(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Encoding error: {0}")]
    Codec(String),

    #[error("Repair failed for {path}: {reason}")]
    RepairFailed { path: PathBuf, reason: String },

    // === Raft Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(NodeId),

    #[error("No leader elected")]
    NoLeader,

    #[error("Consensus timeout")]
    ConsensusTimeout,

    #[error("Proposal superseded by a leader change")]
    LeaderChanged,

    #[error("A membership change is already in progress")]
    MembershipChangeInProgress,

    #[error("Raft error: {0}")]
    Raft(String),

    // === Metadata Errors ===
    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    #[error("Shard not found: {0}")]
    ShardNotFound(u64),

    #[error("Mutation rejected: {0}")]
    Rejected(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    // === Placement / Quorum Errors ===
    #[error("Insufficient replicas: need {needed}, have {available}")]
    InsufficientReplicas { needed: usize, available: usize },

    #[error("Quorum not reached for shard {shard}: needed {needed}, acked {acked}")]
    QuorumNotReached {
        shard: u64,
        needed: usize,
        acked: usize,
    },

    #[error("Shard {shard} unavailable: {reason}")]
    ShardUnavailable { shard: u64, reason: String },

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Remote error: {message}")]
    Remote { message: String, retryable: bool },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_)
            | Error::ConnectionFailed(_)
            | Error::ConsensusTimeout
            | Error::NotLeader(_)
            | Error::NoLeader
            | Error::LeaderChanged
            | Error::MembershipChangeInProgress => true,
            Error::Remote { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::DatabaseNotFound(_) | Error::ShardNotFound(_) => StatusCode::NOT_FOUND,
            Error::NotLeader(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::InvalidConfig(_) | Error::InvalidRequest(_) | Error::Rejected(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Timeout(_) | Error::ConsensusTimeout => StatusCode::REQUEST_TIMEOUT,
            Error::NoLeader
            | Error::LeaderChanged
            | Error::QuorumNotReached { .. }
            | Error::ShardUnavailable { .. }
            | Error::InsufficientReplicas { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error shape carried in internal RPC replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub message: String,
    pub retryable: bool,
}

impl From<&Error> for RpcError {
    fn from(e: &Error) -> Self {
        Self {
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Self {
        Error::Remote {
            message: e.message,
            retryable: e.retryable,
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        match e.kind() {
            rocksdb::ErrorKind::Corruption => Error::Corrupted(e.into_string()),
            _ => Error::Store(e.into_string()),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::ConnectionFailed(e.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("task failed: {}", e))
    }
}
