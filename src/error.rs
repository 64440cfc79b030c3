//! Error types for the bedrock cluster master.
//!
//! This module provides a unified error type [`MasterError`] for all master
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Lookup**: volume/node/partition/rack not found
//! - **Placement**: no writable node or rack available
//! - **Consensus**: not-leader redirects and failed proposals
//! - **Remote**: admin tasks rejected or timed out by data/meta nodes
//! - **Validation**: invalid arguments (e.g. shrinking volume capacity)

use std::io;
use thiserror::Error;

/// Main error type for master operations.
#[derive(Error, Debug)]
pub enum MasterError {
    // Lookup errors
    #[error("vol not found: {0}")]
    VolumeNotFound(String),

    #[error("data node not found: {0}")]
    DataNodeNotFound(String),

    #[error("meta node not found: {0}")]
    MetaNodeNotFound(String),

    #[error("data partition not found: {0}")]
    DataPartitionNotFound(u64),

    #[error("meta partition not found: {0}")]
    MetaPartitionNotFound(u64),

    #[error("node set not found: {0}")]
    NodeSetNotFound(u64),

    #[error("rack not found: {0}")]
    RackNotFound(String),

    #[error("replica not found on {0}")]
    ReplicaNotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    // Placement errors
    #[error("no resource: {0}")]
    NoResource(String),

    // Quorum / replica-safety errors
    #[error("partition {0} has a missing replica, quorum would be lost")]
    QuorumLost(u64),

    // Consensus errors
    #[error("not the leader. leader is: {leader:?}")]
    NotLeader { leader: Option<u64> },

    #[error("proposal failed: {0}")]
    ProposalFailed(String),

    // Remote task errors
    #[error("remote task failed on {addr}: {reason}")]
    RemoteTaskFailed { addr: String, reason: String },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    // Validation errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    // Storage and serialization
    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MasterError {
    /// Check if the operation may be retried against the same master.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MasterError::Timeout(_)
                | MasterError::ConnectionFailed(_)
                | MasterError::ProposalFailed(_)
                | MasterError::NoResource(_)
        )
    }

    /// Errors that indicate the caller should redirect to another replica.
    pub fn is_leader_redirect(&self) -> bool {
        matches!(self, MasterError::NotLeader { .. })
    }
}

impl From<rocksdb::Error> for MasterError {
    fn from(e: rocksdb::Error) -> Self {
        MasterError::Store(e.to_string())
    }
}

impl From<bincode::Error> for MasterError {
    fn from(e: bincode::Error) -> Self {
        MasterError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for MasterError {
    fn from(e: serde_json::Error) -> Self {
        MasterError::Serialization(e.to_string())
    }
}

/// Result type alias for master operations.
pub type Result<T> = std::result::Result<T, MasterError>;
