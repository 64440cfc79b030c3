//! Core type definitions for the bedrock cluster master.
//!
//! This module contains the fundamental data types shared across the master:
//! identifier aliases, replica peer descriptors, partition and volume status
//! enums, and the operator-facing view structs.
//!
//! # Type Aliases
//!
//! - [`NodeId`] = `u64`: cluster-wide node identifier
//! - [`PartitionId`] = `u64`: data/meta partition identifier
//! - [`Term`] = `u64`: consensus term number

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a node in the cluster.
pub type NodeId = u64;

/// Unique identifier for a data or meta partition.
pub type PartitionId = u64;

/// Consensus term number.
pub type Term = u64;

/// Default number of data partitions created with a new volume.
pub const DEFAULT_INIT_DATA_PARTITION_COUNT: usize = 10;

/// Number of meta partitions created with a new volume.
pub const DEFAULT_INIT_META_PARTITION_COUNT: usize = 3;

/// Inode-id width covered by each initial meta partition.
pub const DEFAULT_META_PARTITION_INODE_STEP: u64 = 1 << 24;

/// Default size of a data partition when the caller passes size 0.
pub const DEFAULT_DATA_PARTITION_SIZE: u64 = 120 * GB;

/// Replica count for meta partitions.
pub const DEFAULT_META_REPLICA_COUNT: u8 = 3;

/// One gibibyte.
pub const GB: u64 = 1024 * 1024 * 1024;

/// A consensus peer of a replicated partition: the node id plus the
/// address the replica group dials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub addr: String,
}

/// Serving status of a data or meta partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStatus {
    ReadWrite,
    ReadOnly,
    Unavailable,
}

impl PartitionStatus {
    pub fn is_writable(&self) -> bool {
        matches!(self, PartitionStatus::ReadWrite)
    }
}

/// Lifecycle status of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeStatus {
    Normal,
    MarkDelete,
}

/// Operator-facing summary of a registered node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub id: NodeId,
    pub addr: String,
    pub is_active: bool,
}

/// Client-facing summary of a data partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPartitionView {
    pub partition_id: PartitionId,
    pub status: PartitionStatus,
    pub replica_count: u8,
    pub hosts: Vec<String>,
}

/// Client-facing summary of a meta partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaPartitionView {
    pub partition_id: PartitionId,
    pub start: u64,
    pub end: u64,
    pub status: PartitionStatus,
    pub leader_addr: String,
    pub hosts: Vec<String>,
}

/// Aggregate capacity statistics for one node class.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeStatInfo {
    pub total: u64,
    pub used: u64,
    pub node_count: usize,
}

impl NodeStatInfo {
    pub fn used_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used as f64 / self.total as f64
    }
}

/// Operator-facing summary of the whole cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterView {
    pub name: String,
    pub leader_addr: String,
    pub data_node_stat: NodeStatInfo,
    pub meta_node_stat: NodeStatInfo,
    pub vol_count: usize,
    pub data_node_count: usize,
    pub meta_node_count: usize,
}

/// Seconds since the unix epoch.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
