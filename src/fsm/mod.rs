//! Replicated state machine: typed records and the apply path.
//!
//! Every mutation of cluster-visible state is encoded as a [`RaftCommand`]
//! and submitted through the consensus partition. The committed record is
//! applied on every replica by [`MetadataFsm::apply`], which
//! deterministically lands it in the key/value store and advances the id
//! watermarks. In-memory state is rebuilt from the store when a replica
//! takes leadership (see `Cluster::load_metadata`).
//!
//! Records are JSON so that replicas running older code ignore fields they
//! do not know about.

use crate::error::Result;
use crate::idalloc::IdAllocator;
use crate::raft::RaftPartition;
use crate::store::MetaStore;
use crate::types::{PartitionId, PartitionStatus, Peer, VolumeStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const KEY_COMMON_ID: &str = "id/common";
pub const KEY_DATA_PARTITION_ID: &str = "id/dp";
pub const KEY_META_PARTITION_ID: &str = "id/mp";

pub fn node_set_key(id: u64) -> String {
    format!("nodeSet/{}", id)
}

pub fn data_node_key(addr: &str) -> String {
    format!("dataNode/{}", addr)
}

pub fn meta_node_key(addr: &str) -> String {
    format!("metaNode/{}", addr)
}

pub fn vol_key(name: &str) -> String {
    format!("vol/{}", name)
}

pub fn data_partition_key(vol_id: u64, id: PartitionId) -> String {
    format!("dp/{}/{}", vol_id, id)
}

pub fn meta_partition_key(vol_id: u64, id: PartitionId) -> String {
    format!("mp/{}/{}", vol_id, id)
}

/// Kind of a replicated record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOp {
    AddVolume,
    UpdateVolume,
    DeleteVolume,
    AddDataNode,
    DeleteDataNode,
    AddMetaNode,
    DeleteMetaNode,
    AddDataPartition,
    UpdateDataPartition,
    DeleteDataPartition,
    AddMetaPartition,
    UpdateMetaPartition,
    DeleteMetaPartition,
    AddNodeSet,
    UpdateNodeSet,
    AllocCommonId,
    AllocDataPartitionId,
    AllocMetaPartitionId,
}

impl CommandOp {
    /// Whether applying this record removes the key instead of writing it.
    fn is_delete(&self) -> bool {
        matches!(
            self,
            CommandOp::DeleteVolume
                | CommandOp::DeleteDataNode
                | CommandOp::DeleteMetaNode
                | CommandOp::DeleteDataPartition
                | CommandOp::DeleteMetaPartition
        )
    }
}

/// One replicated mutation: kind, store key and record payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftCommand {
    pub op: CommandOp,
    pub key: String,
    #[serde(default)]
    pub value: Vec<u8>,
}

impl RaftCommand {
    pub fn new(op: CommandOp, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            op,
            key: key.into(),
            value,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

// ---------------------------------------------------------------------------
// Persisted record payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSetRecord {
    pub id: u64,
    pub capacity: usize,
    pub data_node_count: usize,
    pub meta_node_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataNodeRecord {
    pub id: u64,
    pub addr: String,
    pub node_set_id: u64,
    pub rack_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaNodeRecord {
    pub id: u64,
    pub addr: String,
    pub node_set_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: u64,
    pub name: String,
    pub status: VolumeStatus,
    pub dp_replica_count: u8,
    pub mp_replica_count: u8,
    pub random_write: bool,
    pub data_partition_size: u64,
    pub capacity: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPartitionRecord {
    pub id: PartitionId,
    pub vol_name: String,
    pub vol_id: u64,
    pub replica_count: u8,
    pub random_write: bool,
    pub status: PartitionStatus,
    pub hosts: Vec<String>,
    pub peers: Vec<Peer>,
    #[serde(default)]
    pub is_recover: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaPartitionRecord {
    pub id: PartitionId,
    pub vol_name: String,
    pub vol_id: u64,
    pub start: u64,
    pub end: u64,
    pub replica_count: u8,
    pub status: PartitionStatus,
    pub hosts: Vec<String>,
    pub peers: Vec<Peer>,
    #[serde(default)]
    pub max_inode_id: u64,
}

// ---------------------------------------------------------------------------
// The state machine
// ---------------------------------------------------------------------------

/// Applies committed records into the store.
pub struct MetadataFsm {
    store: Arc<dyn MetaStore>,
    id_alloc: Arc<IdAllocator>,
}

impl MetadataFsm {
    pub fn new(store: Arc<dyn MetaStore>, id_alloc: Arc<IdAllocator>) -> Arc<Self> {
        Arc::new(Self { store, id_alloc })
    }

    /// Wire this state machine as the partition's apply callback.
    pub fn register(self: &Arc<Self>, partition: &dyn RaftPartition) {
        let fsm = self.clone();
        partition.register_apply(Box::new(move |record| fsm.apply(record)));
    }

    /// Apply one committed record.
    ///
    /// Never returns an error: a record that cannot be decoded or stored
    /// means this replica has diverged from the log, and continuing would
    /// violate the replication safety invariants, so the process aborts.
    pub fn apply(&self, record: &[u8]) {
        let cmd = match RaftCommand::decode(record) {
            Ok(cmd) => cmd,
            Err(e) => panic!("fsm apply: undecodable record: {}", e),
        };

        let result = if cmd.op.is_delete() {
            self.store.delete(&cmd.key)
        } else {
            self.store.put(&cmd.key, &cmd.value)
        };
        if let Err(e) = result {
            panic!("fsm apply: store mutation failed for {}: {}", cmd.key, e);
        }

        match cmd.op {
            CommandOp::AllocCommonId => {
                self.id_alloc.advance_common(decode_counter(&cmd.value));
            }
            CommandOp::AllocDataPartitionId => {
                self.id_alloc
                    .advance_data_partition(decode_counter(&cmd.value));
            }
            CommandOp::AllocMetaPartitionId => {
                self.id_alloc
                    .advance_meta_partition(decode_counter(&cmd.value));
            }
            _ => {}
        }
    }
}

fn decode_counter(value: &[u8]) -> u64 {
    String::from_utf8_lossy(value).parse().unwrap_or(0)
}
