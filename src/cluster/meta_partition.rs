//! Meta partition model: an inode-id range replicated across meta nodes.

use crate::error::{MasterError, Result};
use crate::fsm::MetaPartitionRecord;
use crate::task::{
    AdminTask, CreateMetaPartitionRequest, DeletePartitionRequest, OpCode,
    UpdateMetaPartitionRequest,
};
use crate::types::{MetaPartitionView, PartitionId, PartitionStatus, Peer};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Live telemetry for one replica of a meta partition.
#[derive(Debug, Clone)]
pub struct MetaReplica {
    pub addr: String,
    pub status: PartitionStatus,
    pub max_inode_id: u64,
    pub report_time: Instant,
}

impl MetaReplica {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            status: PartitionStatus::ReadWrite,
            max_inode_id: 0,
            report_time: Instant::now(),
        }
    }

    pub fn is_live(&self, heartbeat_interval: Duration) -> bool {
        self.report_time.elapsed() < heartbeat_interval * 2
    }
}

#[derive(Debug)]
struct MetaPartitionState {
    start: u64,
    end: u64,
    hosts: Vec<String>,
    peers: Vec<Peer>,
    status: PartitionStatus,
    replicas: Vec<MetaReplica>,
    max_inode_id: u64,
    leader_addr: Option<String>,
}

/// A replicated metadata range; a volume's meta partitions cover the whole
/// inode-id space.
#[derive(Debug)]
pub struct MetaPartition {
    pub id: PartitionId,
    pub vol_name: String,
    pub vol_id: u64,
    pub replica_count: u8,
    state: RwLock<MetaPartitionState>,
}

impl MetaPartition {
    pub fn new(
        id: PartitionId,
        start: u64,
        end: u64,
        replica_count: u8,
        vol_name: &str,
        vol_id: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            vol_name: vol_name.to_string(),
            vol_id,
            replica_count,
            state: RwLock::new(MetaPartitionState {
                start,
                end,
                hosts: Vec::new(),
                peers: Vec::new(),
                status: PartitionStatus::ReadOnly,
                replicas: Vec::new(),
                max_inode_id: start,
                leader_addr: None,
            }),
        })
    }

    pub fn from_record(record: &MetaPartitionRecord) -> Arc<Self> {
        let mp = Self::new(
            record.id,
            record.start,
            record.end,
            record.replica_count,
            &record.vol_name,
            record.vol_id,
        );
        {
            let mut state = mp.state.write();
            state.hosts = record.hosts.clone();
            state.peers = record.peers.clone();
            state.status = record.status;
            state.max_inode_id = record.max_inode_id;
        }
        mp
    }

    pub fn record(&self) -> MetaPartitionRecord {
        let state = self.state.read();
        MetaPartitionRecord {
            id: self.id,
            vol_name: self.vol_name.clone(),
            vol_id: self.vol_id,
            start: state.start,
            end: state.end,
            replica_count: self.replica_count,
            status: state.status,
            hosts: state.hosts.clone(),
            peers: state.peers.clone(),
            max_inode_id: state.max_inode_id,
        }
    }

    pub fn view(&self) -> MetaPartitionView {
        let state = self.state.read();
        MetaPartitionView {
            partition_id: self.id,
            start: state.start,
            end: state.end,
            status: state.status,
            leader_addr: state.leader_addr.clone().unwrap_or_default(),
            hosts: state.hosts.clone(),
        }
    }

    // -- accessors ---------------------------------------------------------

    pub fn range(&self) -> (u64, u64) {
        let state = self.state.read();
        (state.start, state.end)
    }

    pub fn hosts(&self) -> Vec<String> {
        self.state.read().hosts.clone()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.state.read().peers.clone()
    }

    pub fn status(&self) -> PartitionStatus {
        self.state.read().status
    }

    pub fn max_inode_id(&self) -> u64 {
        self.state.read().max_inode_id
    }

    pub fn has_host(&self, addr: &str) -> bool {
        self.state.read().hosts.iter().any(|h| h == addr)
    }

    /// The replica currently leading the partition's consensus group.
    pub fn leader(&self) -> Result<String> {
        self.state
            .read()
            .leader_addr
            .clone()
            .ok_or_else(|| MasterError::NoResource(format!("meta partition {} has no leader", self.id)))
    }

    // -- mutations ---------------------------------------------------------

    pub fn set_placement(&self, hosts: Vec<String>, peers: Vec<Peer>) {
        let mut state = self.state.write();
        state.hosts = hosts;
        state.peers = peers;
    }

    pub fn set_status(&self, status: PartitionStatus) {
        self.state.write().status = status;
    }

    pub fn set_leader(&self, addr: &str) {
        self.state.write().leader_addr = Some(addr.to_string());
    }

    /// Shrink or grow the upper bound of the inode range.
    pub fn set_end(&self, end: u64) {
        self.state.write().end = end;
    }

    pub fn add_replica(&self, addr: &str) {
        let mut state = self.state.write();
        if state.replicas.iter().any(|r| r.addr == addr) {
            return;
        }
        state.replicas.push(MetaReplica::new(addr));
    }

    /// Swap the offline host for its replacement and install the new peer
    /// set. The caller persists the updated record afterwards.
    pub fn replace_host(&self, offline_addr: &str, new_addr: &str, new_peers: Vec<Peer>) {
        let mut state = self.state.write();
        state.hosts.retain(|h| h != offline_addr);
        state.hosts.push(new_addr.to_string());
        state.peers = new_peers;
        if state.leader_addr.as_deref() == Some(offline_addr) {
            state.leader_addr = None;
        }
    }

    pub fn remove_replica(&self, addr: &str) {
        let mut state = self.state.write();
        state.replicas.retain(|r| r.addr != addr);
        if state.leader_addr.as_deref() == Some(addr) {
            state.leader_addr = None;
        }
    }

    pub fn replica_addrs(&self) -> Vec<String> {
        self.state
            .read()
            .replicas
            .iter()
            .map(|r| r.addr.clone())
            .collect()
    }

    /// Merge replica telemetry from a meta node report.
    pub fn update_replica(&self, addr: &str, max_inode_id: u64, status: PartitionStatus) {
        let mut state = self.state.write();
        match state.replicas.iter_mut().find(|r| r.addr == addr) {
            Some(replica) => {
                replica.max_inode_id = max_inode_id;
                replica.status = status;
                replica.report_time = Instant::now();
            }
            None => {
                let mut replica = MetaReplica::new(addr);
                replica.max_inode_id = max_inode_id;
                replica.status = status;
                state.replicas.push(replica);
            }
        }
        if max_inode_id > state.max_inode_id {
            state.max_inode_id = max_inode_id;
        }
    }

    /// Recompute the serving status from replica telemetry.
    pub fn recompute_status(&self, heartbeat_interval: Duration) -> PartitionStatus {
        let mut state = self.state.write();
        let live = state
            .replicas
            .iter()
            .filter(|r| r.is_live(heartbeat_interval))
            .count();

        let status = if live == 0 {
            PartitionStatus::Unavailable
        } else if live < self.replica_count as usize
            || state.hosts.len() != self.replica_count as usize
        {
            PartitionStatus::ReadOnly
        } else {
            PartitionStatus::ReadWrite
        };
        state.status = status;
        status
    }

    // -- task builders -----------------------------------------------------

    pub fn create_task(&self, host: &str) -> AdminTask {
        let state = self.state.read();
        let body = bincode::serialize(&CreateMetaPartitionRequest {
            partition_id: self.id,
            start: state.start,
            end: state.end,
            vol_name: self.vol_name.clone(),
            members: state.peers.clone(),
        })
        .unwrap_or_default();
        AdminTask::new(OpCode::CreateMetaPartition, host, self.id, body)
    }

    pub fn update_range_task(&self, host: &str) -> AdminTask {
        let state = self.state.read();
        let body = bincode::serialize(&UpdateMetaPartitionRequest {
            partition_id: self.id,
            start: state.start,
            end: state.end,
        })
        .unwrap_or_default();
        AdminTask::new(OpCode::UpdateMetaPartition, host, self.id, body)
    }

    pub fn delete_task(&self, host: &str) -> AdminTask {
        let body = bincode::serialize(&DeletePartitionRequest { partition_id: self.id })
            .unwrap_or_default();
        AdminTask::new(OpCode::DeleteMetaPartition, host, self.id, body)
    }
}
