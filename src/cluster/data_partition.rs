//! Data partition model: replicas, hosts, peers and status.
//!
//! The hosts list is the source of truth for placement; replicas are live
//! telemetry reported by the data nodes. All mutations happen under the
//! partition's own lock, and no lock is held across network I/O — callers
//! copy the state they need, perform the I/O, and merge results back.

use crate::error::{MasterError, Result};
use crate::fsm::DataPartitionRecord;
use crate::task::{
    AdminTask, CreateDataPartitionRequest, DecommissionDataPartitionRequest,
    DeletePartitionRequest, LoadDataPartitionRequest, OpCode,
};
use crate::types::{DataPartitionView, PartitionId, PartitionStatus, Peer};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Live telemetry for one replica of a data partition.
#[derive(Debug, Clone)]
pub struct DataReplica {
    pub addr: String,
    pub disk_path: String,
    pub total: u64,
    pub used: u64,
    pub status: PartitionStatus,
    pub report_time: Instant,
    /// Whether the replica's extent map is held in master memory for
    /// verification.
    pub loaded: bool,
}

impl DataReplica {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            disk_path: String::new(),
            total: 0,
            used: 0,
            status: PartitionStatus::ReadWrite,
            report_time: Instant::now(),
            loaded: false,
        }
    }

    pub fn is_live(&self, heartbeat_interval: Duration) -> bool {
        self.report_time.elapsed() < heartbeat_interval * 2
    }
}

#[derive(Debug)]
struct DataPartitionState {
    hosts: Vec<String>,
    peers: Vec<Peer>,
    status: PartitionStatus,
    replicas: Vec<DataReplica>,
    is_recover: bool,
    miss_replicas: HashMap<String, Instant>,
    last_load_time: Option<Instant>,
}

/// A replicated extent-storage unit; one volume owns many.
#[derive(Debug)]
pub struct DataPartition {
    pub id: PartitionId,
    pub vol_name: String,
    pub vol_id: u64,
    pub replica_count: u8,
    pub random_write: bool,
    state: RwLock<DataPartitionState>,
}

impl DataPartition {
    pub fn new(
        id: PartitionId,
        replica_count: u8,
        vol_name: &str,
        vol_id: u64,
        random_write: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            vol_name: vol_name.to_string(),
            vol_id,
            replica_count,
            random_write,
            state: RwLock::new(DataPartitionState {
                hosts: Vec::new(),
                peers: Vec::new(),
                status: PartitionStatus::ReadOnly,
                replicas: Vec::new(),
                is_recover: false,
                miss_replicas: HashMap::new(),
                last_load_time: None,
            }),
        })
    }

    pub fn from_record(record: &DataPartitionRecord) -> Arc<Self> {
        let dp = Self::new(
            record.id,
            record.replica_count,
            &record.vol_name,
            record.vol_id,
            record.random_write,
        );
        {
            let mut state = dp.state.write();
            state.hosts = record.hosts.clone();
            state.peers = record.peers.clone();
            state.status = record.status;
            state.is_recover = record.is_recover;
        }
        dp
    }

    pub fn record(&self) -> DataPartitionRecord {
        let state = self.state.read();
        DataPartitionRecord {
            id: self.id,
            vol_name: self.vol_name.clone(),
            vol_id: self.vol_id,
            replica_count: self.replica_count,
            random_write: self.random_write,
            status: state.status,
            hosts: state.hosts.clone(),
            peers: state.peers.clone(),
            is_recover: state.is_recover,
        }
    }

    pub fn view(&self) -> DataPartitionView {
        let state = self.state.read();
        DataPartitionView {
            partition_id: self.id,
            status: state.status,
            replica_count: self.replica_count,
            hosts: state.hosts.clone(),
        }
    }

    // -- accessors ---------------------------------------------------------

    pub fn hosts(&self) -> Vec<String> {
        self.state.read().hosts.clone()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.state.read().peers.clone()
    }

    pub fn status(&self) -> PartitionStatus {
        self.state.read().status
    }

    pub fn is_recover(&self) -> bool {
        self.state.read().is_recover
    }

    pub fn has_host(&self, addr: &str) -> bool {
        self.state.read().hosts.iter().any(|h| h == addr)
    }

    pub fn replica(&self, addr: &str) -> Option<DataReplica> {
        self.state
            .read()
            .replicas
            .iter()
            .find(|r| r.addr == addr)
            .cloned()
    }

    pub fn replica_addrs(&self) -> Vec<String> {
        self.state
            .read()
            .replicas
            .iter()
            .map(|r| r.addr.clone())
            .collect()
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

    pub fn set_recovering(&self, recovering: bool) {
        self.state.write().is_recover = recovering;
    }

    /// Record a live replica after the remote node acked creation.
    pub fn add_replica(&self, addr: &str) {
        let mut state = self.state.write();
        if state.replicas.iter().any(|r| r.addr == addr) {
            return;
        }
        state.replicas.push(DataReplica::new(addr));
        state.miss_replicas.remove(addr);
    }

    pub fn remove_replica(&self, addr: &str) {
        let mut state = self.state.write();
        state.replicas.retain(|r| r.addr != addr);
    }

    pub fn remove_miss_replica(&self, addr: &str) {
        self.state.write().miss_replicas.remove(addr);
    }

    /// Swap the offline host for its replacement and install the new peer
    /// set. The caller persists the updated record afterwards.
    pub fn replace_host(&self, offline_addr: &str, new_addr: &str, new_peers: Vec<Peer>) {
        let mut state = self.state.write();
        state.hosts.retain(|h| h != offline_addr);
        state.hosts.push(new_addr.to_string());
        state.peers = new_peers;
    }

    /// Merge replica telemetry from a node report.
    pub fn update_replica(&self, addr: &str, total: u64, used: u64, status: PartitionStatus) {
        let mut state = self.state.write();
        match state.replicas.iter_mut().find(|r| r.addr == addr) {
            Some(replica) => {
                replica.total = total;
                replica.used = used;
                replica.status = status;
                replica.report_time = Instant::now();
            }
            None => {
                let mut replica = DataReplica::new(addr);
                replica.total = total;
                replica.used = used;
                replica.status = status;
                state.replicas.push(replica);
            }
        }
        state.miss_replicas.remove(addr);
    }

    // -- checks ------------------------------------------------------------

    /// Reject decommission when the partition is already short a replica.
    pub fn has_missing_replica(&self) -> Result<()> {
        let state = self.state.read();
        if state.replicas.len() < self.replica_count as usize
            || state.hosts.len() < self.replica_count as usize
        {
            return Err(MasterError::QuorumLost(self.id));
        }
        Ok(())
    }

    /// Quorum preservation: the replicas that stay behind must still form
    /// a majority of the configured replica count.
    pub fn can_be_offline(&self, offline_addr: &str, heartbeat_interval: Duration) -> Result<()> {
        let state = self.state.read();
        let live = state
            .replicas
            .iter()
            .filter(|r| r.addr != offline_addr && r.is_live(heartbeat_interval))
            .count();
        let majority = self.replica_count as usize / 2 + 1;
        if live < majority {
            return Err(MasterError::QuorumLost(self.id));
        }
        Ok(())
    }

    /// Recompute the serving status from replica telemetry and refresh the
    /// missing-replica index. Returns the new status.
    pub fn recompute_status(&self, heartbeat_interval: Duration) -> PartitionStatus {
        let mut state = self.state.write();

        let now = Instant::now();
        let hosts = state.hosts.clone();
        for host in &hosts {
            let fresh = state
                .replicas
                .iter()
                .any(|r| &r.addr == host && r.is_live(heartbeat_interval));
            if fresh {
                state.miss_replicas.remove(host);
            } else {
                state.miss_replicas.entry(host.clone()).or_insert(now);
            }
        }

        let live = state
            .replicas
            .iter()
            .filter(|r| r.is_live(heartbeat_interval))
            .count();

        let status = if live == 0 {
            PartitionStatus::Unavailable
        } else if state.is_recover
            || live < self.replica_count as usize
            || state.hosts.len() != self.replica_count as usize
        {
            PartitionStatus::ReadOnly
        } else {
            PartitionStatus::ReadWrite
        };
        state.status = status;
        status
    }

    pub fn miss_replica_count(&self) -> usize {
        self.state.read().miss_replicas.len()
    }

    // -- load / release ----------------------------------------------------

    /// Whether the partition is due for a load-verification pass.
    pub fn needs_load(&self, load_interval: Duration) -> bool {
        let state = self.state.read();
        match state.last_load_time {
            Some(t) => t.elapsed() >= load_interval,
            None => true,
        }
    }

    pub fn mark_loaded(&self) {
        let mut state = self.state.write();
        state.last_load_time = Some(Instant::now());
        for replica in &mut state.replicas {
            replica.loaded = true;
        }
    }

    /// Release the in-memory extent maps pulled in by verification.
    /// Returns true when something was released.
    pub fn release_load(&self, after: Duration) -> bool {
        let mut state = self.state.write();
        let due = state
            .last_load_time
            .map(|t| t.elapsed() >= after)
            .unwrap_or(false);
        if !due {
            return false;
        }
        let mut released = false;
        for replica in &mut state.replicas {
            if replica.loaded {
                replica.loaded = false;
                released = true;
            }
        }
        released
    }

    // -- task builders -----------------------------------------------------

    pub fn create_task(&self, host: &str, partition_size: u64) -> AdminTask {
        let body = bincode::serialize(&CreateDataPartitionRequest {
            partition_id: self.id,
            partition_size,
            vol_name: self.vol_name.clone(),
            random_write: self.random_write,
            members: self.peers(),
        })
        .unwrap_or_default();
        AdminTask::new(OpCode::CreateDataPartition, host, self.id, body)
    }

    pub fn load_task(&self, host: &str) -> AdminTask {
        let body = bincode::serialize(&LoadDataPartitionRequest { partition_id: self.id })
            .unwrap_or_default();
        AdminTask::new(OpCode::LoadDataPartition, host, self.id, body)
    }

    pub fn decommission_task(&self, target: &str, remove_peer: Peer, add_peer: Peer) -> AdminTask {
        let body = bincode::serialize(&DecommissionDataPartitionRequest {
            partition_id: self.id,
            remove_peer,
            add_peer,
        })
        .unwrap_or_default();
        AdminTask::new(OpCode::DecommissionDataPartition, target, self.id, body)
    }

    pub fn delete_task(&self, host: &str) -> AdminTask {
        let body = bincode::serialize(&DeletePartitionRequest { partition_id: self.id })
            .unwrap_or_default();
        AdminTask::new(OpCode::DeleteDataPartition, host, self.id, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HB: Duration = Duration::from_secs(60);

    fn partition_with_replicas(hosts: &[&str]) -> Arc<DataPartition> {
        let dp = DataPartition::new(1, 3, "v1", 1, false);
        dp.set_placement(
            hosts.iter().map(|h| h.to_string()).collect(),
            hosts
                .iter()
                .enumerate()
                .map(|(i, h)| Peer {
                    id: i as u64 + 1,
                    addr: h.to_string(),
                })
                .collect(),
        );
        for host in hosts {
            dp.add_replica(host);
        }
        dp
    }

    #[test]
    fn test_status_recompute_full_replicas() {
        let dp = partition_with_replicas(&["a:1", "b:1", "c:1"]);
        assert_eq!(dp.recompute_status(HB), PartitionStatus::ReadWrite);
    }

    #[test]
    fn test_status_recompute_degraded() {
        let dp = partition_with_replicas(&["a:1", "b:1", "c:1"]);
        dp.remove_replica("c:1");
        assert_eq!(dp.recompute_status(HB), PartitionStatus::ReadOnly);
        assert_eq!(dp.miss_replica_count(), 1);

        dp.remove_replica("a:1");
        dp.remove_replica("b:1");
        assert_eq!(dp.recompute_status(HB), PartitionStatus::Unavailable);
    }

    #[test]
    fn test_recovering_partition_is_read_only() {
        let dp = partition_with_replicas(&["a:1", "b:1", "c:1"]);
        dp.set_recovering(true);
        assert_eq!(dp.recompute_status(HB), PartitionStatus::ReadOnly);
    }

    #[test]
    fn test_missing_replica_blocks_decommission() {
        let dp = partition_with_replicas(&["a:1", "b:1", "c:1"]);
        assert!(dp.has_missing_replica().is_ok());

        dp.remove_replica("b:1");
        assert!(matches!(
            dp.has_missing_replica(),
            Err(MasterError::QuorumLost(1))
        ));
    }

    #[test]
    fn test_can_be_offline_majority() {
        let dp = partition_with_replicas(&["a:1", "b:1", "c:1"]);
        // Two live replicas remain: majority of 3 holds.
        assert!(dp.can_be_offline("c:1", HB).is_ok());

        dp.remove_replica("a:1");
        // Only one live replica would remain.
        assert!(matches!(
            dp.can_be_offline("c:1", HB),
            Err(MasterError::QuorumLost(1))
        ));
    }

    #[test]
    fn test_replace_host() {
        let dp = partition_with_replicas(&["a:1", "b:1", "c:1"]);
        let new_peers = vec![
            Peer { id: 2, addr: "b:1".into() },
            Peer { id: 3, addr: "c:1".into() },
            Peer { id: 9, addr: "d:1".into() },
        ];
        dp.replace_host("a:1", "d:1", new_peers.clone());

        let hosts = dp.hosts();
        assert_eq!(hosts.len(), 3);
        assert!(!hosts.contains(&"a:1".to_string()));
        assert!(hosts.contains(&"d:1".to_string()));
        assert_eq!(dp.peers(), new_peers);
    }

    #[test]
    fn test_load_release_cycle() {
        let dp = partition_with_replicas(&["a:1", "b:1", "c:1"]);
        assert!(dp.needs_load(Duration::from_secs(1)));

        dp.mark_loaded();
        assert!(!dp.needs_load(Duration::from_secs(3600)));
        // Not yet due for release.
        assert!(!dp.release_load(Duration::from_secs(3600)));
        // Due immediately with a zero bound.
        assert!(dp.release_load(Duration::from_secs(0)));
        // Second release is a no-op.
        assert!(!dp.release_load(Duration::from_secs(0)));
    }

    #[test]
    fn test_record_roundtrip() {
        let dp = partition_with_replicas(&["a:1", "b:1", "c:1"]);
        dp.set_status(PartitionStatus::ReadWrite);
        let record = dp.record();
        let back = DataPartition::from_record(&record);
        assert_eq!(back.id, dp.id);
        assert_eq!(back.hosts(), dp.hosts());
        assert_eq!(back.status(), PartitionStatus::ReadWrite);
        // Replica telemetry is runtime state and does not survive.
        assert!(back.replica_addrs().is_empty());
    }
}
