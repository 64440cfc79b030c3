//! Volume model: a named container for one meta-partition range and one
//! data-partition set.
//!
//! The volume owns its partition collections; collection mutations are
//! serialized by the collection lock while individual partitions carry
//! their own locks. The client-facing partition views are cached as
//! serialized JSON and refreshed by the status checkers.

use crate::cluster::data_partition::DataPartition;
use crate::cluster::meta_partition::MetaPartition;
use crate::cluster::Cluster;
use crate::error::{MasterError, Result};
use crate::fsm::VolumeRecord;
use crate::types::{
    PartitionId, PartitionStatus, VolumeStatus, DEFAULT_INIT_META_PARTITION_COUNT,
    DEFAULT_META_PARTITION_INODE_STEP,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug)]
struct DataPartitionMapInner {
    partitions: Vec<Arc<DataPartition>>,
    by_id: HashMap<PartitionId, Arc<DataPartition>>,
    read_write_count: usize,
    response_cache: Vec<u8>,
}

/// Ordered collection of a volume's data partitions, with a read/write
/// subset counter and a cached client response.
#[derive(Debug)]
pub struct DataPartitionMap {
    inner: RwLock<DataPartitionMapInner>,
}

impl DataPartitionMap {
    fn new() -> Self {
        Self {
            inner: RwLock::new(DataPartitionMapInner {
                partitions: Vec::new(),
                by_id: HashMap::new(),
                read_write_count: 0,
                response_cache: Vec::new(),
            }),
        }
    }

    pub fn put(&self, dp: Arc<DataPartition>) {
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&dp.id) {
            return;
        }
        inner.by_id.insert(dp.id, dp.clone());
        inner.partitions.push(dp);
        inner.partitions.sort_by_key(|p| p.id);
        inner.response_cache.clear();
    }

    pub fn remove(&self, id: PartitionId) {
        let mut inner = self.inner.write();
        inner.by_id.remove(&id);
        inner.partitions.retain(|p| p.id != id);
        inner.response_cache.clear();
    }

    pub fn get(&self, id: PartitionId) -> Option<Arc<DataPartition>> {
        self.inner.read().by_id.get(&id).cloned()
    }

    pub fn partitions(&self) -> Vec<Arc<DataPartition>> {
        self.inner.read().partitions.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().partitions.is_empty()
    }

    pub fn read_write_count(&self) -> usize {
        self.inner.read().read_write_count
    }

    pub fn set_read_write_count(&self, count: usize) {
        self.inner.write().read_write_count = count;
    }

    /// Partitions due for a load-verification pass, oldest first.
    pub fn due_for_load(&self, load_interval: Duration, limit: usize) -> Vec<Arc<DataPartition>> {
        self.inner
            .read()
            .partitions
            .iter()
            .filter(|p| p.needs_load(load_interval))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Rebuild the serialized client view when stale (or unconditionally).
    pub fn update_response_cache(&self, force: bool) {
        let mut inner = self.inner.write();
        if !force && !inner.response_cache.is_empty() {
            return;
        }
        let views: Vec<_> = inner.partitions.iter().map(|p| p.view()).collect();
        inner.response_cache = serde_json::to_vec(&views).unwrap_or_default();
    }

    pub fn response_cache(&self) -> Vec<u8> {
        self.inner.read().response_cache.clone()
    }
}

/// A named volume.
#[derive(Debug)]
pub struct Volume {
    pub id: u64,
    pub name: String,
    pub dp_replica_count: u8,
    pub mp_replica_count: u8,
    pub random_write: bool,
    pub data_partition_size: u64,
    capacity: AtomicU64,
    status: RwLock<VolumeStatus>,
    pub data_partitions: DataPartitionMap,
    meta_partitions: RwLock<BTreeMap<PartitionId, Arc<MetaPartition>>>,
    mp_response_cache: RwLock<Vec<u8>>,
}

impl Volume {
    pub fn new(
        id: u64,
        name: &str,
        dp_replica_count: u8,
        mp_replica_count: u8,
        random_write: bool,
        data_partition_size: u64,
        capacity: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_string(),
            dp_replica_count,
            mp_replica_count,
            random_write,
            data_partition_size,
            capacity: AtomicU64::new(capacity),
            status: RwLock::new(VolumeStatus::Normal),
            data_partitions: DataPartitionMap::new(),
            meta_partitions: RwLock::new(BTreeMap::new()),
            mp_response_cache: RwLock::new(Vec::new()),
        })
    }

    pub fn from_record(record: &VolumeRecord) -> Arc<Self> {
        let vol = Self::new(
            record.id,
            &record.name,
            record.dp_replica_count,
            record.mp_replica_count,
            record.random_write,
            record.data_partition_size,
            record.capacity,
        );
        *vol.status.write() = record.status;
        vol
    }

    pub fn record(&self) -> VolumeRecord {
        VolumeRecord {
            id: self.id,
            name: self.name.clone(),
            status: self.status(),
            dp_replica_count: self.dp_replica_count,
            mp_replica_count: self.mp_replica_count,
            random_write: self.random_write,
            data_partition_size: self.data_partition_size,
            capacity: self.capacity(),
        }
    }

    pub fn status(&self) -> VolumeStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: VolumeStatus) {
        *self.status.write() = status;
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.capacity.store(capacity, Ordering::SeqCst);
    }

    // -- meta partition collection ----------------------------------------

    pub fn add_meta_partition(&self, mp: Arc<MetaPartition>) {
        self.meta_partitions.write().insert(mp.id, mp);
        self.mp_response_cache.write().clear();
    }

    pub fn remove_meta_partition(&self, id: PartitionId) {
        self.meta_partitions.write().remove(&id);
        self.mp_response_cache.write().clear();
    }

    pub fn meta_partition(&self, id: PartitionId) -> Result<Arc<MetaPartition>> {
        self.meta_partitions
            .read()
            .get(&id)
            .cloned()
            .ok_or(MasterError::MetaPartitionNotFound(id))
    }

    pub fn meta_partitions(&self) -> Vec<Arc<MetaPartition>> {
        self.meta_partitions.read().values().cloned().collect()
    }

    pub fn meta_partition_count(&self) -> usize {
        self.meta_partitions.read().len()
    }

    /// Highest meta partition id, i.e. the partition owning the open range.
    pub fn max_meta_partition_id(&self) -> Option<PartitionId> {
        self.meta_partitions.read().keys().next_back().copied()
    }

    pub fn data_partition(&self, id: PartitionId) -> Result<Arc<DataPartition>> {
        self.data_partitions
            .get(id)
            .ok_or(MasterError::DataPartitionNotFound(id))
    }

    // -- initialization ----------------------------------------------------

    /// Create the initial meta partitions: ranges `[0, e0]`, `(e0, e1]`,
    /// `(e1, +inf)` covering the whole inode-id space.
    pub async fn init_meta_partitions(&self, c: &Arc<Cluster>) {
        let count = DEFAULT_INIT_META_PARTITION_COUNT as u64;
        let step = DEFAULT_META_PARTITION_INODE_STEP;
        let mut start = 0u64;
        for index in 0..count {
            let end = if index == count - 1 {
                u64::MAX
            } else {
                (index + 1) * step
            };
            if let Err(e) = c.create_meta_partition(&self.name, start, end).await {
                warn!(vol = %self.name, start, end, error = %e, "init meta partition failed");
                break;
            }
            start = end + 1;
        }
    }

    /// Create the initial batch of data partitions.
    pub async fn init_data_partitions(&self, c: &Arc<Cluster>) {
        for _ in 0..c.config().init_data_partition_count {
            if let Err(e) = c.create_data_partition(&self.name).await {
                warn!(vol = %self.name, error = %e, "init data partition failed");
            }
        }
    }

    // -- reconciliation ----------------------------------------------------

    /// Recompute every data partition's status from replica telemetry.
    /// Returns the number of read-writable partitions and refreshes the
    /// read/write subset and client response cache.
    pub fn check_data_partitions(&self, heartbeat_interval: Duration) -> usize {
        let partitions = self.data_partitions.partitions();
        let read_writes = partitions
            .iter()
            .filter(|dp| dp.recompute_status(heartbeat_interval) == PartitionStatus::ReadWrite)
            .count();
        self.data_partitions.set_read_write_count(read_writes);
        self.data_partitions.update_response_cache(true);
        read_writes
    }

    /// Recompute every meta partition's status and refresh the view cache.
    pub fn check_meta_partitions(&self, heartbeat_interval: Duration) {
        let partitions = self.meta_partitions();
        for mp in &partitions {
            mp.recompute_status(heartbeat_interval);
        }
        let views: Vec<_> = partitions.iter().map(|mp| mp.view()).collect();
        *self.mp_response_cache.write() = serde_json::to_vec(&views).unwrap_or_default();
    }

    pub fn meta_partition_response_cache(&self) -> Vec<u8> {
        self.mp_response_cache.read().clone()
    }

    /// Release extent maps loaded for verification, bounded per call.
    pub fn release_data_partitions(&self, max: usize, after: Duration) -> usize {
        let mut released = 0;
        for dp in self.data_partitions.partitions() {
            if released >= max {
                break;
            }
            if dp.release_load(after) {
                released += 1;
            }
        }
        released
    }

    /// Drive volume state transitions: a volume marked for deletion tears
    /// down its partitions and finally removes itself from the cluster.
    pub async fn check_status(&self, c: &Arc<Cluster>) {
        if self.status() == VolumeStatus::Normal {
            return;
        }

        // Deletion is mark + asynchronous GC: one bounded pass per check.
        for dp in self.data_partitions.partitions() {
            let tasks = dp.hosts().iter().map(|host| dp.delete_task(host)).collect();
            c.add_data_node_tasks(tasks);
            if let Err(e) = c.sync_delete_data_partition(&dp) {
                warn!(vol = %self.name, partition = dp.id, error = %e, "gc data partition failed");
                continue;
            }
            self.data_partitions.remove(dp.id);
        }

        for mp in self.meta_partitions() {
            let tasks = mp.hosts().iter().map(|host| mp.delete_task(host)).collect();
            c.add_meta_node_tasks(tasks);
            if let Err(e) = c.sync_delete_meta_partition(&mp) {
                warn!(vol = %self.name, partition = mp.id, error = %e, "gc meta partition failed");
                continue;
            }
            self.remove_meta_partition(mp.id);
        }

        if self.data_partitions.is_empty() && self.meta_partition_count() == 0 {
            if let Err(e) = c.sync_delete_vol(self) {
                warn!(vol = %self.name, error = %e, "delete vol record failed");
                return;
            }
            c.delete_vol(&self.name).await;
            info!(vol = %self.name, "volume deleted after gc");
        }
    }

    /// Whether the auto-creation reconciler should add partitions.
    pub fn needs_more_writable_partitions(&self, threshold: usize) -> bool {
        self.status() == VolumeStatus::Normal && self.data_partitions.read_write_count() < threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Peer;

    fn test_volume() -> Arc<Volume> {
        Volume::new(1, "v1", 3, 3, false, 1 << 30, 100)
    }

    fn dp_with_replicas(id: PartitionId, hosts: &[&str]) -> Arc<DataPartition> {
        let dp = DataPartition::new(id, 3, "v1", 1, false);
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
    fn test_partition_map_ordering() {
        let vol = test_volume();
        vol.data_partitions.put(dp_with_replicas(3, &["a:1", "b:1", "c:1"]));
        vol.data_partitions.put(dp_with_replicas(1, &["a:1", "b:1", "c:1"]));
        vol.data_partitions.put(dp_with_replicas(2, &["a:1", "b:1", "c:1"]));

        let ids: Vec<_> = vol.data_partitions.partitions().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        // Duplicate put is a no-op.
        vol.data_partitions.put(dp_with_replicas(2, &["a:1", "b:1", "c:1"]));
        assert_eq!(vol.data_partitions.len(), 3);
    }

    #[test]
    fn test_check_data_partitions_counts_read_write() {
        let vol = test_volume();
        let healthy = dp_with_replicas(1, &["a:1", "b:1", "c:1"]);
        let degraded = dp_with_replicas(2, &["a:1", "b:1", "c:1"]);
        degraded.remove_replica("c:1");
        vol.data_partitions.put(healthy);
        vol.data_partitions.put(degraded);

        let rw = vol.check_data_partitions(Duration::from_secs(60));
        assert_eq!(rw, 1);
        assert_eq!(vol.data_partitions.read_write_count(), 1);
        assert!(!vol.data_partitions.response_cache().is_empty());
    }

    #[test]
    fn test_max_meta_partition_id() {
        let vol = test_volume();
        assert!(vol.max_meta_partition_id().is_none());

        vol.add_meta_partition(MetaPartition::new(5, 0, 100, 3, "v1", 1));
        vol.add_meta_partition(MetaPartition::new(9, 101, u64::MAX, 3, "v1", 1));
        assert_eq!(vol.max_meta_partition_id(), Some(9));
    }

    #[test]
    fn test_needs_more_writable_partitions() {
        let vol = test_volume();
        assert!(vol.needs_more_writable_partitions(10));

        vol.set_status(VolumeStatus::MarkDelete);
        assert!(!vol.needs_more_writable_partitions(10));
    }

    #[test]
    fn test_release_bounded() {
        let vol = test_volume();
        for id in 1..=4 {
            let dp = dp_with_replicas(id, &["a:1", "b:1", "c:1"]);
            dp.mark_loaded();
            vol.data_partitions.put(dp);
        }
        let released = vol.release_data_partitions(2, Duration::from_secs(0));
        assert_eq!(released, 2);
        let released = vol.release_data_partitions(10, Duration::from_secs(0));
        assert_eq!(released, 2);
    }
}
