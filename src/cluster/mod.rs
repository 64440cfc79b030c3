//! The in-memory cluster model and its leader-gated write path.
//!
//! [`Cluster`] is the process-wide singleton behind the master: it owns the
//! volume map, the data/meta node registries, the topology, the id
//! allocator and the bad-partition index, and it funnels every mutation
//! through the replicated FSM gateway so that any elected leader can
//! resume the cluster's view from the store.
//!
//! Lock order (never reversed): volume map, data-partition creation mutex,
//! node registration mutexes, per-volume collections, per-partition state.

pub mod data_partition;
pub mod meta_partition;
pub mod nodes;
pub mod volume;

mod lifecycle;
mod scheduler;

use crate::config::MasterConfig;
use crate::error::{MasterError, Result};
use crate::fsm::{self, CommandOp, MetadataFsm, RaftCommand};
use crate::idalloc::IdAllocator;
use crate::raft::RaftPartition;
use crate::store::MetaStore;
use crate::task::{AdminTask, PartitionReport, TaskManager};
use crate::topology::{NodeSet, Topology};
use crate::types::{ClusterView, NodeId, NodeStatInfo, NodeView, PartitionId};
use dashmap::DashMap;
use self::data_partition::DataPartition;
use self::meta_partition::MetaPartition;
use self::nodes::{DataNode, MetaNode};
use parking_lot::RwLock as SyncRwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use self::volume::Volume;

/// The cluster master's in-memory model.
pub struct Cluster {
    pub name: String,
    cfg: MasterConfig,
    vols: RwLock<HashMap<String, Arc<Volume>>>,
    data_nodes: DashMap<String, Arc<DataNode>>,
    meta_nodes: DashMap<String, Arc<MetaNode>>,
    /// Serializes data partition creation across volumes.
    dp_mutex: Mutex<()>,
    /// Serialize node registration per node class.
    dn_mutex: Mutex<()>,
    mn_mutex: Mutex<()>,
    leader_addr: SyncRwLock<String>,
    pub topology: Topology,
    id_alloc: Arc<IdAllocator>,
    /// `addr:diskPath` of a decommissioned replica to the partition ids
    /// still recovering off it.
    bad_data_partitions: DashMap<String, Vec<PartitionId>>,
    should_auto_allocate: AtomicBool,
    #[allow(dead_code)]
    fsm: Arc<MetadataFsm>,
    partition: Arc<dyn RaftPartition>,
    store: Arc<dyn MetaStore>,
    data_node_stat: SyncRwLock<NodeStatInfo>,
    meta_node_stat: SyncRwLock<NodeStatInfo>,
}

impl Cluster {
    /// Construct the cluster after the store and consensus partition are
    /// ready, wiring the apply path and rebuilding in-memory state from
    /// persisted records.
    pub async fn open(
        cfg: MasterConfig,
        store: Arc<dyn MetaStore>,
        partition: Arc<dyn RaftPartition>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;

        let id_alloc = Arc::new(IdAllocator::new());
        let fsm = MetadataFsm::new(store.clone(), id_alloc.clone());
        fsm.register(partition.as_ref());
        id_alloc.restore(store.as_ref())?;

        let cluster = Arc::new(Self {
            name: cfg.cluster_name.clone(),
            cfg,
            vols: RwLock::new(HashMap::new()),
            data_nodes: DashMap::new(),
            meta_nodes: DashMap::new(),
            dp_mutex: Mutex::new(()),
            dn_mutex: Mutex::new(()),
            mn_mutex: Mutex::new(()),
            leader_addr: SyncRwLock::new(String::new()),
            topology: Topology::new(),
            id_alloc,
            bad_data_partitions: DashMap::new(),
            should_auto_allocate: AtomicBool::new(false),
            fsm,
            partition,
            store,
            data_node_stat: SyncRwLock::new(NodeStatInfo::default()),
            meta_node_stat: SyncRwLock::new(NodeStatInfo::default()),
        });
        cluster.load_metadata().await?;
        Ok(cluster)
    }

    pub fn config(&self) -> &MasterConfig {
        &self.cfg
    }

    pub fn is_leader(&self) -> bool {
        self.partition.is_leader()
    }

    pub(crate) fn raft(&self) -> &dyn RaftPartition {
        self.partition.as_ref()
    }

    pub(crate) fn id_alloc(&self) -> &IdAllocator {
        &self.id_alloc
    }

    /// Advertised address of the current consensus leader.
    pub fn leader_addr(&self) -> String {
        self.leader_addr.read().clone()
    }

    /// Refresh the advertised leader address from the consensus term.
    pub fn check_leader_addr(&self) {
        let (leader_id, _term) = self.partition.leader_term();
        if let Some(addr) = self.cfg.addr_database.get(&leader_id) {
            *self.leader_addr.write() = addr.clone();
        }
    }

    pub fn set_auto_allocate(&self, enable: bool) {
        self.should_auto_allocate.store(enable, Ordering::SeqCst);
    }

    pub fn should_auto_allocate(&self) -> bool {
        self.should_auto_allocate.load(Ordering::SeqCst)
    }

    /// Operator alert hook: every surfaced lifecycle error also lands on
    /// the alert target, tagged with the cluster id.
    pub(crate) fn alert(&self, msg: &str) {
        warn!(target: "bedrock::alert", cluster = %self.name, "{}", msg);
    }

    // ------------------------------------------------------------------
    // FSM gateway
    // ------------------------------------------------------------------

    fn submit(&self, op: CommandOp, key: String, value: Vec<u8>) -> Result<()> {
        let cmd = RaftCommand::new(op, key, value);
        self.partition.submit(&cmd.encode()?)
    }

    pub(crate) fn sync_add_vol(&self, vol: &Volume) -> Result<()> {
        self.submit(
            CommandOp::AddVolume,
            fsm::vol_key(&vol.name),
            serde_json::to_vec(&vol.record())?,
        )
    }

    pub(crate) fn sync_update_vol(&self, vol: &Volume) -> Result<()> {
        self.submit(
            CommandOp::UpdateVolume,
            fsm::vol_key(&vol.name),
            serde_json::to_vec(&vol.record())?,
        )
    }

    pub(crate) fn sync_delete_vol(&self, vol: &Volume) -> Result<()> {
        self.submit(CommandOp::DeleteVolume, fsm::vol_key(&vol.name), Vec::new())
    }

    pub(crate) fn sync_add_data_node(&self, node: &DataNode) -> Result<()> {
        self.submit(
            CommandOp::AddDataNode,
            fsm::data_node_key(&node.addr),
            serde_json::to_vec(&node.record())?,
        )
    }

    pub(crate) fn sync_delete_data_node(&self, node: &DataNode) -> Result<()> {
        self.submit(
            CommandOp::DeleteDataNode,
            fsm::data_node_key(&node.addr),
            Vec::new(),
        )
    }

    pub(crate) fn sync_add_meta_node(&self, node: &MetaNode) -> Result<()> {
        self.submit(
            CommandOp::AddMetaNode,
            fsm::meta_node_key(&node.addr),
            serde_json::to_vec(&node.record())?,
        )
    }

    pub(crate) fn sync_delete_meta_node(&self, node: &MetaNode) -> Result<()> {
        self.submit(
            CommandOp::DeleteMetaNode,
            fsm::meta_node_key(&node.addr),
            Vec::new(),
        )
    }

    pub(crate) fn sync_add_data_partition(&self, dp: &DataPartition) -> Result<()> {
        self.submit(
            CommandOp::AddDataPartition,
            fsm::data_partition_key(dp.vol_id, dp.id),
            serde_json::to_vec(&dp.record())?,
        )
    }

    pub(crate) fn sync_update_data_partition(&self, dp: &DataPartition) -> Result<()> {
        self.submit(
            CommandOp::UpdateDataPartition,
            fsm::data_partition_key(dp.vol_id, dp.id),
            serde_json::to_vec(&dp.record())?,
        )
    }

    pub(crate) fn sync_delete_data_partition(&self, dp: &DataPartition) -> Result<()> {
        self.submit(
            CommandOp::DeleteDataPartition,
            fsm::data_partition_key(dp.vol_id, dp.id),
            Vec::new(),
        )
    }

    pub(crate) fn sync_add_meta_partition(&self, mp: &MetaPartition) -> Result<()> {
        self.submit(
            CommandOp::AddMetaPartition,
            fsm::meta_partition_key(mp.vol_id, mp.id),
            serde_json::to_vec(&mp.record())?,
        )
    }

    pub(crate) fn sync_update_meta_partition(&self, mp: &MetaPartition) -> Result<()> {
        self.submit(
            CommandOp::UpdateMetaPartition,
            fsm::meta_partition_key(mp.vol_id, mp.id),
            serde_json::to_vec(&mp.record())?,
        )
    }

    pub(crate) fn sync_delete_meta_partition(&self, mp: &MetaPartition) -> Result<()> {
        self.submit(
            CommandOp::DeleteMetaPartition,
            fsm::meta_partition_key(mp.vol_id, mp.id),
            Vec::new(),
        )
    }

    pub(crate) fn sync_add_node_set(&self, ns: &NodeSet) -> Result<()> {
        self.submit(
            CommandOp::AddNodeSet,
            fsm::node_set_key(ns.id),
            serde_json::to_vec(&ns.record())?,
        )
    }

    pub(crate) fn sync_update_node_set(&self, ns: &NodeSet) -> Result<()> {
        self.submit(
            CommandOp::UpdateNodeSet,
            fsm::node_set_key(ns.id),
            serde_json::to_vec(&ns.record())?,
        )
    }

    // ------------------------------------------------------------------
    // Node registry
    // ------------------------------------------------------------------

    fn new_task_manager(&self, addr: &str) -> Arc<TaskManager> {
        TaskManager::new(
            addr,
            self.cfg.connect_timeout,
            self.cfg.task_timeout,
            self.cfg.conn_pool_capacity,
        )
    }

    fn create_node_set(&self) -> Result<Arc<NodeSet>> {
        let id = self.id_alloc.allocate_common_id(self.partition.as_ref())?;
        let ns = NodeSet::new(id, self.cfg.node_set_capacity);
        self.sync_add_node_set(&ns)?;
        self.topology.put_node_set(ns.clone());
        Ok(ns)
    }

    /// Register a data node. Idempotent by address: an already registered
    /// address returns its existing id. The registry insert happens last so
    /// partial failures never expose an incomplete record.
    pub async fn add_data_node(&self, addr: &str, rack_name: &str) -> Result<NodeId> {
        let _guard = self.dn_mutex.lock().await;
        if let Some(node) = self.data_nodes.get(addr) {
            return Ok(node.id);
        }

        let result: Result<Arc<DataNode>> = (|| {
            let ns = match self.topology.get_avail_node_set_for_data_node() {
                Some(ns) => ns,
                None => self.create_node_set()?,
            };
            let id = self.id_alloc.allocate_common_id(self.partition.as_ref())?;
            let node = DataNode::new(addr, rack_name, id, ns.id, self.new_task_manager(addr));
            self.sync_add_data_node(&node)?;
            ns.increase_data_node_count();
            if let Err(e) = self.sync_update_node_set(&ns) {
                ns.decrease_data_node_count();
                return Err(e);
            }
            self.topology.add_data_node(node.clone())?;
            info!(
                cluster = %self.name,
                addr,
                node_set = ns.id,
                data_nodes = ns.data_node_count(),
                meta_nodes = ns.meta_node_count(),
                capacity = ns.capacity,
                "data node registered"
            );
            Ok(node)
        })();

        match result {
            Ok(node) => {
                let id = node.id;
                self.data_nodes.insert(addr.to_string(), node);
                Ok(id)
            }
            Err(e) => {
                self.alert(&format!("add data node {} failed: {}", addr, e));
                Err(e)
            }
        }
    }

    /// Register a meta node; same contract as [`Cluster::add_data_node`].
    pub async fn add_meta_node(&self, addr: &str) -> Result<NodeId> {
        let _guard = self.mn_mutex.lock().await;
        if let Some(node) = self.meta_nodes.get(addr) {
            return Ok(node.id);
        }

        let result: Result<Arc<MetaNode>> = (|| {
            let ns = match self.topology.get_avail_node_set_for_meta_node() {
                Some(ns) => ns,
                None => self.create_node_set()?,
            };
            let id = self.id_alloc.allocate_common_id(self.partition.as_ref())?;
            let node = MetaNode::new(addr, id, ns.id, self.new_task_manager(addr));
            self.sync_add_meta_node(&node)?;
            ns.increase_meta_node_count();
            if let Err(e) = self.sync_update_node_set(&ns) {
                ns.decrease_meta_node_count();
                return Err(e);
            }
            self.topology.add_meta_node(node.clone())?;
            info!(
                cluster = %self.name,
                addr,
                node_set = ns.id,
                "meta node registered"
            );
            Ok(node)
        })();

        match result {
            Ok(node) => {
                let id = node.id;
                self.meta_nodes.insert(addr.to_string(), node);
                Ok(id)
            }
            Err(e) => {
                self.alert(&format!("add meta node {} failed: {}", addr, e));
                Err(e)
            }
        }
    }

    pub fn data_node(&self, addr: &str) -> Result<Arc<DataNode>> {
        self.data_nodes
            .get(addr)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MasterError::DataNodeNotFound(addr.to_string()))
    }

    pub fn meta_node(&self, addr: &str) -> Result<Arc<MetaNode>> {
        self.meta_nodes
            .get(addr)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MasterError::MetaNodeNotFound(addr.to_string()))
    }

    pub fn data_node_count(&self) -> usize {
        self.data_nodes.len()
    }

    pub fn meta_node_count(&self) -> usize {
        self.meta_nodes.len()
    }

    pub fn all_data_nodes(&self) -> Vec<NodeView> {
        self.data_nodes
            .iter()
            .map(|entry| entry.value().view())
            .collect()
    }

    pub fn all_meta_nodes(&self) -> Vec<NodeView> {
        self.meta_nodes
            .iter()
            .map(|entry| entry.value().view())
            .collect()
    }

    pub(crate) fn data_node_list(&self) -> Vec<Arc<DataNode>> {
        self.data_nodes
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub(crate) fn meta_node_list(&self) -> Vec<Arc<MetaNode>> {
        self.meta_nodes
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Ratio of live data nodes to registered data nodes.
    pub fn live_data_nodes_rate(&self) -> f32 {
        let total = self.data_nodes.len();
        if total == 0 {
            return 0.0;
        }
        let live = self
            .data_nodes
            .iter()
            .filter(|entry| entry.value().health.is_live(self.cfg.heartbeat_interval))
            .count();
        live as f32 / total as f32
    }

    /// Ratio of live meta nodes to registered meta nodes.
    pub fn live_meta_nodes_rate(&self) -> f32 {
        let total = self.meta_nodes.len();
        if total == 0 {
            return 0.0;
        }
        let live = self
            .meta_nodes
            .iter()
            .filter(|entry| entry.value().health.is_live(self.cfg.heartbeat_interval))
            .count();
        live as f32 / total as f32
    }

    pub(crate) fn remove_data_node_from_cache(&self, node: &Arc<DataNode>) {
        self.data_nodes.remove(&node.addr);
        self.topology.delete_data_node(node);
        let node = node.clone();
        tokio::spawn(async move { node.clear().await });
    }

    pub(crate) fn remove_meta_node_from_cache(&self, node: &Arc<MetaNode>) {
        self.meta_nodes.remove(&node.addr);
        self.topology.delete_meta_node(node);
        let node = node.clone();
        tokio::spawn(async move { node.clear().await });
    }

    // ------------------------------------------------------------------
    // Volume map
    // ------------------------------------------------------------------

    pub(crate) async fn put_vol(&self, vol: Arc<Volume>) {
        let mut vols = self.vols.write().await;
        vols.entry(vol.name.clone()).or_insert(vol);
    }

    pub async fn get_vol(&self, name: &str) -> Result<Arc<Volume>> {
        self.vols
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| MasterError::VolumeNotFound(name.to_string()))
    }

    pub(crate) async fn delete_vol(&self, name: &str) {
        self.vols.write().await.remove(name);
    }

    /// Every volume, including those marked for deletion.
    pub async fn copy_vols(&self) -> Vec<Arc<Volume>> {
        self.vols.read().await.values().cloned().collect()
    }

    /// Volumes still serving, i.e. not marked for deletion.
    pub async fn all_vols(&self) -> Vec<Arc<Volume>> {
        self.vols
            .read()
            .await
            .values()
            .filter(|v| v.status() == crate::types::VolumeStatus::Normal)
            .cloned()
            .collect()
    }

    pub async fn all_vol_names(&self) -> Vec<String> {
        self.vols.read().await.keys().cloned().collect()
    }

    pub async fn vol_count(&self) -> usize {
        self.vols.read().await.len()
    }

    pub async fn data_partition_count(&self) -> usize {
        self.vols
            .read()
            .await
            .values()
            .map(|v| v.data_partitions.len())
            .sum()
    }

    pub async fn data_partition_by_id(&self, id: PartitionId) -> Result<Arc<DataPartition>> {
        for vol in self.copy_vols().await {
            if let Some(dp) = vol.data_partitions.get(id) {
                return Ok(dp);
            }
        }
        Err(MasterError::DataPartitionNotFound(id))
    }

    pub async fn meta_partition_by_id(&self, id: PartitionId) -> Result<Arc<MetaPartition>> {
        for vol in self.copy_vols().await {
            if let Ok(mp) = vol.meta_partition(id) {
                return Ok(mp);
            }
        }
        Err(MasterError::MetaPartitionNotFound(id))
    }

    // ------------------------------------------------------------------
    // Task dispatch
    // ------------------------------------------------------------------

    /// Route tasks to their data nodes for asynchronous dispatch. Tasks
    /// addressed to unknown nodes are dropped with a warning.
    pub fn add_data_node_tasks(&self, tasks: Vec<AdminTask>) {
        for task in tasks {
            match self.data_node(&task.operator_addr) {
                Ok(node) => node.task_mgr.enqueue(task),
                Err(_) => {
                    warn!(addr = %task.operator_addr, op = ?task.op, "dropping task for unknown data node");
                }
            }
        }
    }

    /// Route tasks to their meta nodes for asynchronous dispatch.
    pub fn add_meta_node_tasks(&self, tasks: Vec<AdminTask>) {
        for task in tasks {
            match self.meta_node(&task.operator_addr) {
                Ok(node) => node.task_mgr.enqueue(task),
                Err(_) => {
                    warn!(addr = %task.operator_addr, op = ?task.op, "dropping task for unknown meta node");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Replica telemetry
    // ------------------------------------------------------------------

    /// Merge per-partition replica reports from a data node heartbeat
    /// reply. Unknown partition ids are ignored; the node may still hold
    /// replicas of partitions deleted on the master.
    pub async fn process_data_node_report(&self, addr: &str, reports: &[PartitionReport]) {
        for report in reports {
            if let Ok(dp) = self.data_partition_by_id(report.partition_id).await {
                let status = if report.writable {
                    crate::types::PartitionStatus::ReadWrite
                } else {
                    crate::types::PartitionStatus::ReadOnly
                };
                dp.update_replica(addr, report.total, report.used, status);
            }
        }
    }

    /// Merge per-partition replica reports from a meta node heartbeat
    /// reply, including leader tracking.
    pub async fn process_meta_node_report(&self, addr: &str, reports: &[PartitionReport]) {
        for report in reports {
            if let Ok(mp) = self.meta_partition_by_id(report.partition_id).await {
                let status = if report.writable {
                    crate::types::PartitionStatus::ReadWrite
                } else {
                    crate::types::PartitionStatus::ReadOnly
                };
                mp.update_replica(addr, report.max_inode_id, status);
                if report.is_leader {
                    mp.set_leader(addr);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Bad partition index
    // ------------------------------------------------------------------

    pub(crate) fn record_bad_partition(&self, offline_addr: &str, disk_path: &str, id: PartitionId) {
        let key = format!("{}:{}", offline_addr, disk_path);
        self.bad_data_partitions.entry(key).or_default().push(id);
    }

    pub fn bad_partition_ids(&self, offline_addr: &str, disk_path: &str) -> Vec<PartitionId> {
        let key = format!("{}:{}", offline_addr, disk_path);
        self.bad_data_partitions
            .get(&key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub(crate) fn bad_partition_entries(&self) -> Vec<(String, Vec<PartitionId>)> {
        self.bad_data_partitions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub(crate) fn update_bad_partition_entry(&self, key: &str, remaining: Vec<PartitionId>) {
        if remaining.is_empty() {
            self.bad_data_partitions.remove(key);
        } else {
            self.bad_data_partitions.insert(key.to_string(), remaining);
        }
    }

    // ------------------------------------------------------------------
    // Stats and views
    // ------------------------------------------------------------------

    /// Recompute cluster-wide capacity statistics.
    pub fn update_stat_info(&self) {
        let mut data_stat = NodeStatInfo::default();
        for entry in self.data_nodes.iter() {
            let node = entry.value();
            data_stat.total += node.health.total();
            data_stat.used += node.health.used();
            data_stat.node_count += 1;
        }
        *self.data_node_stat.write() = data_stat;

        let mut meta_stat = NodeStatInfo::default();
        for entry in self.meta_nodes.iter() {
            let node = entry.value();
            meta_stat.total += node.health.total();
            meta_stat.used += node.health.used();
            meta_stat.node_count += 1;
        }
        *self.meta_node_stat.write() = meta_stat;
    }

    pub async fn cluster_view(&self) -> ClusterView {
        ClusterView {
            name: self.name.clone(),
            leader_addr: self.leader_addr(),
            data_node_stat: *self.data_node_stat.read(),
            meta_node_stat: *self.meta_node_stat.read(),
            vol_count: self.vol_count().await,
            data_node_count: self.data_node_count(),
            meta_node_count: self.meta_node_count(),
        }
    }

    // ------------------------------------------------------------------
    // Recovery from the store
    // ------------------------------------------------------------------

    /// Rebuild the in-memory model from persisted records. Runs at startup
    /// and when a replica takes leadership after applying the log.
    pub async fn load_metadata(&self) -> Result<()> {
        // Node sets first: nodes point into them.
        for (_, value) in self.store.scan_prefix("nodeSet/")? {
            let record: crate::fsm::NodeSetRecord = serde_json::from_slice(&value)?;
            self.topology.put_node_set(NodeSet::from_record(&record));
        }

        for (_, value) in self.store.scan_prefix("dataNode/")? {
            let record: crate::fsm::DataNodeRecord = serde_json::from_slice(&value)?;
            let node = DataNode::new(
                &record.addr,
                &record.rack_name,
                record.id,
                record.node_set_id,
                self.new_task_manager(&record.addr),
            );
            self.topology.add_data_node(node.clone())?;
            self.data_nodes.insert(record.addr.clone(), node);
        }

        for (_, value) in self.store.scan_prefix("metaNode/")? {
            let record: crate::fsm::MetaNodeRecord = serde_json::from_slice(&value)?;
            let node = MetaNode::new(
                &record.addr,
                record.id,
                record.node_set_id,
                self.new_task_manager(&record.addr),
            );
            self.topology.add_meta_node(node.clone())?;
            self.meta_nodes.insert(record.addr.clone(), node);
        }

        let mut vols_by_id: HashMap<u64, Arc<Volume>> = HashMap::new();
        for (_, value) in self.store.scan_prefix("vol/")? {
            let record: crate::fsm::VolumeRecord = serde_json::from_slice(&value)?;
            let vol = Volume::from_record(&record);
            vols_by_id.insert(vol.id, vol.clone());
            self.put_vol(vol).await;
        }

        for (_, value) in self.store.scan_prefix("dp/")? {
            let record: crate::fsm::DataPartitionRecord = serde_json::from_slice(&value)?;
            if let Some(vol) = vols_by_id.get(&record.vol_id) {
                vol.data_partitions.put(DataPartition::from_record(&record));
            }
        }

        for (_, value) in self.store.scan_prefix("mp/")? {
            let record: crate::fsm::MetaPartitionRecord = serde_json::from_slice(&value)?;
            if let Some(vol) = vols_by_id.get(&record.vol_id) {
                vol.add_meta_partition(MetaPartition::from_record(&record));
            }
        }

        info!(
            cluster = %self.name,
            vols = vols_by_id.len(),
            data_nodes = self.data_nodes.len(),
            meta_nodes = self.meta_nodes.len(),
            "metadata loaded from store"
        );
        Ok(())
    }
}
