//! Lifecycle orchestration: volume and partition creation, decommission of
//! nodes and partitions, and inode-range splits.
//!
//! Synchronous admin operations surface the first error, roll back any
//! in-memory staging, and leave the persisted log consistent. Fan-out to
//! replica hosts joins all workers and reports the first failure through a
//! bounded error channel.

use super::data_partition::DataPartition;
use super::meta_partition::MetaPartition;
use super::nodes::{DataNode, MetaNode};
use super::volume::Volume;
use super::Cluster;
use crate::error::{MasterError, Result};
use crate::types::{
    PartitionStatus, Peer, VolumeStatus, DEFAULT_DATA_PARTITION_SIZE, DEFAULT_META_REPLICA_COUNT,
    GB,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

impl Cluster {
    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    pub(crate) fn choose_target_data_nodes(
        &self,
        replica_count: usize,
    ) -> Result<(Vec<String>, Vec<Peer>)> {
        let interval = self.config().heartbeat_interval;
        let ns = self
            .topology
            .alloc_node_set_for_data_node(replica_count, interval)?;
        ns.choose_data_hosts(replica_count, interval)
    }

    pub(crate) fn choose_target_meta_hosts(
        &self,
        replica_count: usize,
    ) -> Result<(Vec<String>, Vec<Peer>)> {
        let interval = self.config().heartbeat_interval;
        let ns = self
            .topology
            .alloc_node_set_for_meta_node(replica_count, interval)?;
        ns.choose_meta_hosts(replica_count, interval)
    }

    /// Whether a node set can still host a meta partition of the given
    /// replica count.
    pub fn has_enough_writable_meta_hosts(&self, replica_count: usize, set_id: u64) -> bool {
        match self.topology.node_set(set_id) {
            Ok(ns) => ns.writable_meta_node_count(self.config().heartbeat_interval) >= replica_count,
            Err(_) => {
                error!(node_set = set_id, "node set does not exist");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Volumes
    // ------------------------------------------------------------------

    /// Create a new volume with its initial meta and data partitions.
    ///
    /// `size_gb` of 0 selects the default data partition size. Any failure
    /// of the initial meta partition batch marks the partial volume deleted
    /// and removes it from the map.
    pub async fn create_vol(
        self: &Arc<Self>,
        name: &str,
        replica_count: u8,
        random_write: bool,
        size_gb: u64,
        capacity: u64,
    ) -> Result<Arc<Volume>> {
        let dp_size = if size_gb == 0 {
            DEFAULT_DATA_PARTITION_SIZE
        } else {
            size_gb * GB
        };

        let vol = match self
            .do_create_vol(name, replica_count, random_write, dp_size, capacity)
            .await
        {
            Ok(vol) => vol,
            Err(e) => {
                self.alert(&format!("create vol {} failed: {}", name, e));
                return Err(e);
            }
        };

        vol.init_meta_partitions(self).await;
        if vol.meta_partition_count() == 0 {
            vol.set_status(VolumeStatus::MarkDelete);
            if let Err(e) = self.sync_delete_vol(&vol) {
                error!(vol = name, error = %e, "rollback of partial volume failed");
            }
            self.delete_vol(name).await;
            let err = MasterError::NoResource(format!("vol {} got no meta partitions", name));
            self.alert(&format!("create vol {} failed: {}", name, err));
            return Err(err);
        }

        let target = self.config().init_data_partition_count;
        let mut read_writes = 0;
        for _ in 0..3 {
            if read_writes >= target {
                break;
            }
            vol.init_data_partitions(self).await;
            read_writes = vol.check_data_partitions(self.config().heartbeat_interval);
        }
        info!(
            cluster = %self.name,
            vol = name,
            read_writes,
            "volume created"
        );
        Ok(vol)
    }

    async fn do_create_vol(
        &self,
        name: &str,
        replica_count: u8,
        random_write: bool,
        dp_size: u64,
        capacity: u64,
    ) -> Result<Arc<Volume>> {
        if self.get_vol(name).await.is_ok() {
            return Err(MasterError::AlreadyExists(name.to_string()));
        }
        let id = self.id_alloc().allocate_common_id(self.raft())?;
        let vol = Volume::new(
            id,
            name,
            replica_count,
            DEFAULT_META_REPLICA_COUNT,
            random_write,
            dp_size,
            capacity,
        );
        self.sync_add_vol(&vol)?;
        self.put_vol(vol.clone()).await;
        Ok(vol)
    }

    /// Flag a volume for deletion; partitions are torn down asynchronously
    /// by the volume status reconciler. Idempotent.
    pub async fn mark_delete_vol(&self, name: &str) -> Result<()> {
        let vol = self.get_vol(name).await?;
        let previous = vol.status();
        vol.set_status(VolumeStatus::MarkDelete);
        if let Err(e) = self.sync_update_vol(&vol) {
            vol.set_status(previous);
            self.alert(&format!("mark delete vol {} failed: {}", name, e));
            return Err(e);
        }
        Ok(())
    }

    /// Grow a volume's capacity. Shrinking is rejected.
    pub async fn update_vol(&self, name: &str, capacity: u64) -> Result<()> {
        let vol = self.get_vol(name).await?;
        let current = vol.capacity();
        if capacity < current {
            let err = MasterError::InvalidArgument(format!(
                "capacity {} less than current capacity {}",
                capacity, current
            ));
            self.alert(&format!("update vol {} failed: {}", name, err));
            return Err(err);
        }
        vol.set_capacity(capacity);
        if let Err(e) = self.sync_update_vol(&vol) {
            vol.set_capacity(current);
            self.alert(&format!("update vol {} failed: {}", name, e));
            return Err(e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data partitions
    // ------------------------------------------------------------------

    /// Create one data partition for the volume.
    ///
    /// Serialized cluster-wide by the data partition mutex so that
    /// concurrent creations produce strictly increasing partition ids.
    /// Creation fans out to every chosen host in parallel and aborts on the
    /// first failure.
    pub async fn create_data_partition(
        self: &Arc<Self>,
        vol_name: &str,
    ) -> Result<Arc<DataPartition>> {
        let _guard = self.dp_mutex.lock().await;
        let vol = self.get_vol(vol_name).await?;
        let replica_count = vol.dp_replica_count as usize;

        let result: Result<Arc<DataPartition>> = async {
            let (hosts, peers) = self.choose_target_data_nodes(replica_count)?;
            let id = self.id_alloc().allocate_data_partition_id(self.raft())?;
            let dp = DataPartition::new(id, vol.dp_replica_count, vol_name, vol.id, vol.random_write);
            dp.set_placement(hosts.clone(), peers);

            let (err_tx, mut err_rx) = mpsc::channel::<MasterError>(replica_count.max(1));
            let mut workers = Vec::with_capacity(hosts.len());
            for host in hosts {
                let cluster = self.clone();
                let dp = dp.clone();
                let err_tx = err_tx.clone();
                let size = vol.data_partition_size;
                workers.push(tokio::spawn(async move {
                    match cluster
                        .sync_create_data_partition_to_data_node(&host, size, &dp)
                        .await
                    {
                        Ok(()) => dp.add_replica(&host),
                        Err(e) => {
                            let _ = err_tx.send(e).await;
                        }
                    }
                }));
            }
            for worker in workers {
                let _ = worker.await;
            }
            drop(err_tx);
            let mut first_err = None;
            while let Some(e) = err_rx.recv().await {
                if first_err.is_none() {
                    first_err = Some(e);
                } else {
                    warn!(partition = id, error = %e, "additional replica create failure");
                }
            }
            if let Some(e) = first_err {
                return Err(e);
            }

            dp.set_status(PartitionStatus::ReadWrite);
            self.sync_add_data_partition(&dp)?;
            vol.data_partitions.put(dp.clone());
            info!(
                cluster = %self.name,
                vol = vol_name,
                partition = id,
                "data partition created"
            );
            Ok(dp)
        }
        .await;

        result.map_err(|e| {
            self.alert(&format!(
                "create data partition for vol {} failed: {}",
                vol_name, e
            ));
            e
        })
    }

    pub(crate) async fn sync_create_data_partition_to_data_node(
        &self,
        host: &str,
        partition_size: u64,
        dp: &DataPartition,
    ) -> Result<()> {
        let node = self.data_node(host)?;
        let task = dp.create_task(host, partition_size);
        node.task_mgr.sync_send_admin_task(&task).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Meta partitions
    // ------------------------------------------------------------------

    /// Create one meta partition covering `[start, end]`.
    pub async fn create_meta_partition(
        self: &Arc<Self>,
        vol_name: &str,
        start: u64,
        end: u64,
    ) -> Result<Arc<MetaPartition>> {
        let result: Result<Arc<MetaPartition>> = async {
            let vol = self.get_vol(vol_name).await?;
            let replica_count = vol.mp_replica_count as usize;

            let (hosts, peers) = self.choose_target_meta_hosts(replica_count)?;
            info!(vol = vol_name, ?hosts, "target meta hosts chosen");
            let id = self.id_alloc().allocate_meta_partition_id(self.raft())?;
            let mp = MetaPartition::new(id, start, end, vol.mp_replica_count, vol_name, vol.id);
            mp.set_placement(hosts.clone(), peers);

            let (err_tx, mut err_rx) = mpsc::channel::<MasterError>(replica_count.max(1));
            let mut workers = Vec::with_capacity(hosts.len());
            for host in hosts.iter().cloned() {
                let cluster = self.clone();
                let mp = mp.clone();
                let err_tx = err_tx.clone();
                workers.push(tokio::spawn(async move {
                    match cluster.sync_create_meta_partition_to_meta_node(&host, &mp).await {
                        Ok(()) => mp.add_replica(&host),
                        Err(e) => {
                            let _ = err_tx.send(e).await;
                        }
                    }
                }));
            }
            for worker in workers {
                let _ = worker.await;
            }
            drop(err_tx);
            let mut first_err = None;
            while let Some(e) = err_rx.recv().await {
                if first_err.is_none() {
                    first_err = Some(e);
                } else {
                    warn!(partition = id, error = %e, "additional replica create failure");
                }
            }
            if let Some(e) = first_err {
                return Err(e);
            }

            mp.set_status(PartitionStatus::ReadWrite);
            // First peer bootstraps the replica group and leads until reports
            // say otherwise.
            if let Some(first) = hosts.first() {
                mp.set_leader(first);
            }
            self.sync_add_meta_partition(&mp)?;
            vol.add_meta_partition(mp.clone());
            info!(
                cluster = %self.name,
                vol = vol_name,
                partition = id,
                start,
                end,
                "meta partition created"
            );
            Ok(mp)
        }
        .await;

        result.map_err(|e| {
            self.alert(&format!(
                "create meta partition for vol {} failed: {}",
                vol_name, e
            ));
            e
        })
    }

    pub(crate) async fn sync_create_meta_partition_to_meta_node(
        &self,
        host: &str,
        mp: &MetaPartition,
    ) -> Result<()> {
        let node = self.meta_node(host)?;
        let task = mp.create_task(host);
        node.task_mgr.sync_send_admin_task(&task).await?;
        Ok(())
    }

    /// Split the open-ended meta partition at `start`.
    ///
    /// The current last partition's upper bound shrinks to `start` and a
    /// successor covering `(start, +inf)` is created. `start` must exceed
    /// the highest inode id the partition has reported.
    pub async fn update_inode_id_range(self: &Arc<Self>, vol_name: &str, start: u64) -> Result<()> {
        let result: Result<()> = async {
            let vol = self.get_vol(vol_name).await?;
            let max_id = vol
                .max_meta_partition_id()
                .ok_or(MasterError::MetaPartitionNotFound(0))?;
            let mp = vol.meta_partition(max_id)?;

            if start <= mp.max_inode_id() {
                return Err(MasterError::InvalidArgument(format!(
                    "next meta partition start must be larger than {}",
                    mp.max_inode_id()
                )));
            }
            // Without a known leader the range update cannot reach the replica
            // group.
            mp.leader()?;

            let (_, old_end) = mp.range();
            mp.set_end(start);
            if let Err(e) = self.sync_update_meta_partition(&mp) {
                mp.set_end(old_end);
                return Err(e);
            }
            let tasks = mp
                .hosts()
                .iter()
                .map(|host| mp.update_range_task(host))
                .collect();
            self.add_meta_node_tasks(tasks);

            // The shrunken bound is already persisted. If the successor
            // create fails, inode ids above `start` are uncovered until the
            // operator retries the split; the alert below is the only
            // signal, no reconciler repairs a missing successor range.
            self.create_meta_partition(vol_name, start + 1, u64::MAX)
                .await?;
            Ok(())
        }
        .await;

        result.map_err(|e| {
            self.alert(&format!(
                "update inode id range for vol {} at {} failed: {}",
                vol_name, start, e
            ));
            e
        })
    }

    // ------------------------------------------------------------------
    // Decommission
    // ------------------------------------------------------------------

    /// Move one replica of `dp` off `offline_addr`, preserving the
    /// replication factor.
    pub async fn decommission_data_partition(
        self: &Arc<Self>,
        offline_addr: &str,
        dp: &Arc<DataPartition>,
        reason: &str,
    ) -> Result<()> {
        let result: Result<()> = async {
            if !dp.has_host(offline_addr) {
                return Err(MasterError::ReplicaNotFound(offline_addr.to_string()));
            }
            let vol = self.get_vol(&dp.vol_name).await?;
            let replica = dp
                .replica(offline_addr)
                .ok_or_else(|| MasterError::ReplicaNotFound(offline_addr.to_string()))?;
            dp.has_missing_replica()?;
            let interval = self.config().heartbeat_interval;
            dp.can_be_offline(offline_addr, interval)?;

            let data_node = self.data_node(offline_addr)?;
            let exclude = dp.hosts();

            // Prefer a replacement from the offline node's rack, fall back
            // to whole-cluster selection.
            let same_rack = self
                .topology
                .get_rack(&data_node)
                .and_then(|rack| rack.get_avail_data_node_hosts(&exclude, 1, interval));
            let (new_hosts, new_sel_peers) = match same_rack {
                Ok(res) => res,
                Err(_) => self
                    .topology
                    .get_avail_data_node_hosts(&exclude, 1, interval)?,
            };
            let new_addr = new_hosts[0].clone();
            let add_peer = new_sel_peers[0].clone();

            // Peers derive from the hosts list, ids resolved through the
            // registry.
            let remove_peer = Peer {
                id: data_node.id,
                addr: offline_addr.to_string(),
            };
            let mut new_peers = Vec::new();
            for host in dp.hosts() {
                if host == offline_addr {
                    continue;
                }
                let node = self.data_node(&host)?;
                new_peers.push(Peer {
                    id: node.id,
                    addr: host,
                });
            }
            new_peers.push(add_peer.clone());

            let target = dp
                .hosts()
                .into_iter()
                .find(|h| h != offline_addr)
                .ok_or(MasterError::QuorumLost(dp.id))?;
            let remove_task = dp.decommission_task(&target, remove_peer, add_peer);

            let old_hosts = dp.hosts();
            let old_peers = dp.peers();
            dp.replace_host(offline_addr, &new_addr, new_peers);
            if let Err(e) = self.sync_update_data_partition(dp) {
                dp.set_placement(old_hosts, old_peers);
                return Err(e);
            }
            dp.remove_replica(offline_addr);
            dp.remove_miss_replica(offline_addr);
            self.add_data_node_tasks(vec![remove_task]);

            self.sync_create_data_partition_to_data_node(&new_addr, vol.data_partition_size, dp)
                .await?;
            dp.add_replica(&new_addr);
            dp.set_status(PartitionStatus::ReadOnly);
            dp.set_recovering(true);
            self.record_bad_partition(offline_addr, &replica.disk_path, dp.id);
            warn!(
                cluster = %self.name,
                partition = dp.id,
                offline = offline_addr,
                replacement = %new_addr,
                "data partition replica decommissioned"
            );
            Ok(())
        }
        .await;

        result.map_err(|e| {
            self.alert(&format!(
                "{}: decommission partition {} on {} failed: {}",
                reason, dp.id, offline_addr, e
            ));
            e
        })
    }

    /// Decommission a data node: move every replica it hosts, then remove
    /// it from the log, the registry and the topology.
    pub async fn data_node_off_line(self: &Arc<Self>, node: &Arc<DataNode>) -> Result<()> {
        warn!(cluster = %self.name, addr = %node.addr, "data node going offline");

        for vol in self.all_vols().await {
            for dp in vol.data_partitions.partitions() {
                if !dp.has_host(&node.addr) {
                    continue;
                }
                self.decommission_data_partition(&node.addr, &dp, "data node offline")
                    .await?;
            }
        }
        if let Err(e) = self.sync_delete_data_node(node) {
            self.alert(&format!("data node {} offline failed: {}", node.addr, e));
            return Err(e);
        }
        self.remove_data_node_from_cache(node);
        if let Ok(ns) = self.topology.node_set(node.node_set_id) {
            if let Err(e) = self.sync_update_node_set(&ns) {
                warn!(node_set = ns.id, error = %e, "node set update after offline failed");
            }
        }
        self.alert(&format!("data node {} offline success", node.addr));
        Ok(())
    }

    /// Move one replica of `mp` off `offline_addr`.
    pub async fn decommission_meta_partition(
        self: &Arc<Self>,
        offline_addr: &str,
        mp: &Arc<MetaPartition>,
    ) -> Result<()> {
        let result: Result<()> = async {
            if !mp.has_host(offline_addr) {
                return Err(MasterError::ReplicaNotFound(offline_addr.to_string()));
            }

            let meta_node = self.meta_node(offline_addr)?;
            let ns = self.topology.node_set(meta_node.node_set_id)?;
            let interval = self.config().heartbeat_interval;
            let exclude = mp.hosts();
            let (new_hosts, new_sel_peers) =
                crate::topology::select_carry_nodes(&ns.meta_nodes(), &exclude, 1, interval)?;
            let new_addr = new_hosts[0].clone();

            let remove_peer = Peer {
                id: meta_node.id,
                addr: offline_addr.to_string(),
            };
            let mut new_peers = Vec::new();
            for host in mp.hosts() {
                if host == offline_addr {
                    continue;
                }
                let node = self.meta_node(&host)?;
                new_peers.push(Peer {
                    id: node.id,
                    addr: host,
                });
            }
            new_peers.push(new_sel_peers[0].clone());

            let old_hosts = mp.hosts();
            let old_peers = mp.peers();
            mp.replace_host(offline_addr, &new_addr, new_peers);
            if let Err(e) = self.sync_update_meta_partition(mp) {
                mp.set_placement(old_hosts, old_peers);
                return Err(e);
            }
            mp.remove_replica(offline_addr);
            self.add_meta_node_tasks(vec![mp.delete_task(offline_addr)]);

            self.sync_create_meta_partition_to_meta_node(&new_addr, mp)
                .await?;
            mp.add_replica(&new_addr);
            warn!(
                cluster = %self.name,
                partition = mp.id,
                offline = offline_addr,
                replacement = %new_addr,
                remove_peer = remove_peer.id,
                "meta partition replica decommissioned"
            );
            Ok(())
        }
        .await;

        result.map_err(|e| {
            self.alert(&format!(
                "decommission meta partition {} on {} failed: {}",
                mp.id, offline_addr, e
            ));
            e
        })
    }

    /// Decommission a meta node. Per-partition errors are logged and
    /// swallowed; operators inspect the bad-partition index and alerts.
    pub async fn decommission_meta_node(self: &Arc<Self>, node: &Arc<MetaNode>) {
        warn!(cluster = %self.name, addr = %node.addr, "meta node going offline");

        for vol in self.all_vols().await {
            for mp in vol.meta_partitions() {
                if !mp.has_host(&node.addr) {
                    continue;
                }
                if let Err(e) = self.decommission_meta_partition(&node.addr, &mp).await {
                    self.alert(&format!(
                        "meta node {} offline: partition {} not moved: {}",
                        node.addr, mp.id, e
                    ));
                }
            }
        }
        if let Err(e) = self.sync_delete_meta_node(node) {
            self.alert(&format!("meta node {} offline failed: {}", node.addr, e));
            return;
        }
        self.remove_meta_node_from_cache(node);
        if let Ok(ns) = self.topology.node_set(node.node_set_id) {
            if let Err(e) = self.sync_update_node_set(&ns) {
                warn!(node_set = ns.id, error = %e, "node set update after offline failed");
            }
        }
        self.alert(&format!("meta node {} offline success", node.addr));
    }
}
