//! Cluster topology: node sets, racks and placement.
//!
//! Two-level grouping: the topology is an ordered collection of node sets,
//! each node set groups racks, each rack lists data nodes. Meta nodes are
//! grouped by node set only. New nodes fill the first node set with spare
//! capacity; when all sets are full a new one is created by the registry.
//!
//! # Carry-weight selection
//!
//! Placement inside a rack (and for meta nodes inside a set) is fair by
//! free space. Every candidate accumulates a `carry` score in increments of
//! `available / max_total`, where `max_total` is the largest total capacity
//! among the candidates; a node becomes eligible when its carry reaches
//! 1.0. The selector advances all carries by the minimal number of steps
//! that makes `count` nodes eligible, picks the highest carries (ties
//! broken by ascending address) and resets the picked carries to zero.
//! The procedure is fully deterministic for a given cluster state.

use crate::cluster::nodes::{DataNode, MetaNode, NodeHealth};
use crate::error::{MasterError, Result};
use crate::fsm::NodeSetRecord;
use crate::types::{NodeId, Peer};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Node types that can be picked by the carry selector.
pub trait CarryNode: Send + Sync {
    fn addr(&self) -> &str;
    fn node_id(&self) -> NodeId;
    fn health(&self) -> &NodeHealth;
}

impl CarryNode for DataNode {
    fn addr(&self) -> &str {
        &self.addr
    }
    fn node_id(&self) -> NodeId {
        self.id
    }
    fn health(&self) -> &NodeHealth {
        &self.health
    }
}

impl CarryNode for MetaNode {
    fn addr(&self) -> &str {
        &self.addr
    }
    fn node_id(&self) -> NodeId {
        self.id
    }
    fn health(&self) -> &NodeHealth {
        &self.health
    }
}

/// Pick `count` writable nodes by carry weight.
///
/// See the module docs for the update formula. Returns the chosen
/// addresses together with their consensus peers.
pub fn select_carry_nodes<N: CarryNode>(
    candidates: &[Arc<N>],
    exclude: &[String],
    count: usize,
    heartbeat_interval: Duration,
) -> Result<(Vec<String>, Vec<Peer>)> {
    if count == 0 {
        return Ok((Vec::new(), Vec::new()));
    }
    let mut nodes: Vec<&Arc<N>> = candidates
        .iter()
        .filter(|n| {
            !exclude.iter().any(|e| e == n.addr()) && n.health().is_writable(heartbeat_interval)
        })
        .collect();

    if nodes.len() < count {
        return Err(MasterError::NoResource(format!(
            "need {} writable nodes, have {}",
            count,
            nodes.len()
        )));
    }

    let max_total = nodes
        .iter()
        .map(|n| n.health().total())
        .max()
        .unwrap_or(0);
    if max_total == 0 {
        return Err(MasterError::NoResource("no node reported capacity".into()));
    }

    // Advance every carry by the minimal number of steps that makes
    // `count` nodes eligible (carry >= 1.0). Writable nodes have
    // available > 0, so each per-step weight is positive.
    let mut steps_needed: Vec<u64> = nodes
        .iter()
        .map(|n| {
            let carry = n.health().carry();
            if carry >= 1.0 {
                0
            } else {
                let weight = n.health().available() as f64 / max_total as f64;
                ((1.0 - carry) / weight).ceil() as u64
            }
        })
        .collect();
    steps_needed.sort_unstable();
    let steps = steps_needed[count - 1];
    if steps > 0 {
        for n in &nodes {
            let weight = n.health().available() as f64 / max_total as f64;
            n.health().add_carry(steps as f64 * weight);
        }
    }

    nodes.sort_by(|a, b| {
        b.health()
            .carry()
            .total_cmp(&a.health().carry())
            .then_with(|| a.addr().cmp(b.addr()))
    });

    let mut hosts = Vec::with_capacity(count);
    let mut peers = Vec::with_capacity(count);
    for n in nodes.into_iter().take(count) {
        n.health().reset_carry();
        hosts.push(n.addr().to_string());
        peers.push(Peer {
            id: n.node_id(),
            addr: n.addr().to_string(),
        });
    }
    Ok((hosts, peers))
}

/// A failure-domain label grouping data nodes inside a node set.
pub struct Rack {
    pub name: String,
    data_nodes: RwLock<BTreeMap<String, Arc<DataNode>>>,
}

impl Rack {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            data_nodes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn put_data_node(&self, node: Arc<DataNode>) {
        self.data_nodes.write().insert(node.addr.clone(), node);
    }

    pub fn remove_data_node(&self, addr: &str) {
        self.data_nodes.write().remove(addr);
    }

    pub fn data_node_count(&self) -> usize {
        self.data_nodes.read().len()
    }

    pub fn data_nodes(&self) -> Vec<Arc<DataNode>> {
        self.data_nodes.read().values().cloned().collect()
    }

    pub fn has_writable_node(&self, heartbeat_interval: Duration) -> bool {
        self.data_nodes
            .read()
            .values()
            .any(|n| n.health.is_writable(heartbeat_interval))
    }

    /// Pick `count` hosts from this rack, skipping `exclude`.
    pub fn get_avail_data_node_hosts(
        &self,
        exclude: &[String],
        count: usize,
        heartbeat_interval: Duration,
    ) -> Result<(Vec<String>, Vec<Peer>)> {
        let candidates = self.data_nodes();
        select_carry_nodes(&candidates, exclude, count, heartbeat_interval)
    }
}

/// A topological container of nodes with a capacity bound.
pub struct NodeSet {
    pub id: u64,
    pub capacity: usize,
    data_node_count: AtomicUsize,
    meta_node_count: AtomicUsize,
    racks: RwLock<BTreeMap<String, Arc<Rack>>>,
    meta_nodes: RwLock<BTreeMap<String, Arc<MetaNode>>>,
}

impl NodeSet {
    pub fn new(id: u64, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            capacity,
            data_node_count: AtomicUsize::new(0),
            meta_node_count: AtomicUsize::new(0),
            racks: RwLock::new(BTreeMap::new()),
            meta_nodes: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn from_record(record: &NodeSetRecord) -> Arc<Self> {
        let ns = Self::new(record.id, record.capacity);
        ns.data_node_count
            .store(record.data_node_count, Ordering::SeqCst);
        ns.meta_node_count
            .store(record.meta_node_count, Ordering::SeqCst);
        ns
    }

    pub fn record(&self) -> NodeSetRecord {
        NodeSetRecord {
            id: self.id,
            capacity: self.capacity,
            data_node_count: self.data_node_count(),
            meta_node_count: self.meta_node_count(),
        }
    }

    pub fn data_node_count(&self) -> usize {
        self.data_node_count.load(Ordering::SeqCst)
    }

    pub fn meta_node_count(&self) -> usize {
        self.meta_node_count.load(Ordering::SeqCst)
    }

    pub fn increase_data_node_count(&self) {
        self.data_node_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrease_data_node_count(&self) {
        let _ = self
            .data_node_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    pub fn increase_meta_node_count(&self) {
        self.meta_node_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrease_meta_node_count(&self) {
        let _ = self
            .meta_node_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    /// A set accepts new data nodes while its member count is below capacity.
    pub fn can_accept_data_node(&self) -> bool {
        self.data_node_count() < self.capacity
    }

    pub fn can_accept_meta_node(&self) -> bool {
        self.meta_node_count() < self.capacity
    }

    pub fn put_data_node(&self, node: Arc<DataNode>) {
        let rack = {
            let mut racks = self.racks.write();
            racks
                .entry(node.rack_name.clone())
                .or_insert_with(|| Arc::new(Rack::new(&node.rack_name)))
                .clone()
        };
        rack.put_data_node(node);
    }

    pub fn delete_data_node(&self, node: &DataNode) {
        let mut racks = self.racks.write();
        if let Some(rack) = racks.get(&node.rack_name).cloned() {
            rack.remove_data_node(&node.addr);
            if rack.data_node_count() == 0 {
                racks.remove(&node.rack_name);
            }
        }
        self.decrease_data_node_count();
    }

    pub fn put_meta_node(&self, node: Arc<MetaNode>) {
        self.meta_nodes.write().insert(node.addr.clone(), node);
    }

    pub fn delete_meta_node(&self, node: &MetaNode) {
        self.meta_nodes.write().remove(&node.addr);
        self.decrease_meta_node_count();
    }

    pub fn rack(&self, name: &str) -> Result<Arc<Rack>> {
        self.racks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MasterError::RackNotFound(name.to_string()))
    }

    pub fn rack_count(&self) -> usize {
        self.racks.read().len()
    }

    pub fn is_single_rack(&self) -> bool {
        self.rack_count() == 1
    }

    pub fn meta_nodes(&self) -> Vec<Arc<MetaNode>> {
        self.meta_nodes.read().values().cloned().collect()
    }

    pub fn data_nodes(&self) -> Vec<Arc<DataNode>> {
        self.racks
            .read()
            .values()
            .flat_map(|rack| rack.data_nodes())
            .collect()
    }

    pub fn writable_data_node_count(&self, heartbeat_interval: Duration) -> usize {
        self.racks
            .read()
            .values()
            .map(|rack| {
                rack.data_nodes()
                    .iter()
                    .filter(|n| n.health.is_writable(heartbeat_interval))
                    .count()
            })
            .sum()
    }

    pub fn writable_meta_node_count(&self, heartbeat_interval: Duration) -> usize {
        self.meta_nodes
            .read()
            .values()
            .filter(|n| n.health.is_writable(heartbeat_interval))
            .count()
    }

    /// Racks with at least one writable node, ordered by name, capped at
    /// `limit`.
    fn writable_racks(&self, limit: usize, heartbeat_interval: Duration) -> Vec<Arc<Rack>> {
        self.racks
            .read()
            .values()
            .filter(|r| r.has_writable_node(heartbeat_interval))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Choose `replica_count` data hosts with rack diversity.
    ///
    /// Single-rack sets take every replica from that rack. With two
    /// writable racks the replicas split majority/minority; with
    /// `replica_count` racks each rack contributes one.
    pub fn choose_data_hosts(
        &self,
        replica_count: usize,
        heartbeat_interval: Duration,
    ) -> Result<(Vec<String>, Vec<Peer>)> {
        let mut hosts: Vec<String> = Vec::new();
        let mut peers: Vec<Peer> = Vec::new();

        if self.is_single_rack() {
            let rack = {
                let racks = self.racks.read();
                racks.values().next().cloned()
            };
            let rack = rack.ok_or_else(|| {
                MasterError::NoResource("no data node to create data partition".into())
            })?;
            let (h, p) = rack.get_avail_data_node_hosts(&hosts, replica_count, heartbeat_interval)?;
            return Ok((h, p));
        }

        let racks = self.writable_racks(replica_count, heartbeat_interval);
        match racks.len() {
            0 => {}
            1 => {
                let (h, p) =
                    racks[0].get_avail_data_node_hosts(&hosts, replica_count, heartbeat_interval)?;
                hosts = h;
                peers = p;
            }
            2 => {
                let master_count = replica_count / 2 + 1;
                let slave_count = replica_count - master_count;
                let (h, p) =
                    racks[0].get_avail_data_node_hosts(&hosts, master_count, heartbeat_interval)?;
                hosts.extend(h);
                peers.extend(p);
                if slave_count > 0 {
                    let (h, p) =
                        racks[1].get_avail_data_node_hosts(&hosts, slave_count, heartbeat_interval)?;
                    hosts.extend(h);
                    peers.extend(p);
                }
            }
            n if n == replica_count => {
                for rack in &racks {
                    let (h, p) = rack.get_avail_data_node_hosts(&hosts, 1, heartbeat_interval)?;
                    hosts.extend(h);
                    peers.extend(p);
                }
            }
            _ => {}
        }

        if hosts.len() != replica_count {
            return Err(MasterError::NoResource(
                "no data node to create data partition".into(),
            ));
        }
        Ok((hosts, peers))
    }

    /// Choose `replica_count` meta hosts: one leader candidate first, then
    /// the remaining replicas, all by carry weight.
    pub fn choose_meta_hosts(
        &self,
        replica_count: usize,
        heartbeat_interval: Duration,
    ) -> Result<(Vec<String>, Vec<Peer>)> {
        let candidates = self.meta_nodes();
        let (mut hosts, mut peers) =
            select_carry_nodes(&candidates, &[], 1, heartbeat_interval)?;
        let remaining = replica_count - 1;
        if remaining > 0 {
            let (h, p) = select_carry_nodes(&candidates, &hosts, remaining, heartbeat_interval)?;
            hosts.extend(h);
            peers.extend(p);
        }
        if hosts.len() != replica_count {
            return Err(MasterError::NoResource(
                "no meta node to create meta partition".into(),
            ));
        }
        Ok((hosts, peers))
    }
}

/// The ordered collection of node sets.
#[derive(Default)]
pub struct Topology {
    node_sets: RwLock<BTreeMap<u64, Arc<NodeSet>>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_node_set(&self, ns: Arc<NodeSet>) {
        self.node_sets.write().insert(ns.id, ns);
        info!(count = self.node_sets.read().len(), "node set added to topology");
    }

    pub fn node_set(&self, id: u64) -> Result<Arc<NodeSet>> {
        self.node_sets
            .read()
            .get(&id)
            .cloned()
            .ok_or(MasterError::NodeSetNotFound(id))
    }

    pub fn node_sets(&self) -> Vec<Arc<NodeSet>> {
        self.node_sets.read().values().cloned().collect()
    }

    pub fn node_set_count(&self) -> usize {
        self.node_sets.read().len()
    }

    /// First node set with room for another data node.
    pub fn get_avail_node_set_for_data_node(&self) -> Option<Arc<NodeSet>> {
        self.node_sets
            .read()
            .values()
            .find(|ns| ns.can_accept_data_node())
            .cloned()
    }

    /// First node set with room for another meta node.
    pub fn get_avail_node_set_for_meta_node(&self) -> Option<Arc<NodeSet>> {
        self.node_sets
            .read()
            .values()
            .find(|ns| ns.can_accept_meta_node())
            .cloned()
    }

    /// First node set with enough writable data nodes for `replica_count`
    /// replicas.
    pub fn alloc_node_set_for_data_node(
        &self,
        replica_count: usize,
        heartbeat_interval: Duration,
    ) -> Result<Arc<NodeSet>> {
        self.node_sets
            .read()
            .values()
            .find(|ns| ns.writable_data_node_count(heartbeat_interval) >= replica_count)
            .cloned()
            .ok_or_else(|| {
                MasterError::NoResource("no data node to create data partition".into())
            })
    }

    /// First node set with enough writable meta nodes.
    pub fn alloc_node_set_for_meta_node(
        &self,
        replica_count: usize,
        heartbeat_interval: Duration,
    ) -> Result<Arc<NodeSet>> {
        self.node_sets
            .read()
            .values()
            .find(|ns| ns.writable_meta_node_count(heartbeat_interval) >= replica_count)
            .cloned()
            .ok_or_else(|| {
                MasterError::NoResource("no meta node to create meta partition".into())
            })
    }

    pub fn add_data_node(&self, node: Arc<DataNode>) -> Result<()> {
        let ns = self.node_set(node.node_set_id)?;
        ns.put_data_node(node);
        Ok(())
    }

    pub fn add_meta_node(&self, node: Arc<MetaNode>) -> Result<()> {
        let ns = self.node_set(node.node_set_id)?;
        ns.put_meta_node(node);
        Ok(())
    }

    pub fn delete_data_node(&self, node: &DataNode) {
        if let Ok(ns) = self.node_set(node.node_set_id) {
            ns.delete_data_node(node);
        }
    }

    pub fn delete_meta_node(&self, node: &MetaNode) {
        if let Ok(ns) = self.node_set(node.node_set_id) {
            ns.delete_meta_node(node);
        }
    }

    /// Resolve the rack a data node belongs to.
    pub fn get_rack(&self, node: &DataNode) -> Result<Arc<Rack>> {
        self.node_set(node.node_set_id)?.rack(&node.rack_name)
    }

    /// Whole-cluster host selection, used when the preferred rack cannot
    /// supply a replacement replica.
    pub fn get_avail_data_node_hosts(
        &self,
        exclude: &[String],
        count: usize,
        heartbeat_interval: Duration,
    ) -> Result<(Vec<String>, Vec<Peer>)> {
        let candidates: Vec<Arc<DataNode>> = self
            .node_sets()
            .iter()
            .flat_map(|ns| ns.data_nodes())
            .collect();
        select_carry_nodes(&candidates, exclude, count, heartbeat_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskManager, TaskResponse, TaskStatus};

    fn mgr(addr: &str) -> Arc<TaskManager> {
        TaskManager::new(
            addr,
            Duration::from_millis(100),
            Duration::from_millis(100),
            1,
        )
    }

    fn active_data_node(addr: &str, rack: &str, id: u64, total: u64, used: u64) -> Arc<DataNode> {
        let node = DataNode::new(addr, rack, id, 1, mgr(addr));
        node.health.process_heartbeat(&TaskResponse {
            status: TaskStatus::Success,
            message: String::new(),
            partition_id: 0,
            total,
            used,
            max_inode_id: 0,
            partition_reports: Vec::new(),
        });
        node
    }

    const HB: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_carry_selection_deterministic() {
        let nodes: Vec<Arc<DataNode>> = (0..4)
            .map(|i| {
                active_data_node(
                    &format!("127.0.0.1:91{:02}", i),
                    "rack-a",
                    i + 1,
                    1000,
                    0,
                )
            })
            .collect();

        // Equal free space: ties resolve by ascending address.
        let (hosts, peers) = select_carry_nodes(&nodes, &[], 2, HB).unwrap();
        assert_eq!(hosts, vec!["127.0.0.1:9100", "127.0.0.1:9101"]);
        assert_eq!(peers[0].id, 1);

        // Picked nodes lost their carry, the others kept theirs.
        let (hosts, _) = select_carry_nodes(&nodes, &[], 2, HB).unwrap();
        assert_eq!(hosts, vec!["127.0.0.1:9102", "127.0.0.1:9103"]);
    }

    #[tokio::test]
    async fn test_carry_selection_prefers_free_space() {
        let roomy = active_data_node("127.0.0.1:9110", "rack-a", 1, 1000, 0);
        let packed = active_data_node("127.0.0.1:9111", "rack-a", 2, 1000, 900);
        let nodes = vec![packed, roomy];

        let (hosts, _) = select_carry_nodes(&nodes, &[], 1, HB).unwrap();
        assert_eq!(hosts, vec!["127.0.0.1:9110"]);
    }

    #[tokio::test]
    async fn test_carry_selection_excludes() {
        let nodes = vec![
            active_data_node("127.0.0.1:9120", "rack-a", 1, 1000, 0),
            active_data_node("127.0.0.1:9121", "rack-a", 2, 1000, 0),
        ];
        let exclude = vec!["127.0.0.1:9120".to_string()];
        let (hosts, _) = select_carry_nodes(&nodes, &exclude, 1, HB).unwrap();
        assert_eq!(hosts, vec!["127.0.0.1:9121"]);

        let err = select_carry_nodes(&nodes, &exclude, 2, HB).unwrap_err();
        assert!(matches!(err, MasterError::NoResource(_)));
    }

    #[tokio::test]
    async fn test_node_set_fill_and_overflow() {
        let topology = Topology::new();
        let ns = NodeSet::new(1, 2);
        topology.put_node_set(ns.clone());

        assert!(topology.get_avail_node_set_for_data_node().is_some());
        ns.increase_data_node_count();
        ns.increase_data_node_count();
        assert!(topology.get_avail_node_set_for_data_node().is_none());
    }

    #[tokio::test]
    async fn test_rack_diversity_two_racks() {
        let ns = NodeSet::new(1, 18);
        for i in 0..3u64 {
            let node =
                active_data_node(&format!("127.0.0.1:92{:02}", i), "rack-a", i + 1, 1000, 0);
            ns.put_data_node(node);
            ns.increase_data_node_count();
        }
        for i in 3..6u64 {
            let node =
                active_data_node(&format!("127.0.0.1:92{:02}", i), "rack-b", i + 1, 1000, 0);
            ns.put_data_node(node);
            ns.increase_data_node_count();
        }

        let (hosts, peers) = ns.choose_data_hosts(3, HB).unwrap();
        assert_eq!(hosts.len(), 3);
        assert_eq!(peers.len(), 3);

        // 2 racks and 3 replicas: majority from one, minority from the other.
        let in_a = hosts.iter().filter(|h| h.as_str() < "127.0.0.1:9203").count();
        let in_b = hosts.len() - in_a;
        assert_eq!(in_a.max(in_b), 2);
        assert_eq!(in_a.min(in_b), 1);
    }

    #[tokio::test]
    async fn test_single_rack_takes_all() {
        let ns = NodeSet::new(1, 18);
        for i in 0..3u64 {
            let node =
                active_data_node(&format!("127.0.0.1:93{:02}", i), "rack-a", i + 1, 1000, 0);
            ns.put_data_node(node);
            ns.increase_data_node_count();
        }
        let (hosts, _) = ns.choose_data_hosts(3, HB).unwrap();
        assert_eq!(hosts.len(), 3);
    }

    #[tokio::test]
    async fn test_insufficient_nodes_fails() {
        let ns = NodeSet::new(1, 18);
        let node = active_data_node("127.0.0.1:9400", "rack-a", 1, 1000, 0);
        ns.put_data_node(node);
        ns.increase_data_node_count();

        let err = ns.choose_data_hosts(3, HB).unwrap_err();
        assert!(matches!(err, MasterError::NoResource(_)));
    }
}
