//! Data and meta node records: identity, telemetry and liveness.
//!
//! Nodes are shared by reference between the registry (authoritative for
//! existence) and the topology (authoritative for grouping). Telemetry is
//! merged from heartbeat responses; a node is live while it is active and
//! its last report is younger than twice the heartbeat interval.

use crate::fsm::{DataNodeRecord, MetaNodeRecord};
use crate::task::{AdminTask, HeartbeatRequest, OpCode, TaskManager, TaskResponse};
use crate::types::{NodeId, NodeView};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Capacity and activity reported by a node.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeTelemetry {
    pub total: u64,
    pub used: u64,
    pub is_active: bool,
}

struct HealthInner {
    telemetry: NodeTelemetry,
    report_time: Instant,
}

/// Runtime health shared by both node classes: heartbeat telemetry plus the
/// carry accumulator used for fair placement.
pub struct NodeHealth {
    addr: String,
    inner: RwLock<HealthInner>,
    carry: Mutex<f64>,
}

impl NodeHealth {
    fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            inner: RwLock::new(HealthInner {
                telemetry: NodeTelemetry::default(),
                report_time: Instant::now(),
            }),
            carry: Mutex::new(0.0),
        }
    }

    /// Merge a heartbeat response into the node's telemetry.
    pub fn process_heartbeat(&self, resp: &TaskResponse) {
        let mut inner = self.inner.write();
        inner.telemetry.total = resp.total;
        inner.telemetry.used = resp.used;
        inner.telemetry.is_active = true;
        inner.report_time = Instant::now();
        debug!(addr = %self.addr, total = resp.total, used = resp.used, "heartbeat merged");
    }

    /// Mark the node inactive when its report has gone stale.
    pub fn check_liveness(&self, heartbeat_interval: Duration) {
        let mut inner = self.inner.write();
        if inner.report_time.elapsed() >= heartbeat_interval * 2 {
            inner.telemetry.is_active = false;
        }
    }

    /// Active and freshly reported.
    pub fn is_live(&self, heartbeat_interval: Duration) -> bool {
        let inner = self.inner.read();
        inner.telemetry.is_active && inner.report_time.elapsed() < heartbeat_interval * 2
    }

    /// Live with free capacity: a placement candidate.
    pub fn is_writable(&self, heartbeat_interval: Duration) -> bool {
        self.is_live(heartbeat_interval) && self.available() > 0
    }

    pub fn total(&self) -> u64 {
        self.inner.read().telemetry.total
    }

    pub fn used(&self) -> u64 {
        self.inner.read().telemetry.used
    }

    pub fn available(&self) -> u64 {
        let inner = self.inner.read();
        inner.telemetry.total.saturating_sub(inner.telemetry.used)
    }

    pub fn is_active(&self) -> bool {
        self.inner.read().telemetry.is_active
    }

    /// Accumulated carry weight for fair selection.
    pub fn carry(&self) -> f64 {
        *self.carry.lock()
    }

    pub fn add_carry(&self, delta: f64) {
        *self.carry.lock() += delta;
    }

    /// Reset the carry after this node has been picked.
    pub fn reset_carry(&self) {
        *self.carry.lock() = 0.0;
    }
}

/// A registered data node.
pub struct DataNode {
    pub addr: String,
    pub id: NodeId,
    pub node_set_id: u64,
    pub rack_name: String,
    pub health: NodeHealth,
    pub task_mgr: Arc<TaskManager>,
}

impl DataNode {
    pub fn new(
        addr: &str,
        rack_name: &str,
        id: NodeId,
        node_set_id: u64,
        task_mgr: Arc<TaskManager>,
    ) -> Arc<Self> {
        let node = Arc::new(Self {
            addr: addr.to_string(),
            id,
            node_set_id,
            rack_name: rack_name.to_string(),
            health: NodeHealth::new(addr),
            task_mgr,
        });
        node.wire_heartbeat_handler();
        node
    }

    fn wire_heartbeat_handler(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.task_mgr
            .set_response_handler(Box::new(move |task, resp| {
                if task.op == OpCode::DataNodeHeartbeat {
                    if let Some(node) = weak.upgrade() {
                        node.health.process_heartbeat(resp);
                    }
                }
            }));
    }

    /// Build the periodic heartbeat task for this node.
    pub fn heartbeat_task(&self, master_addr: &str) -> AdminTask {
        let body = bincode::serialize(&HeartbeatRequest {
            master_addr: master_addr.to_string(),
        })
        .unwrap_or_default();
        AdminTask::new(OpCode::DataNodeHeartbeat, &self.addr, 0, body)
    }

    pub fn view(&self) -> NodeView {
        NodeView {
            id: self.id,
            addr: self.addr.clone(),
            is_active: self.health.is_active(),
        }
    }

    pub fn record(&self) -> DataNodeRecord {
        DataNodeRecord {
            id: self.id,
            addr: self.addr.clone(),
            node_set_id: self.node_set_id,
            rack_name: self.rack_name.clone(),
        }
    }

    /// Release pooled connections when the node leaves the cluster.
    pub async fn clear(&self) {
        self.task_mgr.close().await;
    }
}

/// A registered meta node.
pub struct MetaNode {
    pub addr: String,
    pub id: NodeId,
    pub node_set_id: u64,
    pub health: NodeHealth,
    pub task_mgr: Arc<TaskManager>,
}

impl MetaNode {
    pub fn new(addr: &str, id: NodeId, node_set_id: u64, task_mgr: Arc<TaskManager>) -> Arc<Self> {
        let node = Arc::new(Self {
            addr: addr.to_string(),
            id,
            node_set_id,
            health: NodeHealth::new(addr),
            task_mgr,
        });
        node.wire_heartbeat_handler();
        node
    }

    fn wire_heartbeat_handler(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.task_mgr
            .set_response_handler(Box::new(move |task, resp| {
                if task.op == OpCode::MetaNodeHeartbeat {
                    if let Some(node) = weak.upgrade() {
                        node.health.process_heartbeat(resp);
                    }
                }
            }));
    }

    pub fn heartbeat_task(&self, master_addr: &str) -> AdminTask {
        let body = bincode::serialize(&HeartbeatRequest {
            master_addr: master_addr.to_string(),
        })
        .unwrap_or_default();
        AdminTask::new(OpCode::MetaNodeHeartbeat, &self.addr, 0, body)
    }

    pub fn view(&self) -> NodeView {
        NodeView {
            id: self.id,
            addr: self.addr.clone(),
            is_active: self.health.is_active(),
        }
    }

    pub fn record(&self) -> MetaNodeRecord {
        MetaNodeRecord {
            id: self.id,
            addr: self.addr.clone(),
            node_set_id: self.node_set_id,
        }
    }

    pub async fn clear(&self) {
        self.task_mgr.close().await;
    }
}
