//! Admin tasks sent to data and meta nodes.
//!
//! The master instructs remote nodes through a small binary protocol:
//! length-prefixed bincode frames carrying an [`AdminTask`] envelope, each
//! answered by a [`TaskResponse`]. Every node has a [`TaskManager`] owning a
//! connection pool and a background sender that drains asynchronously
//! queued tasks (heartbeats, deletions); creation and decommission use the
//! synchronous path because the orchestrator needs the ack.

use crate::error::{MasterError, Result};
use crate::types::{now_unix, PartitionId, Peer};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Upper bound for one frame on the admin channel.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Operation requested from a remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
    CreateDataPartition,
    CreateMetaPartition,
    DataNodeHeartbeat,
    MetaNodeHeartbeat,
    LoadDataPartition,
    DecommissionDataPartition,
    DeleteDataPartition,
    DeleteMetaPartition,
    UpdateMetaPartition,
}

/// Envelope for one admin request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminTask {
    /// Unique task id, useful when correlating node-side logs.
    pub id: String,
    pub op: OpCode,
    /// Address of the node this task is for.
    pub operator_addr: String,
    pub partition_id: PartitionId,
    /// Operation-specific payload, bincode-encoded.
    pub body: Vec<u8>,
    pub create_time: u64,
}

impl AdminTask {
    pub fn new(op: OpCode, operator_addr: &str, partition_id: PartitionId, body: Vec<u8>) -> Self {
        Self {
            id: format!("{:?}-{}-{:08x}", op, operator_addr, rand::random::<u32>()),
            op,
            operator_addr: operator_addr.to_string(),
            partition_id,
            body,
            create_time: now_unix(),
        }
    }
}

/// Outcome reported by the remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Success,
    Failed,
}

/// Reply to an [`AdminTask`]; heartbeat replies carry node telemetry and
/// per-partition replica reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub status: TaskStatus,
    #[serde(default)]
    pub message: String,
    pub partition_id: PartitionId,
    /// Total capacity of the reporting node, bytes.
    #[serde(default)]
    pub total: u64,
    /// Used capacity of the reporting node, bytes.
    #[serde(default)]
    pub used: u64,
    /// Highest inode id seen by a meta partition replica.
    #[serde(default)]
    pub max_inode_id: u64,
    /// One entry per partition replica hosted by the reporting node.
    #[serde(default)]
    pub partition_reports: Vec<PartitionReport>,
}

/// Replica telemetry for one partition, carried by heartbeat replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionReport {
    pub partition_id: PartitionId,
    pub total: u64,
    pub used: u64,
    /// Whether the replica still accepts writes.
    pub writable: bool,
    /// Whether the replica leads its consensus group.
    #[serde(default)]
    pub is_leader: bool,
    /// Highest inode id allocated (meta replicas only).
    #[serde(default)]
    pub max_inode_id: u64,
}

// ---------------------------------------------------------------------------
// Task payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDataPartitionRequest {
    pub partition_id: PartitionId,
    pub partition_size: u64,
    pub vol_name: String,
    pub random_write: bool,
    pub members: Vec<Peer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMetaPartitionRequest {
    pub partition_id: PartitionId,
    pub start: u64,
    pub end: u64,
    pub vol_name: String,
    pub members: Vec<Peer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub master_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadDataPartitionRequest {
    pub partition_id: PartitionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecommissionDataPartitionRequest {
    pub partition_id: PartitionId,
    pub remove_peer: Peer,
    pub add_peer: Peer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePartitionRequest {
    pub partition_id: PartitionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMetaPartitionRequest {
    pub partition_id: PartitionId,
    pub start: u64,
    pub end: u64,
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

pub async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    if payload.len() as u32 > MAX_FRAME_LEN {
        return Err(MasterError::Internal("frame too large".into()));
    }
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(MasterError::Internal(format!("oversized frame: {}", len)));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Connection pool
// ---------------------------------------------------------------------------

/// Pool of idle connections to a single remote node.
pub struct ConnPool {
    addr: String,
    connect_timeout: Duration,
    capacity: usize,
    idle: Mutex<Vec<TcpStream>>,
}

impl ConnPool {
    pub fn new(addr: &str, connect_timeout: Duration, capacity: usize) -> Self {
        Self {
            addr: addr.to_string(),
            connect_timeout,
            capacity,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Return an idle connection or dial a fresh one.
    pub async fn get(&self) -> Result<TcpStream> {
        if let Some(conn) = self.idle.lock().await.pop() {
            return Ok(conn);
        }
        tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| MasterError::Timeout(format!("connect to {}", self.addr)))?
            .map_err(|e| MasterError::ConnectionFailed(format!("{}: {}", self.addr, e)))
    }

    /// Return a connection to the pool. Callers must not return a
    /// connection after a send error; pass `force_close` to discard.
    pub async fn put(&self, conn: TcpStream, force_close: bool) {
        if force_close {
            return;
        }
        let mut idle = self.idle.lock().await;
        if idle.len() < self.capacity {
            idle.push(conn);
        }
    }

    /// Drop every idle connection.
    pub async fn close(&self) {
        self.idle.lock().await.clear();
    }
}

// ---------------------------------------------------------------------------
// Task manager
// ---------------------------------------------------------------------------

/// Called with each successful response from the async dispatch path.
pub type ResponseHandler = Box<dyn Fn(&AdminTask, &TaskResponse) + Send + Sync>;

/// Per-node task sender: owns the connection pool, a synchronous send path
/// and a background drain of asynchronously queued tasks.
pub struct TaskManager {
    pub addr: String,
    pool: Arc<ConnPool>,
    task_timeout: Duration,
    queue: mpsc::UnboundedSender<AdminTask>,
    handler: Arc<RwLock<Option<ResponseHandler>>>,
}

impl TaskManager {
    /// Create the manager and spawn its background sender. Must be called
    /// from within a tokio runtime.
    pub fn new(
        addr: &str,
        connect_timeout: Duration,
        task_timeout: Duration,
        pool_capacity: usize,
    ) -> Arc<Self> {
        let pool = Arc::new(ConnPool::new(addr, connect_timeout, pool_capacity));
        let handler: Arc<RwLock<Option<ResponseHandler>>> = Arc::new(RwLock::new(None));
        let (tx, rx) = mpsc::unbounded_channel();

        let mgr = Arc::new(Self {
            addr: addr.to_string(),
            pool: pool.clone(),
            task_timeout,
            queue: tx,
            handler: handler.clone(),
        });

        tokio::spawn(run_sender(
            addr.to_string(),
            pool,
            task_timeout,
            rx,
            handler,
        ));
        mgr
    }

    /// Install the callback invoked with responses from async dispatch.
    pub fn set_response_handler(&self, handler: ResponseHandler) {
        *self.handler.write() = Some(handler);
    }

    /// Queue a task for asynchronous dispatch.
    pub fn enqueue(&self, task: AdminTask) {
        if self.queue.send(task).is_err() {
            warn!(addr = %self.addr, "task sender stopped, dropping task");
        }
    }

    /// Send one task and wait for its response within the task timeout.
    pub async fn sync_send_admin_task(&self, task: &AdminTask) -> Result<TaskResponse> {
        let mut conn = self.pool.get().await?;
        match send_on(&mut conn, task, self.task_timeout).await {
            Ok(resp) => {
                self.pool.put(conn, false).await;
                if resp.status == TaskStatus::Failed {
                    return Err(MasterError::RemoteTaskFailed {
                        addr: self.addr.clone(),
                        reason: resp.message,
                    });
                }
                Ok(resp)
            }
            Err(e) => {
                // The connection is in an unknown state after a failed
                // exchange; it must not go back to the pool.
                drop(conn);
                Err(e)
            }
        }
    }

    /// Drop pooled connections. Pending queued tasks are abandoned once the
    /// manager itself is dropped.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn send_on(conn: &mut TcpStream, task: &AdminTask, bound: Duration) -> Result<TaskResponse> {
    let payload = bincode::serialize(task)?;
    tokio::time::timeout(bound, async {
        write_frame(conn, &payload).await?;
        let reply = read_frame(conn).await?;
        Ok(bincode::deserialize::<TaskResponse>(&reply)?)
    })
    .await
    .map_err(|_| MasterError::Timeout(format!("admin task to {}", task.operator_addr)))?
}

async fn run_sender(
    addr: String,
    pool: Arc<ConnPool>,
    task_timeout: Duration,
    mut rx: mpsc::UnboundedReceiver<AdminTask>,
    handler: Arc<RwLock<Option<ResponseHandler>>>,
) {
    while let Some(task) = rx.recv().await {
        let mut conn = match pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(addr = %addr, error = %e, op = ?task.op, "async task: connect failed");
                continue;
            }
        };
        match send_on(&mut conn, &task, task_timeout).await {
            Ok(resp) => {
                pool.put(conn, false).await;
                if resp.status == TaskStatus::Failed {
                    warn!(addr = %addr, op = ?task.op, message = %resp.message, "async task rejected");
                    continue;
                }
                debug!(addr = %addr, op = ?task.op, "async task acked");
                if let Some(h) = handler.read().as_ref() {
                    h(&task, &resp);
                }
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, op = ?task.op, "async task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal node stub: acks every task with fixed telemetry.
    async fn spawn_stub_node(total: u64, used: u64) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    while let Ok(frame) = read_frame(&mut stream).await {
                        let task: AdminTask = bincode::deserialize(&frame).unwrap();
                        let resp = TaskResponse {
                            status: TaskStatus::Success,
                            message: String::new(),
                            partition_id: task.partition_id,
                            total,
                            used,
                            max_inode_id: 0,
                            partition_reports: Vec::new(),
                        };
                        let out = bincode::serialize(&resp).unwrap();
                        if write_frame(&mut stream, &out).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_sync_send() {
        let addr = spawn_stub_node(1000, 100).await;
        let mgr = TaskManager::new(&addr, Duration::from_secs(1), Duration::from_secs(1), 4);

        let task = AdminTask::new(OpCode::LoadDataPartition, &addr, 7, Vec::new());
        let resp = mgr.sync_send_admin_task(&task).await.unwrap();
        assert_eq!(resp.partition_id, 7);
        assert_eq!(resp.total, 1000);
    }

    #[tokio::test]
    async fn test_sync_send_unreachable() {
        // A port that nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mgr = TaskManager::new(&addr, Duration::from_millis(300), Duration::from_millis(300), 4);
        let task = AdminTask::new(OpCode::DataNodeHeartbeat, &addr, 0, Vec::new());
        assert!(mgr.sync_send_admin_task(&task).await.is_err());
    }

    #[tokio::test]
    async fn test_async_dispatch_invokes_handler() {
        let addr = spawn_stub_node(2048, 512).await;
        let mgr = TaskManager::new(&addr, Duration::from_secs(1), Duration::from_secs(1), 4);

        let (tx, mut rx) = mpsc::unbounded_channel();
        mgr.set_response_handler(Box::new(move |_task, resp| {
            let _ = tx.send(resp.total);
        }));

        mgr.enqueue(AdminTask::new(OpCode::DataNodeHeartbeat, &addr, 0, Vec::new()));
        let total = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(total, 2048);
    }

    #[tokio::test]
    async fn test_pool_reuses_connections() {
        let addr = spawn_stub_node(1, 0).await;
        let pool = ConnPool::new(&addr, Duration::from_secs(1), 2);

        let conn = pool.get().await.unwrap();
        pool.put(conn, false).await;
        assert_eq!(pool.idle.lock().await.len(), 1);

        let conn = pool.get().await.unwrap();
        assert_eq!(pool.idle.lock().await.len(), 0);
        pool.put(conn, true).await; // force close drops it
        assert_eq!(pool.idle.lock().await.len(), 0);
    }
}
