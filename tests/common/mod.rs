//! Shared harness for master integration tests: an embedded master over an
//! in-memory store plus mock data/meta node servers speaking the admin task
//! protocol.

use bedrock::cluster::Cluster;
use bedrock::config::MasterConfig;
use bedrock::raft::SoloPartition;
use bedrock::store::MemStore;
use bedrock::task::{read_frame, write_frame, AdminTask, OpCode, TaskResponse, TaskStatus};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

pub const NODE_CAPACITY: u64 = 1 << 40; // 1 TiB per mock node

/// A fake data/meta node: acks every admin task and records the opcodes it
/// saw.
pub struct MockNode {
    pub addr: String,
    pub seen_ops: Arc<Mutex<Vec<OpCode>>>,
}

impl MockNode {
    pub async fn start(total: u64, used: u64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let seen_ops: Arc<Mutex<Vec<OpCode>>> = Arc::new(Mutex::new(Vec::new()));

        let ops = seen_ops.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let ops = ops.clone();
                tokio::spawn(async move {
                    while let Ok(frame) = read_frame(&mut stream).await {
                        let task: AdminTask = match bincode::deserialize(&frame) {
                            Ok(task) => task,
                            Err(_) => break,
                        };
                        ops.lock().unwrap().push(task.op);
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

        Self { addr, seen_ops }
    }

    pub fn saw(&self, op: OpCode) -> bool {
        self.seen_ops.lock().unwrap().contains(&op)
    }
}

/// An embedded master wired to mock nodes.
pub struct TestMaster {
    pub cluster: Arc<Cluster>,
    pub partition: Arc<SoloPartition>,
    pub store: Arc<MemStore>,
    pub data_nodes: Vec<MockNode>,
    pub meta_nodes: Vec<MockNode>,
}

/// Configuration for scenario tests: long heartbeat interval so replicas
/// registered during the test stay live without periodic reports.
pub fn test_config() -> MasterConfig {
    MasterConfig {
        cluster_name: "bedrock-test".to_string(),
        heartbeat_interval: Duration::from_secs(60),
        task_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(1),
        ..MasterConfig::default()
    }
}

impl TestMaster {
    /// Build a master with one mock data node per rack label and
    /// `meta_count` mock meta nodes, all reporting full capacity.
    pub async fn new(data_racks: &[&str], meta_count: usize) -> Self {
        Self::with_config(test_config(), data_racks, meta_count).await
    }

    pub async fn with_config(cfg: MasterConfig, data_racks: &[&str], meta_count: usize) -> Self {
        let store = Arc::new(MemStore::new());
        let partition = Arc::new(SoloPartition::new(1));
        let cluster = Cluster::open(cfg, store.clone(), partition.clone())
            .await
            .unwrap();

        let mut data_nodes = Vec::new();
        for rack in data_racks {
            let node = MockNode::start(NODE_CAPACITY, 0).await;
            cluster.add_data_node(&node.addr, rack).await.unwrap();
            data_nodes.push(node);
        }
        let mut meta_nodes = Vec::new();
        for _ in 0..meta_count {
            let node = MockNode::start(NODE_CAPACITY, 0).await;
            cluster.add_meta_node(&node.addr).await.unwrap();
            meta_nodes.push(node);
        }

        let master = Self {
            cluster,
            partition,
            store,
            data_nodes,
            meta_nodes,
        };
        master.report_all();
        master
    }

    /// Merge a synthetic heartbeat for every node so placement sees them
    /// as writable, without waiting for the async heartbeat round trip.
    pub fn report_all(&self) {
        let resp = TaskResponse {
            status: TaskStatus::Success,
            message: String::new(),
            partition_id: 0,
            total: NODE_CAPACITY,
            used: 0,
            max_inode_id: 0,
            partition_reports: Vec::new(),
        };
        for mock in &self.data_nodes {
            if let Ok(node) = self.cluster.data_node(&mock.addr) {
                node.health.process_heartbeat(&resp);
            }
        }
        for mock in &self.meta_nodes {
            if let Ok(node) = self.cluster.meta_node(&mock.addr) {
                node.health.process_heartbeat(&resp);
            }
        }
    }

    /// Rack label of the mock data node at `addr`.
    pub fn rack_of(&self, addr: &str) -> String {
        self.cluster.data_node(addr).unwrap().rack_name.clone()
    }
}
