//! End-to-end master scenarios: volume creation, node decommission, leader
//! handover, auto-creation, node-set capacity and inode-range splits.

#[allow(dead_code)]
mod common;

use bedrock::cluster::Cluster;
use bedrock::config::MasterConfig;
use bedrock::error::MasterError;
use bedrock::raft::SoloPartition;
use bedrock::store::MetaStore;
use bedrock::task::OpCode;
use bedrock::types::{PartitionStatus, VolumeStatus};
use common::{test_config, MockNode, TestMaster};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// S1 — create volume
// ============================================================================

#[tokio::test]
async fn test_create_volume() {
    let master = TestMaster::new(
        &["rack-a", "rack-a", "rack-a", "rack-b", "rack-b", "rack-b"],
        3,
    )
    .await;
    let c = &master.cluster;

    let vol = c.create_vol("v1", 3, false, 0, 100).await.unwrap();
    assert_eq!(vol.status(), VolumeStatus::Normal);

    // Three meta partitions covering [0, +inf).
    let mps = vol.meta_partitions();
    assert_eq!(mps.len(), 3);
    let mut ranges: Vec<_> = mps.iter().map(|mp| mp.range()).collect();
    ranges.sort();
    assert_eq!(ranges[0].0, 0);
    assert_eq!(ranges[2].1, u64::MAX);
    for window in ranges.windows(2) {
        assert_eq!(window[1].0, window[0].1 + 1, "ranges must be contiguous");
    }
    for mp in &mps {
        assert_eq!(mp.hosts().len(), 3);
    }

    // Ten data partitions, three hosts each, registry-resolvable, rack
    // diverse.
    let dps = vol.data_partitions.partitions();
    assert_eq!(dps.len(), 10);
    for dp in &dps {
        let hosts = dp.hosts();
        assert_eq!(hosts.len(), 3);
        assert_eq!(dp.status(), PartitionStatus::ReadWrite);

        let mut racks = HashSet::new();
        for host in &hosts {
            assert!(c.data_node(host).is_ok(), "host must resolve in registry");
            racks.insert(master.rack_of(host));
        }
        assert_eq!(racks.len(), 2, "2-rack split must span both racks");
    }
    assert_eq!(vol.data_partitions.read_write_count(), 10);

    // The mock nodes really were asked to create partitions.
    assert!(master
        .data_nodes
        .iter()
        .any(|n| n.saw(OpCode::CreateDataPartition)));
    assert!(master
        .meta_nodes
        .iter()
        .any(|n| n.saw(OpCode::CreateMetaPartition)));
}

// ============================================================================
// S2 — decommission a data node
// ============================================================================

#[tokio::test]
async fn test_decommission_data_node() {
    let master = TestMaster::new(
        &["rack-a", "rack-a", "rack-a", "rack-b", "rack-b", "rack-b"],
        3,
    )
    .await;
    let c = &master.cluster;
    let vol = c.create_vol("v1", 3, false, 0, 100).await.unwrap();

    // Pick the data node hosting the most partitions.
    let mut counts: Vec<(String, usize)> = master
        .data_nodes
        .iter()
        .map(|mock| {
            let hosted = vol
                .data_partitions
                .partitions()
                .iter()
                .filter(|dp| dp.has_host(&mock.addr))
                .count();
            (mock.addr.clone(), hosted)
        })
        .collect();
    counts.sort_by_key(|(_, n)| std::cmp::Reverse(*n));
    let (victim_addr, hosted) = counts[0].clone();
    assert!(hosted > 0);

    let victim = c.data_node(&victim_addr).unwrap();
    let victim_set = victim.node_set_id;
    let affected: Vec<_> = vol
        .data_partitions
        .partitions()
        .into_iter()
        .filter(|dp| dp.has_host(&victim_addr))
        .collect();

    c.data_node_off_line(&victim).await.unwrap();

    for dp in &affected {
        let hosts = dp.hosts();
        assert_eq!(hosts.len(), 3);
        assert!(!hosts.contains(&victim_addr));
        assert_eq!(dp.status(), PartitionStatus::ReadOnly);
        assert!(dp.is_recover());
        for host in &hosts {
            let node = c.data_node(host).unwrap();
            assert_eq!(node.node_set_id, victim_set, "replacement stays in the node set");
        }
    }

    // The bad-partition index holds every affected id under addr:disk.
    let bad = c.bad_partition_ids(&victim_addr, "");
    let affected_ids: HashSet<_> = affected.iter().map(|dp| dp.id).collect();
    assert_eq!(bad.len(), affected_ids.len());
    assert!(bad.iter().all(|id| affected_ids.contains(id)));

    // Removed from registry, topology and the replicated store.
    assert!(c.data_node(&victim_addr).is_err());
    let key = format!("dataNode/{}", victim_addr);
    assert!(master.store.scan_prefix(&key).unwrap().is_empty());
    assert_eq!(c.data_node_count(), 5);
}

// ============================================================================
// S3 — leader handover mid-create
// ============================================================================

#[tokio::test]
async fn test_proposal_failure_mid_create() {
    let master = TestMaster::new(&["rack-a", "rack-a", "rack-b", "rack-b"], 3).await;
    let c = &master.cluster;
    let vol = c.create_vol("v1", 3, false, 0, 100).await.unwrap();
    let before = vol.data_partitions.len();
    let persisted_before = master.store.scan_prefix("dp/").unwrap().len();

    // The next create allocates an id (first submit) and then fails the
    // partition record proposal (second submit).
    master.partition.script_submit_outcomes(&[true, false]);
    let err = c.create_data_partition("v1").await.unwrap_err();
    assert!(matches!(err, MasterError::ProposalFailed(_)));

    // No partition joined the volume and no orphan record exists.
    assert_eq!(vol.data_partitions.len(), before);
    assert_eq!(master.store.scan_prefix("dp/").unwrap().len(), persisted_before);

    // Reallocation uses a fresh id, strictly above the burned one.
    let max_before = vol
        .data_partitions
        .partitions()
        .iter()
        .map(|dp| dp.id)
        .max()
        .unwrap();
    let dp = c.create_data_partition("v1").await.unwrap();
    assert!(dp.id > max_before + 1, "id burned by the failed create is skipped");
    assert_eq!(vol.data_partitions.len(), before + 1);
}

// ============================================================================
// S4 — auto-creation restores writable partitions
// ============================================================================

#[tokio::test]
async fn test_auto_creation_restores_writable_count() {
    let master = TestMaster::new(
        &["rack-a", "rack-a", "rack-a", "rack-b", "rack-b", "rack-b"],
        3,
    )
    .await;
    let c = &master.cluster;
    let vol = c.create_vol("v1", 3, false, 0, 100).await.unwrap();
    c.set_auto_allocate(true);

    // Kill 8 of the 10 partitions: drop all their replicas.
    let dps = vol.data_partitions.partitions();
    for dp in dps.iter().take(8) {
        for addr in dp.replica_addrs() {
            dp.remove_replica(&addr);
        }
    }
    let hb = c.config().heartbeat_interval;
    assert_eq!(vol.check_data_partitions(hb), 2);

    // One reconciler pass stands in for the two-minute timer firing.
    c.check_auto_data_partition_creation().await;

    let writable = vol.check_data_partitions(hb);
    assert!(
        writable >= 10,
        "expected at least 10 writable partitions, got {}",
        writable
    );
}

// ============================================================================
// S5 — node-set capacity
// ============================================================================

#[tokio::test]
async fn test_node_set_capacity_overflow() {
    let cfg = MasterConfig {
        node_set_capacity: 4,
        ..test_config()
    };
    let master = TestMaster::with_config(cfg, &[], 0).await;
    let c = &master.cluster;

    let mut node_set_ids = Vec::new();
    let mut mocks = Vec::new();
    for i in 0..5 {
        let mock = MockNode::start(common::NODE_CAPACITY, 0).await;
        c.add_data_node(&mock.addr, &format!("rack-{}", i % 2))
            .await
            .unwrap();
        node_set_ids.push(c.data_node(&mock.addr).unwrap().node_set_id);
        mocks.push(mock);
    }

    // First four share a set, the fifth overflows into a new one.
    assert_eq!(node_set_ids[0..4].iter().collect::<HashSet<_>>().len(), 1);
    assert_ne!(node_set_ids[4], node_set_ids[0]);
    assert_eq!(c.topology.node_set_count(), 2);

    let first = c.topology.node_set(node_set_ids[0]).unwrap();
    let second = c.topology.node_set(node_set_ids[4]).unwrap();
    assert_eq!(first.data_node_count(), 4);
    assert_eq!(second.data_node_count(), 1);
}

// ============================================================================
// S6 — inode range split
// ============================================================================

#[tokio::test]
async fn test_inode_range_split() {
    let master = TestMaster::new(&["rack-a", "rack-a", "rack-b"], 3).await;
    let c = &master.cluster;
    let vol = c.create_vol("v1", 3, false, 0, 100).await.unwrap();

    let max_id = vol.max_meta_partition_id().unwrap();
    let mp = vol.meta_partition(max_id).unwrap();
    let leader = mp.leader().unwrap();

    // The open-ended partition has allocated 10000 inodes past its start.
    let (start, _) = mp.range();
    let reported = start + 10_000;
    mp.update_replica(&leader, reported, PartitionStatus::ReadWrite);

    let split = reported + 1;
    c.update_inode_id_range("v1", split).await.unwrap();

    // The old open-ended partition now ends at the split point.
    assert_eq!(mp.range().1, split);

    // A successor covering (split, +inf) exists with a full replica set.
    let new_max = vol.max_meta_partition_id().unwrap();
    assert_ne!(new_max, max_id);
    let successor = vol.meta_partition(new_max).unwrap();
    assert_eq!(successor.range(), (split + 1, u64::MAX));
    assert_eq!(successor.hosts().len(), 3);

    // Splitting below the successor's watermark is rejected.
    let err = c
        .update_inode_id_range("v1", start + 9_000)
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::InvalidArgument(_)));
}

// ============================================================================
// Idempotence and boundary behaviors
// ============================================================================

#[tokio::test]
async fn test_add_data_node_idempotent() {
    let master = TestMaster::new(&["rack-a"], 0).await;
    let c = &master.cluster;
    let addr = &master.data_nodes[0].addr;

    let first = c.data_node(addr).unwrap().id;
    let second = c.add_data_node(addr, "rack-a").await.unwrap();
    assert_eq!(first, second);

    // Exactly one persisted record.
    let records = master.store.scan_prefix("dataNode/").unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_create_vol_duplicate_rejected() {
    let master = TestMaster::new(&["rack-a", "rack-a", "rack-b"], 3).await;
    let c = &master.cluster;

    c.create_vol("v1", 3, false, 0, 100).await.unwrap();
    let dp_count = c.data_partition_count().await;

    let err = c.create_vol("v1", 3, false, 0, 100).await.unwrap_err();
    assert!(matches!(err, MasterError::AlreadyExists(_)));
    assert_eq!(c.vol_count().await, 1);
    assert_eq!(c.data_partition_count().await, dp_count);
}

#[tokio::test]
async fn test_mark_delete_vol_idempotent() {
    let master = TestMaster::new(&["rack-a", "rack-a", "rack-b"], 3).await;
    let c = &master.cluster;
    let vol = c.create_vol("v1", 3, false, 0, 100).await.unwrap();

    c.mark_delete_vol("v1").await.unwrap();
    assert_eq!(vol.status(), VolumeStatus::MarkDelete);
    c.mark_delete_vol("v1").await.unwrap();
    assert_eq!(vol.status(), VolumeStatus::MarkDelete);
}

#[tokio::test]
async fn test_create_data_partition_without_resources() {
    // Two writable data nodes cannot host a 3-replica partition.
    let master = TestMaster::new(&["rack-a", "rack-b"], 3).await;
    let c = &master.cluster;

    // Volume creation itself succeeds on the meta side; the data partition
    // batch fails quietly and leaves the volume empty.
    let vol = c.create_vol("v1", 3, false, 0, 100).await.unwrap();
    assert_eq!(vol.data_partitions.len(), 0);

    let err = c.create_data_partition("v1").await.unwrap_err();
    assert!(matches!(err, MasterError::NoResource(_)));
}

#[tokio::test]
async fn test_decommission_with_missing_replica_fails() {
    let master = TestMaster::new(
        &["rack-a", "rack-a", "rack-a", "rack-b", "rack-b", "rack-b"],
        3,
    )
    .await;
    let c = &master.cluster;
    let vol = c.create_vol("v1", 3, false, 0, 100).await.unwrap();

    let dp = vol.data_partitions.partitions()[0].clone();
    let hosts = dp.hosts();
    dp.remove_replica(&hosts[0]);

    let err = c
        .decommission_data_partition(&hosts[1], &dp, "test")
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::QuorumLost(_)));
}

#[tokio::test]
async fn test_update_vol_rejects_shrink() {
    let master = TestMaster::new(&["rack-a", "rack-a", "rack-b"], 3).await;
    let c = &master.cluster;
    let vol = c.create_vol("v1", 3, false, 0, 100).await.unwrap();

    c.update_vol("v1", 200).await.unwrap();
    assert_eq!(vol.capacity(), 200);

    let err = c.update_vol("v1", 50).await.unwrap_err();
    assert!(matches!(err, MasterError::InvalidArgument(_)));
    assert_eq!(vol.capacity(), 200);
}

#[tokio::test]
async fn test_live_node_rates() {
    let master = TestMaster::new(&[], 0).await;
    assert_eq!(master.cluster.live_data_nodes_rate(), 0.0);
    assert_eq!(master.cluster.live_meta_nodes_rate(), 0.0);

    let master = TestMaster::new(&["rack-a", "rack-a"], 2).await;
    assert_eq!(master.cluster.live_data_nodes_rate(), 1.0);
    assert_eq!(master.cluster.live_meta_nodes_rate(), 1.0);
}

#[tokio::test]
async fn test_not_leader_rejects_mutations() {
    let master = TestMaster::new(&["rack-a", "rack-a", "rack-b"], 3).await;
    master.partition.step_down();

    let err = master
        .cluster
        .create_vol("v1", 3, false, 0, 100)
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::NotLeader { .. }));
    assert_eq!(master.cluster.vol_count().await, 0);
}

#[tokio::test]
async fn test_decommission_meta_node() {
    let master = TestMaster::new(&["rack-a", "rack-a", "rack-b"], 4).await;
    let c = &master.cluster;
    let vol = c.create_vol("v1", 3, false, 0, 100).await.unwrap();

    let victim_addr = vol.meta_partitions()[0].hosts()[0].clone();
    let victim = c.meta_node(&victim_addr).unwrap();

    c.decommission_meta_node(&victim).await;

    for mp in vol.meta_partitions() {
        assert_eq!(mp.hosts().len(), 3);
        assert!(!mp.has_host(&victim_addr));
    }
    assert!(c.meta_node(&victim_addr).is_err());
    assert_eq!(c.meta_node_count(), 3);
    let key = format!("metaNode/{}", victim_addr);
    assert!(master.store.scan_prefix(&key).unwrap().is_empty());
}

#[tokio::test]
async fn test_heartbeat_fanout_merges_telemetry() {
    let master = TestMaster::new(&["rack-a"], 1).await;
    let c = &master.cluster;

    c.check_data_node_heartbeat();
    c.check_meta_node_heartbeat();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(master.data_nodes[0].saw(OpCode::DataNodeHeartbeat));
    assert!(master.meta_nodes[0].saw(OpCode::MetaNodeHeartbeat));
    let node = c.data_node(&master.data_nodes[0].addr).unwrap();
    assert!(node.health.is_live(c.config().heartbeat_interval));
}

#[tokio::test]
async fn test_partition_reports_merge_into_replicas() {
    let master = TestMaster::new(
        &["rack-a", "rack-a", "rack-a", "rack-b", "rack-b", "rack-b"],
        3,
    )
    .await;
    let c = &master.cluster;
    let vol = c.create_vol("v1", 3, false, 0, 100).await.unwrap();

    let dp = vol.data_partitions.partitions()[0].clone();
    let reporter = dp.hosts()[0].clone();
    let report = bedrock::task::PartitionReport {
        partition_id: dp.id,
        total: 1 << 30,
        used: 1 << 20,
        writable: true,
        is_leader: false,
        max_inode_id: 0,
    };
    c.process_data_node_report(&reporter, &[report]).await;
    let replica = dp.replica(&reporter).unwrap();
    assert_eq!(replica.total, 1 << 30);
    assert_eq!(replica.used, 1 << 20);

    // A meta report moves the leader and raises the inode watermark.
    let mp = vol.meta_partitions()[0].clone();
    let meta_reporter = mp.hosts()[1].clone();
    let report = bedrock::task::PartitionReport {
        partition_id: mp.id,
        total: 0,
        used: 0,
        writable: true,
        is_leader: true,
        max_inode_id: mp.max_inode_id() + 500,
    };
    let expected_max = report.max_inode_id;
    c.process_meta_node_report(&meta_reporter, &[report]).await;
    assert_eq!(mp.leader().unwrap(), meta_reporter);
    assert_eq!(mp.max_inode_id(), expected_max);
}

#[tokio::test]
async fn test_schedulers_run_and_stop() {
    let cfg = MasterConfig {
        check_partition_interval: Duration::from_millis(50),
        load_partition_interval: Duration::from_millis(50),
        free_partition_interval: Duration::from_millis(50),
        ..test_config()
    };
    let master = TestMaster::with_config(cfg, &["rack-a", "rack-a", "rack-b"], 3).await;
    let c = &master.cluster;
    c.create_vol("v1", 3, false, 0, 100).await.unwrap();

    let shutdown = master.cluster.start_schedulers();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let _ = shutdown.send(());

    // The status checker ran at least once and refreshed the caches.
    let vol = c.get_vol("v1").await.unwrap();
    assert!(!vol.data_partitions.response_cache().is_empty());
}

// ============================================================================
// Recovery: in-memory state equals state rebuilt from the store
// ============================================================================

#[tokio::test]
async fn test_state_survives_restart() {
    let master = TestMaster::new(
        &["rack-a", "rack-a", "rack-a", "rack-b", "rack-b", "rack-b"],
        3,
    )
    .await;
    let c = &master.cluster;
    c.create_vol("v1", 3, false, 0, 100).await.unwrap();

    // Leader churn with no operations must not change anything.
    master.partition.step_down();
    master.partition.become_leader();

    // A new master over the same store resumes the identical view.
    let recovered = Cluster::open(
        test_config(),
        master.store.clone(),
        Arc::new(SoloPartition::new(2)),
    )
    .await
    .unwrap();

    assert_eq!(recovered.vol_count().await, 1);
    assert_eq!(recovered.data_node_count(), c.data_node_count());
    assert_eq!(recovered.meta_node_count(), c.meta_node_count());

    let vol = c.get_vol("v1").await.unwrap();
    let recovered_vol = recovered.get_vol("v1").await.unwrap();
    assert_eq!(recovered_vol.id, vol.id);
    assert_eq!(recovered_vol.dp_replica_count, vol.dp_replica_count);

    let ids: Vec<_> = vol.data_partitions.partitions().iter().map(|p| p.id).collect();
    let recovered_ids: Vec<_> = recovered_vol
        .data_partitions
        .partitions()
        .iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(ids, recovered_ids);

    for dp in vol.data_partitions.partitions() {
        let twin = recovered_vol.data_partitions.get(dp.id).unwrap();
        assert_eq!(twin.hosts(), dp.hosts());
        assert_eq!(twin.peers(), dp.peers());
    }

    let mp_ids: Vec<_> = vol.meta_partitions().iter().map(|p| p.id).collect();
    let recovered_mp_ids: Vec<_> = recovered_vol.meta_partitions().iter().map(|p| p.id).collect();
    assert_eq!(mp_ids, recovered_mp_ids);

    // Replica telemetry is runtime state: recovered nodes only become
    // placement candidates again after reporting in.
    let resp = bedrock::task::TaskResponse {
        status: bedrock::task::TaskStatus::Success,
        message: String::new(),
        partition_id: 0,
        total: common::NODE_CAPACITY,
        used: 0,
        max_inode_id: 0,
        partition_reports: Vec::new(),
    };
    for mock in &master.data_nodes {
        recovered
            .data_node(&mock.addr)
            .unwrap()
            .health
            .process_heartbeat(&resp);
    }

    // Fresh ids continue above everything already allocated.
    let next = recovered.create_data_partition("v1").await.unwrap();
    assert!(ids.iter().all(|&id| next.id > id));
}

// ============================================================================
// Volume deletion gc
// ============================================================================

#[tokio::test]
async fn test_vol_deletion_gc() {
    let master = TestMaster::new(
        &["rack-a", "rack-a", "rack-a", "rack-b", "rack-b", "rack-b"],
        3,
    )
    .await;
    let c = &master.cluster;
    c.create_vol("v1", 3, false, 0, 100).await.unwrap();
    c.mark_delete_vol("v1").await.unwrap();

    // One reconciler pass tears everything down.
    c.check_vol_status().await;

    assert!(c.get_vol("v1").await.is_err());
    assert!(master.store.scan_prefix("vol/").unwrap().is_empty());
    assert!(master.store.scan_prefix("dp/").unwrap().is_empty());
    assert!(master.store.scan_prefix("mp/").unwrap().is_empty());
}

// ============================================================================
// Disk recovery progress
// ============================================================================

#[tokio::test]
async fn test_disk_recovery_progress() {
    let master = TestMaster::new(
        &["rack-a", "rack-a", "rack-a", "rack-b", "rack-b", "rack-b"],
        3,
    )
    .await;
    let c = &master.cluster;
    let vol = c.create_vol("v1", 3, false, 0, 100).await.unwrap();

    let dp = vol.data_partitions.partitions()[0].clone();
    let offline = dp.hosts()[0].clone();
    c.decommission_data_partition(&offline, &dp, "test")
        .await
        .unwrap();
    assert!(dp.is_recover());
    assert_eq!(c.bad_partition_ids(&offline, "").len(), 1);

    // The replacement replica acked during decommission, so the next
    // recovery sweep clears the partition.
    c.check_disk_recovery_progress().await;

    assert!(!dp.is_recover());
    assert_eq!(dp.status(), PartitionStatus::ReadWrite);
    assert!(c.bad_partition_ids(&offline, "").is_empty());
}
