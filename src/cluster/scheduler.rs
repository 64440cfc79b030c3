//! Leader-only reconciliation loops.
//!
//! Each loop is an independent tokio task with its own timer: it samples
//! `is_leader()` on every iteration, does one best-effort pass, logs
//! per-entity errors and never aborts. All loops select on a broadcast
//! shutdown signal and are idempotent under repeated execution across
//! leader changes.

use super::Cluster;
use crate::types::{PartitionStatus, VolumeStatus};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

impl Cluster {
    /// Spawn every reconciler loop. The returned sender stops them all.
    pub fn start_schedulers(self: &Arc<Self>) -> broadcast::Sender<()> {
        let (shutdown, _) = broadcast::channel(1);
        let cfg = self.config().clone();

        self.spawn_loop(
            "update_stat_info",
            cfg.heartbeat_interval,
            Duration::ZERO,
            shutdown.subscribe(),
            |c| async move { c.update_stat_info() },
        );
        self.spawn_loop(
            "auto_data_partition_creation",
            cfg.auto_create_interval,
            cfg.auto_create_grace,
            shutdown.subscribe(),
            |c| async move { c.check_auto_data_partition_creation().await },
        );
        self.spawn_loop(
            "check_data_partitions",
            cfg.check_partition_interval,
            Duration::ZERO,
            shutdown.subscribe(),
            |c| async move { c.check_data_partitions().await },
        );
        self.spawn_loop(
            "load_data_partitions",
            cfg.load_partition_interval,
            Duration::ZERO,
            shutdown.subscribe(),
            |c| async move { c.load_data_partitions().await },
        );
        self.spawn_loop(
            "release_data_partitions",
            cfg.free_partition_interval,
            Duration::ZERO,
            shutdown.subscribe(),
            |c| async move { c.release_data_partitions_after_load().await },
        );
        self.spawn_loop(
            "data_node_heartbeat",
            cfg.heartbeat_interval,
            Duration::ZERO,
            shutdown.subscribe(),
            |c| async move {
                c.check_leader_addr();
                c.check_data_node_heartbeat();
            },
        );
        self.spawn_loop(
            "meta_node_heartbeat",
            cfg.heartbeat_interval,
            Duration::ZERO,
            shutdown.subscribe(),
            |c| async move { c.check_meta_node_heartbeat() },
        );
        self.spawn_loop(
            "check_meta_partitions",
            cfg.check_partition_interval,
            Duration::ZERO,
            shutdown.subscribe(),
            |c| async move { c.check_meta_partitions().await },
        );
        self.spawn_loop(
            "check_vol_status",
            cfg.check_partition_interval,
            Duration::ZERO,
            shutdown.subscribe(),
            |c| async move { c.check_vol_status().await },
        );
        self.spawn_loop(
            "disk_recovery_progress",
            cfg.check_partition_interval,
            Duration::ZERO,
            shutdown.subscribe(),
            |c| async move { c.check_disk_recovery_progress().await },
        );
        self.spawn_loop(
            "check_load_meta_partitions",
            cfg.check_partition_interval,
            Duration::ZERO,
            shutdown.subscribe(),
            |c| async move { c.check_load_meta_partitions().await },
        );

        shutdown
    }

    fn spawn_loop<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        startup_grace: Duration,
        mut shutdown: broadcast::Receiver<()>,
        body: F,
    ) where
        F: Fn(Arc<Cluster>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let cluster = self.clone();
        tokio::spawn(async move {
            if !startup_grace.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(startup_grace) => {}
                    _ = shutdown.recv() => return,
                }
            }
            let mut timer = interval(period.max(Duration::from_millis(1)));
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if cluster.is_leader() {
                            body(cluster.clone()).await;
                        }
                    }
                    _ = shutdown.recv() => {
                        info!(task = name, "reconciler stopping");
                        break;
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Loop bodies
    // ------------------------------------------------------------------

    /// Top up volumes whose writable data partition count fell below the
    /// initial partition count.
    pub async fn check_auto_data_partition_creation(self: &Arc<Self>) {
        if !self.should_auto_allocate() {
            return;
        }
        let target = self.config().init_data_partition_count;
        let interval = self.config().heartbeat_interval;
        for vol in self.copy_vols().await {
            if vol.status() != VolumeStatus::Normal {
                continue;
            }
            let read_writes = vol.check_data_partitions(interval);
            if read_writes >= target {
                continue;
            }
            info!(
                vol = %vol.name,
                read_writes,
                target,
                "auto-creating data partitions"
            );
            for _ in read_writes..target {
                if let Err(e) = self.create_data_partition(&vol.name).await {
                    warn!(vol = %vol.name, error = %e, "auto partition creation failed");
                    break;
                }
            }
        }
    }

    /// Recompute every data partition's status and refresh the volumes'
    /// read/write subsets.
    pub async fn check_data_partitions(self: &Arc<Self>) {
        let interval = self.config().heartbeat_interval;
        for vol in self.all_vols().await {
            let read_writes = vol.check_data_partitions(interval);
            debug!(vol = %vol.name, read_writes, "data partitions checked");
        }
    }

    /// Send load-verification tasks to data partitions due for one.
    pub async fn load_data_partitions(self: &Arc<Self>) {
        let cadence = self.config().check_partition_interval;
        for vol in self.all_vols().await {
            for dp in vol
                .data_partitions
                .due_for_load(cadence, self.config().partitions_to_free_per_pass)
            {
                let tasks = dp.hosts().iter().map(|host| dp.load_task(host)).collect();
                self.add_data_node_tasks(tasks);
                dp.mark_loaded();
            }
        }
    }

    /// Release extent maps loaded during verification, bounded per pass.
    pub async fn release_data_partitions_after_load(self: &Arc<Self>) {
        let max = self.config().partitions_to_free_per_pass;
        let after = self.config().seconds_to_free_after_load;
        for vol in self.copy_vols().await {
            let released = vol.release_data_partitions(max, after);
            if released > 0 {
                debug!(vol = %vol.name, released, "released loaded data partitions");
            }
        }
    }

    /// Fan out heartbeat tasks to every data node.
    pub fn check_data_node_heartbeat(&self) {
        let master_addr = self.leader_addr();
        let interval = self.config().heartbeat_interval;
        let mut tasks = Vec::new();
        for node in self.data_node_list() {
            node.health.check_liveness(interval);
            tasks.push(node.heartbeat_task(&master_addr));
        }
        self.add_data_node_tasks(tasks);
    }

    /// Fan out heartbeat tasks to every meta node.
    pub fn check_meta_node_heartbeat(&self) {
        let master_addr = self.leader_addr();
        let interval = self.config().heartbeat_interval;
        let mut tasks = Vec::new();
        for node in self.meta_node_list() {
            node.health.check_liveness(interval);
            tasks.push(node.heartbeat_task(&master_addr));
        }
        self.add_meta_node_tasks(tasks);
    }

    /// Recompute meta partition statuses and view caches.
    pub async fn check_meta_partitions(self: &Arc<Self>) {
        let interval = self.config().heartbeat_interval;
        for vol in self.all_vols().await {
            vol.check_meta_partitions(interval);
        }
    }

    /// Drive volume state transitions, including deletion gc.
    pub async fn check_vol_status(self: &Arc<Self>) {
        for vol in self.copy_vols().await {
            vol.check_status(self).await;
        }
    }

    /// Advance the bad-partition index as replicas heal; recovered
    /// partitions return to read-write and leave the index.
    pub async fn check_disk_recovery_progress(self: &Arc<Self>) {
        let interval = self.config().heartbeat_interval;
        for (key, ids) in self.bad_partition_entries() {
            let mut remaining = Vec::new();
            for id in ids {
                match self.data_partition_by_id(id).await {
                    Ok(dp) => {
                        if dp.replica_addrs().len() >= dp.replica_count as usize {
                            dp.set_recovering(false);
                            dp.recompute_status(interval);
                            if let Err(e) = self.sync_update_data_partition(&dp) {
                                warn!(partition = id, error = %e, "recovery update failed");
                                dp.set_recovering(true);
                                remaining.push(id);
                                continue;
                            }
                            info!(partition = id, "data partition recovered");
                        } else {
                            remaining.push(id);
                        }
                    }
                    // The partition is gone (volume deleted); drop it.
                    Err(_) => {}
                }
            }
            self.update_bad_partition_entry(&key, remaining);
        }
    }

    /// Verify meta partition replica consistency from load reports.
    pub async fn check_load_meta_partitions(self: &Arc<Self>) {
        let interval = self.config().heartbeat_interval;
        for vol in self.all_vols().await {
            for mp in vol.meta_partitions() {
                let status = mp.recompute_status(interval);
                if status != PartitionStatus::ReadWrite {
                    warn!(
                        vol = %vol.name,
                        partition = mp.id,
                        ?status,
                        "meta partition not fully consistent"
                    );
                }
            }
        }
    }
}
