//! Monotonic, persistent id allocation.
//!
//! Three counters: common (nodes, volumes, node sets), data-partition and
//! meta-partition ids. Every allocation is persisted through the consensus
//! log before it is handed out; on proposal failure the in-memory counter
//! rolls back so the id can be re-issued. When another leader's allocation
//! applies locally, the counter advances to the applied watermark.

use crate::error::Result;
use crate::fsm::{self, CommandOp, RaftCommand};
use crate::raft::RaftPartition;
use crate::store::MetaStore;
use parking_lot::Mutex;

/// Cluster-wide id allocator.
#[derive(Default)]
pub struct IdAllocator {
    common: Mutex<u64>,
    data_partition: Mutex<u64>,
    meta_partition: Mutex<u64>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recover counters from the store after startup or leader change.
    pub fn restore(&self, store: &dyn MetaStore) -> Result<()> {
        *self.common.lock() = read_counter(store, fsm::KEY_COMMON_ID)?;
        *self.data_partition.lock() = read_counter(store, fsm::KEY_DATA_PARTITION_ID)?;
        *self.meta_partition.lock() = read_counter(store, fsm::KEY_META_PARTITION_ID)?;
        Ok(())
    }

    /// Allocate an id for a node, volume or node set.
    pub fn allocate_common_id(&self, partition: &dyn RaftPartition) -> Result<u64> {
        allocate(
            &self.common,
            partition,
            CommandOp::AllocCommonId,
            fsm::KEY_COMMON_ID,
        )
    }

    /// Allocate a data partition id.
    pub fn allocate_data_partition_id(&self, partition: &dyn RaftPartition) -> Result<u64> {
        allocate(
            &self.data_partition,
            partition,
            CommandOp::AllocDataPartitionId,
            fsm::KEY_DATA_PARTITION_ID,
        )
    }

    /// Allocate a meta partition id.
    pub fn allocate_meta_partition_id(&self, partition: &dyn RaftPartition) -> Result<u64> {
        allocate(
            &self.meta_partition,
            partition,
            CommandOp::AllocMetaPartitionId,
            fsm::KEY_META_PARTITION_ID,
        )
    }

    /// Advance the common counter to at least `applied`.
    pub fn advance_common(&self, applied: u64) {
        advance(&self.common, applied);
    }

    /// Advance the data-partition counter to at least `applied`.
    pub fn advance_data_partition(&self, applied: u64) {
        advance(&self.data_partition, applied);
    }

    /// Advance the meta-partition counter to at least `applied`.
    pub fn advance_meta_partition(&self, applied: u64) {
        advance(&self.meta_partition, applied);
    }

    /// Current common watermark, for views and tests.
    pub fn common_watermark(&self) -> u64 {
        *self.common.lock()
    }
}

fn allocate(
    counter: &Mutex<u64>,
    partition: &dyn RaftPartition,
    op: CommandOp,
    key: &str,
) -> Result<u64> {
    // The lock is not held across the proposal: apply re-enters through
    // the advance path and would deadlock otherwise.
    let next = {
        let mut guard = counter.lock();
        *guard += 1;
        *guard
    };
    let cmd = RaftCommand::new(op, key, next.to_string().into_bytes());
    match partition.submit(&cmd.encode()?) {
        Ok(()) => Ok(next),
        Err(e) => {
            let mut guard = counter.lock();
            if *guard == next {
                *guard -= 1;
            }
            Err(e)
        }
    }
}

fn advance(counter: &Mutex<u64>, applied: u64) {
    let mut guard = counter.lock();
    if applied > *guard {
        *guard = applied;
    }
}

fn read_counter(store: &dyn MetaStore, key: &str) -> Result<u64> {
    match store.get(key)? {
        Some(bytes) => Ok(String::from_utf8_lossy(&bytes).parse().unwrap_or(0)),
        None => Ok(0),
    }
}
