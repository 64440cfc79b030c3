//! # bedrock
//!
//! The cluster master of a distributed, replicated block-and-metadata file
//! system. The master is the single logical authority for the control
//! plane: it tracks the membership and liveness of data and meta nodes,
//! owns the placement and replica state of every partition, orchestrates
//! creation, healing and decommissioning, and persists all of it through a
//! replicated state machine so that any elected leader can resume the
//! cluster's view.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Master (leader)                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Lifecycle: create vol / partition, decommission, split      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Reconcilers: heartbeat | status | auto-create | recovery    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Model: volumes → partitions → replicas; topology; registry  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  FSM gateway → consensus log → key/value store               │
//! └──────────────┬──────────────────────────────────────────────┘
//!                │ admin tasks (binary frames)
//!     ┌──────────┴─────────┬────────────────┐
//!   data nodes          data nodes       meta nodes
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use bedrock::cluster::Cluster;
//! use bedrock::config::MasterConfig;
//! use bedrock::raft::SoloPartition;
//! use bedrock::store::RocksStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> bedrock::Result<()> {
//!     let store = Arc::new(RocksStore::open("/var/lib/bedrock/meta")?);
//!     let partition = Arc::new(SoloPartition::new(1));
//!     let cluster = Cluster::open(MasterConfig::default(), store, partition).await?;
//!     let _shutdown = cluster.start_schedulers();
//!
//!     cluster.add_data_node("10.0.0.1:17310", "rack-a").await?;
//!     cluster.add_meta_node("10.0.0.1:17210").await?;
//!     cluster.create_vol("vol1", 3, false, 0, 100).await?;
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod fsm;
pub mod idalloc;
pub mod raft;
pub mod store;
pub mod task;
pub mod topology;
pub mod types;

pub use cluster::Cluster;
pub use config::MasterConfig;
pub use error::{MasterError, Result};

/// Current version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
