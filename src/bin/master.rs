//! bedrock master daemon.
//!
//! Usage: `bedrock-master [config.json] [store-dir]`

use bedrock::cluster::Cluster;
use bedrock::config::MasterConfig;
use bedrock::raft::SoloPartition;
use bedrock::store::RocksStore;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> bedrock::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => MasterConfig::from_file(Path::new(&path))?,
        None => MasterConfig::default(),
    };
    let store_dir = args.next().unwrap_or_else(|| "./bedrock-meta".to_string());

    let store = Arc::new(RocksStore::open(&store_dir)?);
    let partition = Arc::new(SoloPartition::new(1));
    let cluster = Cluster::open(config, store, partition).await?;
    let shutdown = cluster.start_schedulers();

    info!(cluster = %cluster.name, version = bedrock::VERSION, "master started");
    tokio::signal::ctrl_c().await?;
    let _ = shutdown.send(());
    info!("master stopped");
    Ok(())
}
