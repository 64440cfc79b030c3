//! Configuration module for the bedrock master.

use crate::error::{MasterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Main configuration for a master process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Cluster identifier, tagged onto every operator-visible message.
    pub cluster_name: String,
    /// Maximum number of nodes a node set accepts.
    pub node_set_capacity: usize,
    /// Number of data partitions created with a new volume.
    pub init_data_partition_count: usize,
    /// Heartbeat fan-out period; a node is live while its last report is
    /// younger than twice this.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Period of the data/meta partition status checkers.
    #[serde(with = "humantime_serde")]
    pub check_partition_interval: Duration,
    /// Period of the load-verification scheduler.
    #[serde(with = "humantime_serde")]
    pub load_partition_interval: Duration,
    /// Period of the release pass that frees loaded extent maps.
    #[serde(with = "humantime_serde")]
    pub free_partition_interval: Duration,
    /// Upper bound of partitions released per pass.
    pub partitions_to_free_per_pass: usize,
    /// How long a loaded partition stays in memory before release.
    #[serde(with = "humantime_serde")]
    pub seconds_to_free_after_load: Duration,
    /// Period of the automatic data-partition creation check.
    #[serde(with = "humantime_serde")]
    pub auto_create_interval: Duration,
    /// Grace period after startup/leader change before auto-creation runs.
    #[serde(with = "humantime_serde")]
    pub auto_create_grace: Duration,
    /// Consensus log retention passed down to the replicated log.
    pub retain_logs: u64,
    /// Static map of consensus leader id to advertised master address.
    pub addr_database: HashMap<u64, String>,
    /// Round-trip bound for one synchronous admin task.
    #[serde(with = "humantime_serde")]
    pub task_timeout: Duration,
    /// Dial bound for remote node connections.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Idle connections retained per remote node.
    pub conn_pool_capacity: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            cluster_name: Uuid::new_v4().to_string(),
            node_set_capacity: 18,
            init_data_partition_count: 10,
            heartbeat_interval: Duration::from_secs(60),
            check_partition_interval: Duration::from_secs(60),
            load_partition_interval: Duration::from_secs(1),
            free_partition_interval: Duration::from_secs(60),
            partitions_to_free_per_pass: 50,
            seconds_to_free_after_load: Duration::from_secs(300),
            auto_create_interval: Duration::from_secs(120),
            auto_create_grace: Duration::from_secs(120),
            retain_logs: 20_000,
            addr_database: HashMap::new(),
            task_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            conn_pool_capacity: 8,
        }
    }
}

impl MasterConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MasterError::Config(format!("failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| MasterError::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(MasterError::Config("cluster_name must not be empty".into()));
        }
        if self.node_set_capacity == 0 {
            return Err(MasterError::Config(
                "node_set_capacity must be non-zero".into(),
            ));
        }
        if self.init_data_partition_count == 0 {
            return Err(MasterError::Config(
                "init_data_partition_count must be non-zero".into(),
            ));
        }
        if self.heartbeat_interval < Duration::from_millis(10) {
            return Err(MasterError::Config(
                "heartbeat_interval too small".into(),
            ));
        }
        Ok(())
    }

    /// Configuration with short intervals, suitable for local runs and tests.
    pub fn development() -> Self {
        Self {
            cluster_name: "bedrock-dev".to_string(),
            node_set_capacity: 18,
            heartbeat_interval: Duration::from_millis(500),
            check_partition_interval: Duration::from_millis(500),
            load_partition_interval: Duration::from_millis(200),
            free_partition_interval: Duration::from_millis(500),
            seconds_to_free_after_load: Duration::from_millis(500),
            auto_create_interval: Duration::from_millis(500),
            auto_create_grace: Duration::from_millis(0),
            task_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }
}

/// Serde helper for `Duration` using a humantime-style format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = MasterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.init_data_partition_count, 10);
    }

    #[test]
    fn test_development_config() {
        let config = MasterConfig::development();
        assert!(config.validate().is_ok());
        assert!(config.heartbeat_interval < Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = MasterConfig {
            node_set_capacity: 0,
            ..MasterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_roundtrip() {
        let config = MasterConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: MasterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.heartbeat_interval, config.heartbeat_interval);
        assert_eq!(back.auto_create_interval, config.auto_create_interval);
    }
}
