//! Engine tuning and host inventory configuration

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a single inventory host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Host identifier, shard digit is read from its first `-` segment
    pub host: String,
    /// Hostname used for explicit destinations and reported in results
    pub hostname: String,
    /// Attributes matched by filter expressions
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Engine timing and capacity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Agent call attempts when a request does not name one
    #[serde(default = "default_retry")]
    pub default_retry: u32,
    /// Seconds between agent call attempts when a request does not name one
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    /// Seconds a sent task waits for its completion report
    #[serde(default = "default_watchdog")]
    pub task_watchdog_secs: u64,
    /// Seconds a started transfer waits for all of its tasks
    #[serde(default = "default_watchdog")]
    pub transfer_watchdog_secs: u64,
    /// Seconds a retired entity stays queryable in the cache
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    /// Maximum hosts per transfer bucket
    #[serde(default = "default_bucket_capacity")]
    pub bucket_capacity: usize,
    /// Number of shards hosts are partitioned into
    #[serde(default = "default_shard_count")]
    pub shard_count: u8,
    /// Position of the shard digit inside the first host id segment
    #[serde(default = "default_shard_offset")]
    pub shard_offset: usize,
    /// Seconds a caller waits for an aggregated transaction view
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
    /// Capacity of the engine event broadcast channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_retry() -> u32 {
    3
}

fn default_timeout() -> u64 {
    3600
}

fn default_watchdog() -> u64 {
    600
}

fn default_retention() -> u64 {
    3600
}

fn default_bucket_capacity() -> usize {
    128
}

fn default_shard_count() -> u8 {
    16
}

fn default_shard_offset() -> usize {
    7
}

fn default_query_timeout() -> u64 {
    30
}

fn default_event_channel_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retry: default_retry(),
            default_timeout_secs: default_timeout(),
            task_watchdog_secs: default_watchdog(),
            transfer_watchdog_secs: default_watchdog(),
            retention_secs: default_retention(),
            bucket_capacity: default_bucket_capacity(),
            shard_count: default_shard_count(),
            shard_offset: default_shard_offset(),
            query_timeout_secs: default_query_timeout(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn task_watchdog(&self) -> Duration {
        Duration::from_secs(self.task_watchdog_secs)
    }

    #[must_use]
    pub fn transfer_watchdog(&self) -> Duration {
        Duration::from_secs(self.transfer_watchdog_secs)
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.default_retry, 3);
        assert_eq!(config.default_timeout_secs, 3600);
        assert_eq!(config.task_watchdog(), Duration::from_secs(600));
        assert_eq!(config.retention(), Duration::from_secs(3600));
        assert_eq!(config.bucket_capacity, 128);
        assert_eq!(config.shard_count, 16);
        assert_eq!(config.shard_offset, 7);
    }
}
