//! Configuration loading and types

use std::path::{Path, PathBuf};

use fleetsync_core::{EngineConfig, HostConfig};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the fleetsync daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Daemon server settings
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Engine timing and capacity
    #[serde(default)]
    pub engine: EngineConfig,
    /// Where tunnels, the sync side and agents are reached
    #[serde(default)]
    pub bus: BusConfig,
    /// Static host inventory
    #[serde(default)]
    pub host: Vec<HostConfig>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Daemon server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Address and port to bind to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Base URL other parties use to reach this daemon
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            public_url: default_public_url(),
        }
    }
}

/// Message bus routing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Tunnel base URLs; shard `s` goes to entry `s % len`
    #[serde(default)]
    pub tunnel_urls: Vec<String>,
    /// Sync base URL
    #[serde(default)]
    pub sync_url: Option<String>,
    /// Agent command URL, `{host}` is replaced by the host id
    #[serde(default = "default_agent_url")]
    pub agent_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            tunnel_urls: Vec::new(),
            sync_url: None,
            agent_url: default_agent_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:9014".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_public_url() -> String {
    "http://127.0.0.1:9014".to_string()
}

fn default_agent_url() -> String {
    "http://{host}:9100/agent/task".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from default paths or use defaults
    pub fn load_default() -> eyre::Result<Self> {
        if let Ok(path) = std::env::var("FLEETSYNC_CONFIG") {
            return Self::load(&PathBuf::from(path));
        }

        let paths = [
            PathBuf::from("fleetsync.toml"),
            PathBuf::from("/etc/fleetsync/fleetsync.toml"),
            dirs::config_dir()
                .map(|p| p.join("fleetsync/fleetsync.toml"))
                .unwrap_or_default(),
        ];

        for path in paths {
            if path.is_file() {
                return Self::load(&path);
            }
        }

        tracing::warn!("no config file found, using defaults");
        Ok(Config::default())
    }

    /// Tunnel base URLs, falling back to this daemon
    #[must_use]
    pub fn tunnel_urls(&self) -> Vec<String> {
        if self.bus.tunnel_urls.is_empty() {
            vec![self.daemon.public_url.clone()]
        } else {
            self.bus.tunnel_urls.clone()
        }
    }

    /// Sync base URL, falling back to this daemon
    #[must_use]
    pub fn sync_url(&self) -> String {
        self.bus
            .sync_url
            .clone()
            .unwrap_or_else(|| self.daemon.public_url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.daemon.bind, "127.0.0.1:9014");
        assert_eq!(config.daemon.log_format, LogFormat::Pretty);
        assert_eq!(config.engine.bucket_capacity, 128);
        assert_eq!(config.tunnel_urls(), vec!["http://127.0.0.1:9014".to_string()]);
        assert_eq!(config.sync_url(), "http://127.0.0.1:9014");
        assert!(config.host.is_empty());
    }

    #[test]
    fn test_full_file() {
        let config: Config = toml::from_str(
            r#"
            [daemon]
            bind = "0.0.0.0:9014"
            log_format = "json"
            public_url = "http://sync.internal:9014"

            [engine]
            default_retry = 5
            task_watchdog_secs = 120

            [bus]
            tunnel_urls = ["http://tunnel-0:9014", "http://tunnel-1:9014"]
            agent_url = "https://{host}.agents.internal/task"

            [[host]]
            host = "0000000a-0001"
            hostname = "edge-01"

            [[host]]
            host = "0000000b-0002"
            hostname = "edge-02"
            attributes = { role = "edge", site = "ams" }
            "#,
        )
        .unwrap();

        assert_eq!(config.daemon.log_format, LogFormat::Json);
        assert_eq!(config.engine.default_retry, 5);
        assert_eq!(config.engine.task_watchdog_secs, 120);
        assert_eq!(config.engine.shard_count, 16);
        assert_eq!(config.tunnel_urls().len(), 2);
        assert_eq!(config.sync_url(), "http://sync.internal:9014");
        assert_eq!(config.host.len(), 2);
        assert_eq!(config.host[1].attributes["site"], "ams");
    }
}
