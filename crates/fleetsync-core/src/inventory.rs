//! Host inventory collaborator and shard assignment

use async_trait::async_trait;
use fleetsync_api::requests::{DstEntry, HostEntry};
use tracing::debug;

use crate::config::HostConfig;
use crate::error::CoreError;

/// Resolves destinations into concrete hosts
#[async_trait]
pub trait HostInventory: Send + Sync {
    /// Hosts matching a filter expression
    async fn query_by_filter(&self, expr: &str) -> Result<Vec<HostEntry>, CoreError>;

    /// Hosts named by an explicit destination list
    async fn query_by_dst(&self, entries: &[DstEntry]) -> Result<Vec<HostEntry>, CoreError>;
}

/// Shard of `host`: the hex digit at `offset` of its first `-` segment, modulo `count`
///
/// # Errors
/// Returns `CoreError::Validation` if the host id has no hex digit there.
pub fn shard_of(host: &str, offset: usize, count: u8) -> Result<u8, CoreError> {
    let segment = host.split('-').next().unwrap_or_default();
    let digit = segment
        .chars()
        .nth(offset)
        .and_then(|c| c.to_digit(16))
        .ok_or_else(|| {
            CoreError::Validation(format!(
                "host id {host} has no hex digit at offset {offset}"
            ))
        })?;

    #[allow(clippy::cast_possible_truncation)]
    Ok((digit % u32::from(count.max(1))) as u8)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Clause {
    Eq(String, String),
    Ne(String, String),
    Prefix(String, String),
}

/// Parsed filter expression: `key=value`, `key!=value` and `key~prefix`
/// clauses joined by `and`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostFilter {
    clauses: Vec<Clause>,
}

impl HostFilter {
    /// Parse a filter expression; the empty expression matches every host
    ///
    /// # Errors
    /// Returns `CoreError::Validation` on a clause without an operator or key.
    pub fn parse(expr: &str) -> Result<Self, CoreError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(Self::default());
        }

        let clauses = expr
            .split(" and ")
            .map(|raw| {
                let raw = raw.trim();
                let clause = if let Some((key, value)) = raw.split_once("!=") {
                    Clause::Ne(key.trim().to_string(), value.trim().to_string())
                } else if let Some((key, value)) = raw.split_once('=') {
                    Clause::Eq(key.trim().to_string(), value.trim().to_string())
                } else if let Some((key, value)) = raw.split_once('~') {
                    Clause::Prefix(key.trim().to_string(), value.trim().to_string())
                } else {
                    return Err(CoreError::Validation(format!(
                        "invalid filter clause: {raw}"
                    )));
                };

                match &clause {
                    Clause::Eq(key, _) | Clause::Ne(key, _) | Clause::Prefix(key, _)
                        if key.is_empty() =>
                    {
                        Err(CoreError::Validation(format!(
                            "invalid filter clause: {raw}"
                        )))
                    }
                    _ => Ok(clause),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { clauses })
    }

    /// Whether `host` satisfies every clause
    #[must_use]
    pub fn matches(&self, host: &HostConfig) -> bool {
        let field = |key: &str| -> Option<&str> {
            match key {
                "host" => Some(host.host.as_str()),
                "hostname" => Some(host.hostname.as_str()),
                _ => host.attributes.get(key).map(String::as_str),
            }
        };

        self.clauses.iter().all(|clause| match clause {
            Clause::Eq(key, value) => field(key) == Some(value.as_str()),
            Clause::Ne(key, value) => field(key) != Some(value.as_str()),
            Clause::Prefix(key, prefix) => field(key).is_some_and(|v| v.starts_with(prefix.as_str())),
        })
    }
}

/// Inventory over a fixed host list
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    hosts: Vec<HostConfig>,
}

impl StaticInventory {
    #[must_use]
    pub fn new(hosts: Vec<HostConfig>) -> Self {
        Self { hosts }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    fn by_hostname(&self, hostname: &str) -> Result<&HostConfig, CoreError> {
        let wanted = hostname.trim();
        self.hosts
            .iter()
            .find(|h| h.hostname.eq_ignore_ascii_case(wanted))
            .ok_or_else(|| CoreError::Validation(format!("unknown hostname: {wanted}")))
    }
}

fn entry(host: &HostConfig) -> HostEntry {
    HostEntry {
        host: host.host.clone(),
        hostname: host.hostname.clone(),
        context: serde_json::Map::new(),
    }
}

#[async_trait]
impl HostInventory for StaticInventory {
    async fn query_by_filter(&self, expr: &str) -> Result<Vec<HostEntry>, CoreError> {
        let filter = HostFilter::parse(expr)?;
        let hosts: Vec<HostEntry> = self
            .hosts
            .iter()
            .filter(|h| filter.matches(h))
            .map(entry)
            .collect();
        debug!(filter = expr, matched = hosts.len(), "inventory filter evaluated");
        Ok(hosts)
    }

    async fn query_by_dst(&self, entries: &[DstEntry]) -> Result<Vec<HostEntry>, CoreError> {
        let mut hosts = Vec::new();
        for dst in entries {
            match dst {
                DstEntry::Host(hostname) => hosts.push(entry(self.by_hostname(hostname)?)),
                DstEntry::Group { hostname, context } => {
                    for name in hostname {
                        let mut host = entry(self.by_hostname(name)?);
                        host.context = context.clone();
                        hosts.push(host);
                    }
                }
            }
        }
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    fn host(id: &str, name: &str, role: &str) -> HostConfig {
        HostConfig {
            host: id.to_string(),
            hostname: name.to_string(),
            attributes: BTreeMap::from([("role".to_string(), role.to_string())]),
        }
    }

    fn inventory() -> StaticInventory {
        StaticInventory::new(vec![
            host("0000000a-1111", "edge-01", "edge"),
            host("0000000b-2222", "edge-02", "edge"),
            host("0000000c-3333", "core-01", "core"),
        ])
    }

    #[test]
    fn test_shard_reads_eighth_hex_digit() {
        assert_eq!(shard_of("0000000a-1111", 7, 16).unwrap(), 10);
        assert_eq!(shard_of("1234567f-0000-0000", 7, 16).unwrap(), 15);
        assert_eq!(shard_of("1234567f-0000", 7, 4).unwrap(), 3);
        assert!(shard_of("short-id", 7, 16).is_err());
        assert!(shard_of("abcdefgz-1", 7, 16).is_err());
    }

    #[tokio::test]
    async fn test_filter_expressions() {
        let inventory = inventory();
        assert_eq!(inventory.query_by_filter("").await.unwrap().len(), 3);
        assert_eq!(inventory.query_by_filter("role=edge").await.unwrap().len(), 2);
        assert_eq!(
            inventory
                .query_by_filter("role=edge and hostname!=edge-01")
                .await
                .unwrap()[0]
                .hostname,
            "edge-02"
        );
        assert_eq!(inventory.query_by_filter("hostname~core").await.unwrap().len(), 1);
        assert!(inventory.query_by_filter("role").await.is_err());
    }

    #[tokio::test]
    async fn test_explicit_destinations_merge_context() {
        let inventory = inventory();
        let entries: Vec<DstEntry> = serde_json::from_value(json!([
            " EDGE-01 ",
            {"hostname": ["edge-02", "core-01"], "context": {"port": 8080}}
        ]))
        .unwrap();

        let hosts = inventory.query_by_dst(&entries).await.unwrap();
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[0].host, "0000000a-1111");
        assert!(hosts[0].context.is_empty());
        assert_eq!(hosts[2].context["port"], json!(8080));

        let unknown = vec![DstEntry::Host("nope".to_string())];
        assert!(inventory.query_by_dst(&unknown).await.is_err());
    }
}
