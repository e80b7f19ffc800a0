//! HTTP-backed message bus and notifier
//!
//! Tunnel and sync topics map onto the daemon routes of the addressed
//! process; agent commands are posted to the configured agent URL.

use std::time::Duration;

use async_trait::async_trait;
use fleetsync_api::requests::{
    TransactionPutRequest, TransferGetRequest, TransferPostRequest, TransferPutRequest,
};
use fleetsync_client::{ClientError, HttpClient};
use fleetsync_core::bus::topic;
use fleetsync_core::notify::Notifier;
use fleetsync_core::{BusError, CoreError, Endpoint, MessageBus};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;

fn bus_error(e: ClientError) -> BusError {
    match e {
        ClientError::Api { status, message } => BusError::Remote {
            code: status,
            message,
        },
        e if e.is_timeout() => BusError::Timeout,
        ClientError::Json(e) => BusError::Codec(e.to_string()),
        e => BusError::Unreachable(e.to_string()),
    }
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, BusError> {
    serde_json::from_value(payload).map_err(|e| BusError::Codec(e.to_string()))
}

fn encode<T: Serialize>(reply: Result<T, ClientError>) -> Result<Value, BusError> {
    let reply = reply.map_err(bus_error)?;
    serde_json::to_value(reply).map_err(|e| BusError::Codec(e.to_string()))
}

/// Build the shared `reqwest` client with the configured request timeout
///
/// # Errors
/// Returns an error if the TLS backend cannot be initialized.
pub fn http_client(config: &Config) -> eyre::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.bus.request_timeout_secs))
        .build()?)
}

/// [`MessageBus`] over the daemon's HTTP routes
pub struct HttpBus {
    tunnels: Vec<HttpClient>,
    sync: HttpClient,
    /// Client for absolute agent URLs
    raw: HttpClient,
    agent_url: String,
}

impl HttpBus {
    /// # Errors
    /// Returns an error if a configured URL is invalid.
    pub fn new(config: &Config, client: &reqwest::Client) -> eyre::Result<Self> {
        let tunnels = config
            .tunnel_urls()
            .iter()
            .map(|url| HttpClient::with_client(url, client.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            tunnels,
            sync: HttpClient::with_client(config.sync_url(), client.clone())?,
            raw: HttpClient::with_client(&config.daemon.public_url, client.clone())?,
            agent_url: config.bus.agent_url.clone(),
        })
    }

    fn tunnel(&self, shard: u8) -> Option<&HttpClient> {
        if self.tunnels.is_empty() {
            return None;
        }
        self.tunnels.get(usize::from(shard) % self.tunnels.len())
    }

    fn agent_url(&self, host: &str) -> String {
        self.agent_url.replace("{host}", host)
    }
}

#[async_trait]
impl MessageBus for HttpBus {
    async fn call(
        &self,
        endpoint: &Endpoint,
        topic: &str,
        payload: Value,
    ) -> Result<Value, BusError> {
        let no_route = || BusError::NoRoute {
            endpoint: endpoint.to_string(),
            topic: topic.to_string(),
        };
        debug!(endpoint = %endpoint, topic, "bus call");

        match (endpoint, topic) {
            (Endpoint::Tunnel { shard }, topic::TRANSFER_POST) => {
                let client = self.tunnel(*shard).ok_or_else(no_route)?;
                let request: TransferPostRequest = decode(payload)?;
                encode(client.create_transfer(&request).await)
            }
            (Endpoint::Tunnel { shard }, topic::TRANSFER_GET) => {
                let client = self.tunnel(*shard).ok_or_else(no_route)?;
                let request: TransferGetRequest = decode(payload)?;
                encode(client.get_transfer(&request.transfer_id).await)
            }
            (Endpoint::Tunnel { shard }, topic::TRANSFER_PUT) => {
                let client = self.tunnel(*shard).ok_or_else(no_route)?;
                let report: TransferPutRequest = decode(payload)?;
                encode(client.report_task(&report).await)
            }
            (Endpoint::Sync, topic::TRANSACTION_PUT) => {
                let request: TransactionPutRequest = decode(payload)?;
                encode(
                    self.sync
                        .end_transfer(&request.transaction_id, &request.transfer_id)
                        .await,
                )
            }
            (Endpoint::Agent { host }, topic::TASK_COMMAND) => {
                let url = self.agent_url(host);
                self.raw.send_json(&url, &payload).await.map_err(bus_error)
            }
            _ => Err(no_route()),
        }
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<(), BusError> {
        debug!(topic, bytes = payload.to_string().len(), "published without subscribers");
        Ok(())
    }
}

/// [`Notifier`] posting to the caller's notify URL
pub struct HttpNotifier {
    client: HttpClient,
}

impl HttpNotifier {
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, url: &str, body: &Value) -> Result<(), CoreError> {
        self.client
            .send_json(url, body)
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!(url, error = %e, "notification failed");
                CoreError::Notify(e.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus(tunnels: &[&str]) -> HttpBus {
        let mut config = Config::default();
        config.bus.tunnel_urls = tunnels.iter().map(ToString::to_string).collect();
        HttpBus::new(&config, &reqwest::Client::new()).unwrap()
    }

    #[test]
    fn test_shards_wrap_around_tunnels() {
        let bus = bus(&["http://tunnel-0:9014", "http://tunnel-1:9014"]);
        let host = |shard| bus.tunnel(shard).unwrap().base_url().host_str().unwrap().to_string();
        assert_eq!(host(0), "tunnel-0");
        assert_eq!(host(3), "tunnel-1");
        assert_eq!(host(14), "tunnel-0");
    }

    #[test]
    fn test_agent_url_template() {
        let bus = bus(&[]);
        assert_eq!(
            bus.agent_url("0000000a-0001"),
            "http://0000000a-0001:9100/agent/task"
        );
    }

    #[test]
    fn test_api_errors_keep_their_status() {
        let error = bus_error(ClientError::Api {
            status: 503,
            message: "busy".to_string(),
        });
        assert!(error.is_retryable());
        assert!(matches!(error, BusError::Remote { code: 503, .. }));

        let error = bus_error(ClientError::Api {
            status: 404,
            message: "no handler matched".to_string(),
        });
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_unknown_topic_has_no_route() {
        let bus = bus(&[]);
        let result = bus.call(&Endpoint::Sync, topic::TASK_COMMAND, Value::Null).await;
        assert!(matches!(result, Err(BusError::NoRoute { .. })));
    }
}
