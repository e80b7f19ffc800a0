//! Message bus collaborator
//!
//! Point-to-point calls are addressed to an [`Endpoint`] plus a topic; the
//! tunnel endpoints are partitioned by shard and agents by host id.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::CoreError;

/// Topic names used on the bus
pub mod topic {
    /// Create a transfer on a tunnel
    pub const TRANSFER_POST: &str = "transfer.post";
    /// Fetch a transfer view from a tunnel
    pub const TRANSFER_GET: &str = "transfer.get";
    /// Report a task completion to a tunnel
    pub const TRANSFER_PUT: &str = "transfer.put";
    /// Mark a transfer as ended on the sync side
    pub const TRANSACTION_PUT: &str = "transaction.put";
    /// Deliver a command to an agent
    pub const TASK_COMMAND: &str = "task.command";
    /// Published once a transaction has been archived
    pub const TRANSACTION_ARCHIVED: &str = "transaction.archived";
}

/// Addressable participant on the bus
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Tunnel process serving one shard
    Tunnel { shard: u8 },
    /// Sync process owning transactions
    Sync,
    /// Edge agent addressed by host id
    Agent { host: String },
}

impl Endpoint {
    /// Route family used for wildcard registrations
    #[must_use]
    pub fn family(&self) -> &'static str {
        match self {
            Self::Tunnel { .. } => "tunnel",
            Self::Sync => "sync",
            Self::Agent { .. } => "agent",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tunnel { shard } => write!(f, "tunnel/{shard}"),
            Self::Sync => f.write_str("sync"),
            Self::Agent { host } => write!(f, "agent/{host}"),
        }
    }
}

/// Errors that can occur on a bus call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Peer could not be reached
    #[error("connection failed: {0}")]
    Unreachable(String),

    /// Call did not complete in time
    #[error("call timed out")]
    Timeout,

    /// Nothing is registered for the endpoint and topic
    #[error("no route for {topic} on {endpoint}")]
    NoRoute {
        /// Endpoint rendered as a route key
        endpoint: String,
        /// Requested topic
        topic: String,
    },

    /// Peer answered with an error status
    #[error("remote error ({code}): {message}")]
    Remote {
        /// Status code returned by the peer
        code: u16,
        /// Error message returned by the peer
        message: String,
    },

    /// Payload could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),
}

impl BusError {
    /// Whether retrying the same call may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unreachable(_) | Self::Timeout => true,
            Self::Remote { code, .. } => matches!(code, 429 | 502 | 503 | 504),
            Self::NoRoute { .. } | Self::Codec(_) => false,
        }
    }
}

impl From<BusError> for CoreError {
    fn from(e: BusError) -> Self {
        Self::Bus(e.to_string())
    }
}

/// Inter-process RPC and pub/sub fabric
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Call `topic` on `endpoint` and wait for the reply
    async fn call(&self, endpoint: &Endpoint, topic: &str, payload: Value)
    -> Result<Value, BusError>;

    /// Fire-and-forget broadcast on `topic`
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), BusError>;
}

/// Server side of a bus route
#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<Value, BusError>;
}

/// [`BusHandler`] backed by an async closure
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BusError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> BusHandler for FnHandler<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BusError>> + Send,
{
    async fn handle(&self, payload: Value) -> Result<Value, BusError> {
        (self.f)(payload).await
    }
}

/// In-process bus routing calls to registered handlers
///
/// A route key is either an exact endpoint (`tunnel/3`, `agent/<host>`) or a
/// family wildcard (`tunnel/*`, `agent/*`). Exact routes win.
#[derive(Default)]
pub struct LocalBus {
    routes: RwLock<HashMap<(String, String), Arc<dyn BusHandler>>>,
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn BusHandler>>>>,
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `topic` on the endpoints matching `route`
    pub async fn register(&self, route: &str, topic: &str, handler: Arc<dyn BusHandler>) {
        debug!(route, topic, "bus route registered");
        self.routes
            .write()
            .await
            .insert((route.to_string(), topic.to_string()), handler);
    }

    /// Receive every publication on `topic`
    pub async fn subscribe(&self, topic: &str, handler: Arc<dyn BusHandler>) {
        self.subscribers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(handler);
    }

    async fn route(&self, endpoint: &Endpoint, topic: &str) -> Option<Arc<dyn BusHandler>> {
        let routes = self.routes.read().await;
        routes
            .get(&(endpoint.to_string(), topic.to_string()))
            .or_else(|| routes.get(&(format!("{}/*", endpoint.family()), topic.to_string())))
            .cloned()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn call(
        &self,
        endpoint: &Endpoint,
        topic: &str,
        payload: Value,
    ) -> Result<Value, BusError> {
        let handler = self
            .route(endpoint, topic)
            .await
            .ok_or_else(|| BusError::NoRoute {
                endpoint: endpoint.to_string(),
                topic: topic.to_string(),
            })?;
        handler.handle(payload).await
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<(), BusError> {
        let handlers = self
            .subscribers
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            if let Err(e) = handler.handle(payload.clone()).await {
                warn!(topic, error = %e, "subscriber failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_exact_route_wins_over_wildcard() {
        let bus = LocalBus::new();
        bus.register(
            "agent/*",
            topic::TASK_COMMAND,
            Arc::new(FnHandler::new(|_| async { Ok(json!("any")) })),
        )
        .await;
        bus.register(
            "agent/host-1",
            topic::TASK_COMMAND,
            Arc::new(FnHandler::new(|_| async { Ok(json!("exact")) })),
        )
        .await;

        let exact = Endpoint::Agent {
            host: "host-1".to_string(),
        };
        let other = Endpoint::Agent {
            host: "host-2".to_string(),
        };
        assert_eq!(
            bus.call(&exact, topic::TASK_COMMAND, json!({})).await,
            Ok(json!("exact"))
        );
        assert_eq!(
            bus.call(&other, topic::TASK_COMMAND, json!({})).await,
            Ok(json!("any"))
        );
    }

    #[tokio::test]
    async fn test_missing_route_is_not_retryable() {
        let bus = LocalBus::new();
        let err = bus
            .call(&Endpoint::Sync, topic::TRANSACTION_PUT, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoRoute { .. }));
        assert!(!err.is_retryable());
        assert!(BusError::Timeout.is_retryable());
        assert!(
            BusError::Remote {
                code: 429,
                message: "busy".into()
            }
            .is_retryable()
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = LocalBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(
            topic::TRANSACTION_ARCHIVED,
            Arc::new(FnHandler::new(move |payload| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(payload);
                    Ok(Value::Null)
                }
            })),
        )
        .await;

        bus.publish(topic::TRANSACTION_ARCHIVED, json!({"id": "x"}))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(json!({"id": "x"})));
    }
}
