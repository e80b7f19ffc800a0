//! Per-transition context values

use std::fmt;

use fleetsync_api::Application;
use fleetsync_api::requests::TransferPutRequest;
use fleetsync_api::responses::{TransactionView, TransferView};

use crate::id::ObjectId;

/// Entity kinds driven by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Transaction,
    /// Sync-side proxy of one transfer inside a transaction
    Bucket,
    Transfer,
    Task,
}

impl Kind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::Bucket => "bucket",
            Self::Transfer => "transfer",
            Self::Task => "task",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of one live entity inside the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Transaction(ObjectId),
    Bucket { transaction: ObjectId, key: String },
    Transfer(ObjectId),
    Task { transfer: ObjectId, key: String },
}

impl Target {
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Self::Transaction(_) => Kind::Transaction,
            Self::Bucket { .. } => Kind::Bucket,
            Self::Transfer(_) => Kind::Transfer,
            Self::Task { .. } => Kind::Task,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transaction(id) | Self::Transfer(id) => write!(f, "{}/{id}", self.kind()),
            Self::Bucket { transaction, key } => write!(f, "transaction/{transaction}/bucket/{key}"),
            Self::Task { transfer, key } => write!(f, "transfer/{transfer}/task/{key}"),
        }
    }
}

/// Data carried by a context
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    /// Application payload handed to a new child entity
    Application(Application),
    /// A task completion report
    Report(TransferPutRequest),
    /// Force every outstanding child to end with a timeout
    Timeout,
    /// Downstream transfer view returned by a query
    View(TransferView),
    /// Aggregated transaction view
    Aggregate(Box<TransactionView>),
}

/// Transient value accompanying one state transition
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Correlation key (task id, transfer id)
    pub key: Option<String>,
    /// Parent entity id
    pub attachment: Option<ObjectId>,
    /// Provisional index of a child entity
    pub index: Option<usize>,
    /// Shard to continue with, all shards when absent
    pub shard: Option<u8>,
    pub data: Payload,
    /// Entity that fired the event being handled
    pub sender: Option<Target>,
}

impl Context {
    /// Context for a child created under `parent`
    #[must_use]
    pub fn child(parent: ObjectId, index: usize, data: Payload) -> Self {
        Self {
            attachment: Some(parent),
            index: Some(index),
            data,
            ..Self::default()
        }
    }

    /// Context carrying a completion report
    #[must_use]
    pub fn report(report: TransferPutRequest) -> Self {
        Self {
            key: Some(report.task_id.clone()),
            data: Payload::Report(report),
            ..Self::default()
        }
    }

    /// Context carrying a synthetic `code`/`message` report for `task_id`
    #[must_use]
    pub fn forced(task_id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self::report(TransferPutRequest {
            task_id: task_id.into(),
            transfer_id: String::new(),
            code,
            message: message.into(),
            duration: 0,
        })
    }

    /// Context correlated by `key` only
    #[must_use]
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }
}
