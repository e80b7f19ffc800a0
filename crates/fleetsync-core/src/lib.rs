//! fleetsync-core: fan-out/fan-in orchestration engine
//!
//! Transactions resolve a destination into hosts and split them into
//! per-shard buckets; every bucket becomes a transfer on that shard's
//! tunnel, which fans out one task per host and reports back once all of
//! them ended. The [`EngineActor`] serializes every request and completion
//! onto a single [`Engine`].

pub mod activity;
pub mod actor;
pub mod bus;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod id;
pub mod inventory;
pub mod message;
pub mod notify;
pub mod observer;
pub mod registry;
pub mod runtime;
pub mod state;
pub mod store;
pub mod sync;
pub mod tunnel;

pub use actor::{EngineActor, EngineArgs, mount, query_transaction};
pub use bus::{BusError, BusHandler, Endpoint, FnHandler, LocalBus, MessageBus};
pub use config::{EngineConfig, HostConfig};
pub use engine::Engine;
pub use error::CoreError;
pub use id::ObjectId;
pub use inventory::{HostInventory, StaticInventory};
pub use message::{
    CreateTransaction, CreateTransfer, DeleteTransaction, DeleteTransfer, EndTransfer,
    ListTransactions, ListTransfers, QueryTransaction, QueryTransfer, ReportTask, Wake,
};
pub use notify::{LogNotifier, Notifier};
pub use runtime::{Collaborators, LoopEvent};
pub use state::{TaskStage, TransactionStage, TransferStage};
pub use store::{DocumentStore, MemoryStore};
