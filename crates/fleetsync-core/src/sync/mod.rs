//! Sync layer: transactions and their per-shard buckets
//!
//! A transaction resolves its destination into hosts, partitions them into
//! shard-bounded buckets and creates one downstream transfer per bucket. Each
//! bucket is the sync-side proxy of that transfer.

mod bucket;
mod dispatch;
mod module;
pub mod state;
mod transaction;

pub use bucket::Bucket;
pub use dispatch::{Batch, dispatch};
pub use module::TransactionModule;
pub use transaction::{QueryWaiter, Transaction, TransactionWork};
