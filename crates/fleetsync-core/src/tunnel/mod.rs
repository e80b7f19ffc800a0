//! Tunnel layer: transfers and their per-host tasks
//!
//! A transfer is one shard's batch of hosts. It fans out into one task per
//! host, each delivering a command to the host's agent, and fans the task
//! completions back in through a counting barrier.

pub(crate) mod module;
pub mod state;
mod task;
mod transfer;

pub use module::TransferModule;
pub use task::Task;
pub use transfer::Transfer;
