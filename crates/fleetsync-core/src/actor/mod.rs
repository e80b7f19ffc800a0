//! Actor implementations

pub mod engine;

pub use engine::{EngineActor, EngineArgs, mount, query_transaction};
