//! fleetsync-api: Shared wire types and schemas
//!
//! Request/response envelopes for the sync and tunnel HTTP boundary, the agent
//! command envelope, aggregated views, and broadcast event types used across
//! the daemon, the client and the engine.

pub mod events;
pub mod requests;
pub mod responses;

/// Free-form application payload carried from the caller down to each agent
pub type Application = serde_json::Map<String, serde_json::Value>;
