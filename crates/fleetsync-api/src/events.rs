//! Broadcast event types

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Engine events published on the broadcast channel
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type")]
pub enum FleetEvent {
    /// Durable status code of an entity changed
    StageChanged {
        kind: String,
        id: String,
        from: i32,
        to: i32,
        message: String,
    },
    /// An agent call was rescheduled after a failure
    TaskRetried {
        transfer: String,
        task: String,
        attempt: u32,
    },
    /// A finished transaction was archived and left the live registry
    TransactionArchived { id: String, notified: bool },
}
