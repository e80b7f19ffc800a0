//! Response types for the API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::Application;
use crate::requests::HostEntry;

/// Generic `{code, message}` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub code: i32,
    pub message: String,
}

impl StatusResponse {
    /// `{200, "success"}`
    #[must_use]
    pub fn success() -> Self {
        Self {
            code: 200,
            message: "success".to_string(),
        }
    }
}

/// `POST /sync/transaction` reply
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransactionPostResponse {
    pub transaction_id: String,
    pub code: i32,
    pub message: String,
}

/// `POST /tunnel/transfer` reply
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransferPostResponse {
    pub transfer_id: String,
    pub code: i32,
    pub message: String,
}

/// Agent acknowledgement of a `task.command` call
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskCommandResponse {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub duration: u64,
}

/// One stage visited by a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TraceEntry {
    pub code: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds
    pub duration: u64,
}

/// Outcome of one host within a transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HostResult {
    /// Hostname
    pub host: String,
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub trace: Vec<TraceEntry>,
}

/// `GET /tunnel/transfer/{id}` reply, also one element of a transaction view
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransferView {
    pub transfer_id: String,
    pub transaction_id: String,
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
    #[serde(default)]
    pub results: Vec<HostResult>,
}

/// `GET /sync/transaction/{id}` reply: the aggregated fan-in view
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransactionView {
    pub transaction_id: String,
    pub code: i32,
    pub message: String,
    pub create_time: DateTime<Utc>,
    pub last_time: DateTime<Utc>,
    #[schema(value_type = Object)]
    pub application: Application,
    pub transfers: Vec<TransferView>,
}

impl TransactionView {
    /// Every host result across all transfers
    pub fn results(&self) -> impl Iterator<Item = &HostResult> {
        self.transfers.iter().flat_map(|t| t.results.iter())
    }
}

/// One stored record as returned by the listing endpoints
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RecordSummary {
    pub id: String,
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
