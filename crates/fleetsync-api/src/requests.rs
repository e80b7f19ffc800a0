//! Request types for the API

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::Application;

/// Destination of a transaction: a filter expression or an explicit host list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum Dst {
    /// Filter expression evaluated against the host inventory
    Filter(String),
    /// Explicit hostnames, optionally grouped with extra context
    Hosts(Vec<DstEntry>),
}

impl Default for Dst {
    fn default() -> Self {
        Self::Hosts(Vec::new())
    }
}

/// One entry of an explicit destination list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum DstEntry {
    /// A bare hostname
    Host(String),
    /// Several hostnames sharing extra application context
    Group {
        hostname: Vec<String>,
        #[serde(default)]
        #[schema(value_type = Object)]
        context: Application,
    },
}

/// Resolved target host as shipped inside a transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HostEntry {
    /// Host identifier (drives sharding and agent addressing)
    pub host: String,
    /// Human readable hostname reported in results
    pub hostname: String,
    /// Extra fields merged into the per-host application payload
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    #[schema(value_type = Object)]
    pub context: Application,
}

/// `POST /sync/transaction`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransactionPostRequest {
    pub dst: Dst,
    /// Agent call attempts per task (engine default when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    /// Seconds between agent call attempts (engine default when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub application: Application,
}

/// `PUT /sync/transaction/{id}/transfer/{transfer_id}`, also the `transaction.put` topic payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TransactionPutRequest {
    pub transaction_id: String,
    pub transfer_id: String,
}

/// `POST /tunnel/transfer`, also the `transfer.post` topic payload
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransferPostRequest {
    pub transaction_id: String,
    pub hosts: Vec<HostEntry>,
    pub retry: u32,
    pub timeout: u64,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub application: Application,
}

/// `transfer.get` topic payload
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransferGetRequest {
    pub transfer_id: String,
}

/// `PUT /tunnel/transfer/{id}`: an agent's completion report for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TransferPutRequest {
    pub task_id: String,
    #[serde(default)]
    pub transfer_id: String,
    pub code: i32,
    #[serde(default)]
    pub message: String,
    /// Seconds spent by the agent; 0 lets the engine measure it
    #[serde(default)]
    pub duration: u64,
}

/// Command envelope sent to an agent over the `task.command` topic
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskCommandRequest {
    pub task_id: String,
    pub transfer_id: String,
    #[schema(value_type = Object)]
    pub application: Application,
    pub code: i32,
    pub timeout: u64,
    pub retry: u32,
}

/// Query string of the listing endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ListQuery {
    /// Only records currently at this status code
    #[serde(default)]
    pub code: Option<i32>,
}
