//! Message types for actor communication
//!
//! Message handlers are implemented in [`crate::actor::engine`].

use fleetsync_api::responses::TransactionView;
use fleetsync_api::requests::{TransactionPostRequest, TransferPostRequest, TransferPutRequest};
use tokio::sync::oneshot;

use crate::error::CoreError;
use crate::runtime::LoopEvent;

// ============================================================================
// Sync Messages
// ============================================================================

/// Create (or join) a transaction
#[derive(Debug)]
pub struct CreateTransaction(pub TransactionPostRequest);

/// Aggregate a transaction's view
///
/// The answer arrives on `reply` once every transfer view was fetched, so
/// the actor stays free while the fan-out runs.
#[derive(Debug)]
pub struct QueryTransaction {
    pub id: String,
    pub reply: oneshot::Sender<Result<TransactionView, CoreError>>,
}

/// A tunnel reports one of its transfers finished
#[derive(Debug)]
pub struct EndTransfer {
    pub transaction_id: String,
    pub transfer_id: String,
}

/// List stored transactions
#[derive(Debug)]
pub struct ListTransactions {
    /// Only records with this code
    pub code: Option<i32>,
}

#[derive(Debug)]
pub struct DeleteTransaction {
    pub id: String,
}

// ============================================================================
// Tunnel Messages
// ============================================================================

/// Create (or join) a transfer
#[derive(Debug)]
pub struct CreateTransfer(pub TransferPostRequest);

#[derive(Debug)]
pub struct QueryTransfer {
    pub id: String,
}

/// An agent's completion report for one task
#[derive(Debug)]
pub struct ReportTask {
    pub transfer_id: String,
    pub report: TransferPutRequest,
}

/// List stored transfers
#[derive(Debug)]
pub struct ListTransfers {
    /// Only records with this code
    pub code: Option<i32>,
}

#[derive(Debug)]
pub struct DeleteTransfer {
    pub id: String,
}

// ============================================================================
// Internal Messages
// ============================================================================

/// Completion of a timer, remote call or notification
#[derive(Debug)]
pub struct Wake(pub LoopEvent);
