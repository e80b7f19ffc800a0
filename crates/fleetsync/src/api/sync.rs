//! Sync endpoints: transactions

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
};
use fleetsync_api::requests::{ListQuery, TransactionPostRequest};
use fleetsync_api::responses::{
    RecordSummary, StatusResponse, TransactionPostResponse, TransactionView,
};
use fleetsync_core::{CreateTransaction, DeleteTransaction, EndTransfer, ListTransactions};
use tracing::info;

use crate::api::error::AppError;
use crate::state::AppState;

/// Create a transaction, or join the live one doing the same work
///
/// # Errors
/// Returns `AppError` for unresolvable destinations or engine failures
#[utoipa::path(
    post,
    path = "/sync/transaction",
    tag = "sync",
    request_body = TransactionPostRequest,
    responses(
        (status = 200, body = TransactionPostResponse),
        (status = 400, body = StatusResponse)
    )
)]
pub async fn create_transaction(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TransactionPostRequest>, JsonRejection>,
) -> Result<Json<TransactionPostResponse>, AppError> {
    let Json(request) = payload?;
    let created = state.engine.ask(CreateTransaction(request)).await?;
    info!(transaction = %created.transaction_id, code = created.code, "transaction accepted");
    Ok(Json(created))
}

/// Aggregated view; waits for the transfers' views
///
/// # Errors
/// Returns `AppError` for unknown ids or when the transfers do not answer in time
#[utoipa::path(
    get,
    path = "/sync/transaction/{id}",
    tag = "sync",
    params(("id" = String, Path, description = "Transaction id")),
    responses(
        (status = 200, body = TransactionView),
        (status = 404, body = StatusResponse),
        (status = 504, body = StatusResponse)
    )
)]
pub async fn get_transaction(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TransactionView>, AppError> {
    let timeout = state.config.engine.query_timeout();
    let view = fleetsync_core::query_transaction(&state.engine, id, timeout).await?;
    Ok(Json(view))
}

/// A tunnel reports one transfer finished
///
/// # Errors
/// Returns `AppError` for unknown ids
#[utoipa::path(
    put,
    path = "/sync/transaction/{id}/transfer/{transfer_id}",
    tag = "sync",
    params(
        ("id" = String, Path, description = "Transaction id"),
        ("transfer_id" = String, Path, description = "Transfer id")
    ),
    responses((status = 200, body = StatusResponse), (status = 404, body = StatusResponse))
)]
pub async fn end_transfer(
    State(state): State<Arc<AppState>>,
    Path((transaction_id, transfer_id)): Path<(String, String)>,
) -> Result<Json<StatusResponse>, AppError> {
    let reply = state
        .engine
        .ask(EndTransfer {
            transaction_id,
            transfer_id,
        })
        .await?;
    Ok(Json(reply))
}

/// # Errors
/// Returns `AppError` if the store cannot be read
#[utoipa::path(
    get,
    path = "/sync/transaction",
    tag = "sync",
    params(("code" = Option<i32>, Query, description = "Only records with this code")),
    responses((status = 200, body = Vec<RecordSummary>))
)]
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<RecordSummary>>, AppError> {
    let records = state
        .engine
        .ask(ListTransactions { code: query.code })
        .await?;
    Ok(Json(records))
}

/// Transactions cannot be deleted
///
/// # Errors
/// Always answers 400
#[utoipa::path(
    delete,
    path = "/sync/transaction/{id}",
    tag = "sync",
    params(("id" = String, Path, description = "Transaction id")),
    responses((status = 400, body = StatusResponse))
)]
pub async fn delete_transaction(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let reply = state.engine.ask(DeleteTransaction { id }).await?;
    Ok(Json(reply))
}
