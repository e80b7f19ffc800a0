//! Tunnel endpoints: transfers and task reports

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
};
use fleetsync_api::requests::{ListQuery, TransferPostRequest, TransferPutRequest};
use fleetsync_api::responses::{RecordSummary, StatusResponse, TransferPostResponse, TransferView};
use fleetsync_core::{CreateTransfer, DeleteTransfer, ListTransfers, QueryTransfer, ReportTask};
use tracing::debug;

use crate::api::error::AppError;
use crate::state::AppState;

/// Create a transfer, or join the live one doing the same work
///
/// # Errors
/// Returns `AppError` if the transfer could not be created
#[utoipa::path(
    post,
    path = "/tunnel/transfer",
    tag = "tunnel",
    request_body = TransferPostRequest,
    responses(
        (status = 200, body = TransferPostResponse),
        (status = 400, body = StatusResponse),
        (status = 500, body = StatusResponse)
    )
)]
pub async fn create_transfer(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TransferPostRequest>, JsonRejection>,
) -> Result<Json<TransferPostResponse>, AppError> {
    let Json(request) = payload?;
    let created = state.engine.ask(CreateTransfer(request)).await?;
    Ok(Json(created))
}

/// # Errors
/// Returns `AppError` for unknown ids
#[utoipa::path(
    get,
    path = "/tunnel/transfer/{id}",
    tag = "tunnel",
    params(("id" = String, Path, description = "Transfer id")),
    responses((status = 200, body = TransferView), (status = 404, body = StatusResponse))
)]
pub async fn get_transfer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TransferView>, AppError> {
    let view = state.engine.ask(QueryTransfer { id }).await?;
    Ok(Json(view))
}

/// An agent's completion report for one task
///
/// The path names the transfer; a differing `transfer_id` in the body is
/// ignored.
///
/// # Errors
/// Returns `AppError` for unknown transfers or tasks
#[utoipa::path(
    put,
    path = "/tunnel/transfer/{id}",
    tag = "tunnel",
    params(("id" = String, Path, description = "Transfer id")),
    request_body = TransferPutRequest,
    responses(
        (status = 200, body = StatusResponse),
        (status = 400, body = StatusResponse),
        (status = 404, body = StatusResponse)
    )
)]
pub async fn report_task(
    State(state): State<Arc<AppState>>,
    Path(transfer_id): Path<String>,
    payload: Result<Json<TransferPutRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, AppError> {
    let Json(mut report) = payload?;
    if report.transfer_id != transfer_id {
        debug!(path = %transfer_id, body = %report.transfer_id, "report names another transfer");
        report.transfer_id.clone_from(&transfer_id);
    }
    let reply = state
        .engine
        .ask(ReportTask {
            transfer_id,
            report,
        })
        .await?;
    Ok(Json(reply))
}

/// # Errors
/// Returns `AppError` if the store cannot be read
#[utoipa::path(
    get,
    path = "/tunnel/transfer",
    tag = "tunnel",
    params(("code" = Option<i32>, Query, description = "Only records with this code")),
    responses((status = 200, body = Vec<RecordSummary>))
)]
pub async fn list_transfers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<RecordSummary>>, AppError> {
    let records = state.engine.ask(ListTransfers { code: query.code }).await?;
    Ok(Json(records))
}

/// Transfers cannot be deleted
///
/// # Errors
/// Always answers 400
#[utoipa::path(
    delete,
    path = "/tunnel/transfer/{id}",
    tag = "tunnel",
    params(("id" = String, Path, description = "Transfer id")),
    responses((status = 400, body = StatusResponse))
)]
pub async fn delete_transfer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let reply = state.engine.ask(DeleteTransfer { id }).await?;
    Ok(Json(reply))
}
