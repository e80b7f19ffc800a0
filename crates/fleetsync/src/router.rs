//! HTTP router configuration

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, put},
};
use fleetsync_api::events::FleetEvent;
use fleetsync_api::requests::{
    Dst, DstEntry, HostEntry, ListQuery, TaskCommandRequest, TransactionPostRequest,
    TransactionPutRequest, TransferGetRequest, TransferPostRequest, TransferPutRequest,
};
use fleetsync_api::responses::{
    HealthResponse, HostResult, RecordSummary, StatusResponse, TaskCommandResponse, TraceEntry,
    TransactionPostResponse, TransactionView, TransferPostResponse, TransferView,
};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::api::{sync, system, tunnel};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(title = "fleetsync", description = "Fan-out/fan-in command orchestration"),
    paths(
        system::health,
        sync::create_transaction,
        sync::get_transaction,
        sync::end_transfer,
        sync::list_transactions,
        sync::delete_transaction,
        tunnel::create_transfer,
        tunnel::get_transfer,
        tunnel::report_task,
        tunnel::list_transfers,
        tunnel::delete_transfer,
    ),
    components(schemas(
        Dst,
        DstEntry,
        HostEntry,
        ListQuery,
        TransactionPostRequest,
        TransactionPutRequest,
        TransferPostRequest,
        TransferGetRequest,
        TransferPutRequest,
        TaskCommandRequest,
        TaskCommandResponse,
        StatusResponse,
        TransactionPostResponse,
        TransferPostResponse,
        TraceEntry,
        HostResult,
        TransferView,
        TransactionView,
        RecordSummary,
        HealthResponse,
        FleetEvent,
    ))
)]
pub struct ApiDoc;

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // System endpoints
        .route("/health", get(system::health))
        .route("/openapi.json", get(system::openapi))
        // Sync endpoints
        .route(
            "/sync/transaction",
            get(sync::list_transactions).post(sync::create_transaction),
        )
        .route(
            "/sync/transaction/{id}",
            get(sync::get_transaction).delete(sync::delete_transaction),
        )
        .route(
            "/sync/transaction/{id}/transfer/{transfer_id}",
            put(sync::end_transfer),
        )
        // Tunnel endpoints
        .route(
            "/tunnel/transfer",
            get(tunnel::list_transfers).post(tunnel::create_transfer),
        )
        .route(
            "/tunnel/transfer/{id}",
            get(tunnel::get_transfer)
                .put(tunnel::report_task)
                .delete(tunnel::delete_transfer),
        )
        .merge(Scalar::with_url("/scalar", ApiDoc::openapi()))
        // State
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use fleetsync_core::{EngineActor, EngineArgs, EngineConfig, ObjectId};
    use kameo::actor::Spawn;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;

    fn app() -> Router {
        let engine = EngineActor::spawn(EngineArgs::in_memory(EngineConfig::default()));
        create_router(Arc::new(AppState::new(engine, Config::default())))
    }

    async fn send(request: Request<Body>) -> (StatusCode, Value) {
        let resp = app().oneshot(request).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn json_request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_route() {
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));
    }

    #[tokio::test]
    async fn test_malformed_bodies_answer_400_envelope() {
        for req in [
            json_request("POST", "/sync/transaction", r#"{"application":{}}"#),
            json_request("POST", "/tunnel/transfer", "{not json"),
            json_request(
                "PUT",
                &format!("/tunnel/transfer/{}", ObjectId::new()),
                r#"{"code":"done"}"#,
            ),
        ] {
            let (status, body) = send(req).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["code"], json!(400));
            assert!(body["message"].as_str().is_some_and(|m| !m.is_empty()));
        }
    }

    #[tokio::test]
    async fn test_missing_content_type_answers_400_envelope() {
        let req = Request::builder()
            .method("POST")
            .uri("/sync/transaction")
            .body(Body::from(r#"{"dst":[],"application":{}}"#))
            .unwrap();
        let (status, body) = send(req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!(400));
    }

    #[tokio::test]
    async fn test_unknown_transaction_answers_404() {
        let req = Request::builder()
            .uri(format!("/sync/transaction/{}", ObjectId::new()))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], json!(404));
    }

    #[tokio::test]
    async fn test_deletes_are_rejected() {
        for uri in [
            format!("/sync/transaction/{}", ObjectId::new()),
            format!("/tunnel/transfer/{}", ObjectId::new()),
        ] {
            let req = Request::builder()
                .method("DELETE")
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            let (status, body) = send(req).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["code"], json!(400));
        }
    }

    #[tokio::test]
    async fn test_transfer_created_over_http() {
        let body = json!({
            "transaction_id": ObjectId::new().to_string(),
            "hosts": [{"host": "0000000a-0001", "hostname": "edge-01"}],
            "retry": 1,
            "timeout": 1,
        });
        let req = json_request("POST", "/tunnel/transfer", &body.to_string());
        let (status, body) = send(req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(
            body["transfer_id"]
                .as_str()
                .is_some_and(|id| ObjectId::parse(id).is_ok())
        );
    }

    #[test]
    fn test_openapi_lists_every_route() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&str> = doc.paths.paths.keys().map(String::as_str).collect();
        for path in [
            "/health",
            "/sync/transaction",
            "/sync/transaction/{id}",
            "/sync/transaction/{id}/transfer/{transfer_id}",
            "/tunnel/transfer",
            "/tunnel/transfer/{id}",
        ] {
            assert!(paths.contains(&path), "missing {path}");
        }
    }
}
