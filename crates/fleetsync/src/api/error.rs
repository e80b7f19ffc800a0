//! API error types

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use fleetsync_api::responses::StatusResponse;
use fleetsync_core::CoreError;
use kameo::error::SendError;

/// Error response carrying the `{code, message}` envelope
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub error: StatusResponse,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            error: StatusResponse {
                code: i32::from(status.as_u16()),
                message: message.into(),
            },
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<CoreError> for AppError {
    fn from(e: CoreError) -> Self {
        let status =
            StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, e.to_string())
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

impl<M> From<SendError<M, CoreError>> for AppError
where
    SendError<M, CoreError>: std::fmt::Display,
{
    fn from(e: SendError<M, CoreError>) -> Self {
        match e {
            SendError::HandlerError(e) => e.into(),
            e => Self::internal(format!("engine unavailable: {e}")),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.error)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_map_to_status() {
        let error = AppError::from(CoreError::not_found("transfer", "abc"));
        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert_eq!(error.error.code, 404);
        assert_eq!(error.error.message, "transfer not found: abc");

        let error = AppError::from(CoreError::Unsupported {
            kind: "transaction",
            operation: "delete",
        });
        assert_eq!(error.status, StatusCode::BAD_REQUEST);

        let error = AppError::from(CoreError::Timeout);
        assert_eq!(error.status, StatusCode::GATEWAY_TIMEOUT);
    }
}
