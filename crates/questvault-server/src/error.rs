//! Error types for the monitoring endpoints.
//!
//! [`MonitorError`] converts into an HTTP response whose body is the
//! same `{success, data, message, error_code}` envelope every other
//! operation returns.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use questvault_db::StoreError;
use questvault_types::{ApiResponse, ErrorCode};

/// Errors that can occur while serving a monitoring request.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// The backend did not answer before the request deadline.
    #[error("backend did not answer within {0} ms")]
    Timeout(u64),

    /// The backend answered with an error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let code = match &self {
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Store(e) => e.code(),
        };
        let status = match code {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::BackendUnavailable | ErrorCode::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::SerializationError | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body: ApiResponse<()> = ApiResponse::fail(code, self.to_string());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_service_unavailable() {
        let response = MonitorError::Timeout(250).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn store_errors_keep_their_class() {
        let response = MonitorError::from(StoreError::not_found("player", "p-1")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = MonitorError::from(StoreError::Conflict(String::from("dup"))).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
