//! Endpoint handlers for the monitoring server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Health report; `503` when unhealthy |
//! | `GET` | `/stats` | Entity counts in the result envelope |

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use questvault_types::{ApiResponse, StorageStats};

use crate::error::MonitorError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

/// Build a health report. The reporter bounds every call itself.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.runtime.health().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        tracing::warn!(issues = ?report.issues, "Health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

// ---------------------------------------------------------------------------
// GET /stats
// ---------------------------------------------------------------------------

/// Aggregate entity counts from the backend.
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<ApiResponse<StorageStats>>, MonitorError> {
    let timeout = state.request_timeout;
    let stats = tokio::time::timeout(timeout, state.runtime.backend().get_storage_stats())
        .await
        .map_err(|_elapsed| MonitorError::Timeout(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)))??;
    Ok(Json(ApiResponse::ok(stats, "stats collected")))
}
