use std::sync::Arc;

use axum::{extract::State, Json};
use tracing::debug;

use crate::models::HealthResponse;
use crate::AppState;

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
    })
}

/// Readiness check endpoint. Not ready without a reachable note directory,
/// since every session load and flush goes through it.
pub async fn ready_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    debug!("Readiness check requested");
    match tokio::fs::metadata(&state.config.note_directory).await {
        Ok(meta) if meta.is_dir() => Json(HealthResponse {
            status: "ok".to_string(),
            message: "Service is ready".to_string(),
        }),
        _ => Json(HealthResponse {
            status: "degraded".to_string(),
            message: format!(
                "note directory {} is not available",
                state.config.note_directory
            ),
        }),
    }
}
