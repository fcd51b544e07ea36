use std::sync::Arc;

use axum::{
    extract::{Extension, State},
    Json,
};
use chrono::Utc;
use tracing::info;

use crate::models::DiagnosticsResponse;
use crate::routes::auth_middleware::AuthUser;
use crate::AppState;

/// Live session and connection counts
pub async fn diagnostics(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Json<DiagnosticsResponse> {
    let (n_sessions, n_conns) = state.registry.stats().await;

    info!(
        "Diagnostics requested by {}: {} session(s), {} connection(s)",
        user.username, n_sessions, n_conns
    );

    Json(DiagnosticsResponse {
        n_sessions,
        n_conns,
        server_time: Utc::now().to_rfc3339(),
    })
}
