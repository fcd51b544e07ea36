use std::sync::Arc;

use axum::http::HeaderValue;
use axum::{middleware, routing::get, Router};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use tracing::warn;

use crate::docs::ApiDoc;
use crate::handlers::{diagnostics, health_check, ready_check};
use crate::routes::auth_middleware::auth_middleware;
use crate::ws::handler::ws_handler;
use crate::AppState;

/// Create API routes (everything behind the auth middleware)
pub fn create_api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/diagnostics", get(diagnostics))
        .route("/v1/ws", get(ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .with_state(state)
}

/// Assemble the full application router. Shared between `main` and the
/// integration tests so both serve the identical surface.
pub fn create_app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state);

    Router::new()
        // Open probes
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .with_state(state.clone())
        // Mount API routes
        .nest("/api", create_api_routes(state))
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Add tracing layer
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn cors_layer(state: &Arc<AppState>) -> CorsLayer {
    if state.config.is_development() {
        return CorsLayer::permissive();
    }
    match &state.config.cors_origins {
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|o| o.trim().parse::<HeaderValue>().ok())
                .collect();
            CorsLayer::new().allow_origin(AllowOrigin::list(origins))
        }
        None => {
            warn!("no CORS origins configured outside development");
            CorsLayer::new()
        }
    }
}
