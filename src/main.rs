use std::panic;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use notesync::config::Config;
use notesync::registry::SessionRegistry;
use notesync::routes::create_app;
use notesync::AppState;

#[tokio::main]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "notesync=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    if config.auth_jwt_secret.is_none() {
        warn!("No JWT secret configured - all authenticated routes will fail");
    }

    let state = Arc::new(AppState {
        registry: SessionRegistry::new(PathBuf::from(&config.note_directory)),
        config,
    });

    let app = create_app(state.clone());

    let listener = tokio::net::TcpListener::bind(state.config.server_address())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", state.config.server_address()));

    info!("🚀 Server running on http://{}", state.config.server_address());
    info!(
        "📡 WebSocket available at ws://{}/api/v1/ws",
        state.config.server_address()
    );
    info!(
        "📚 Swagger UI available at http://{}/swagger",
        state.config.server_address()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await
        .expect("Server failed to start");

    info!("Server stopped");
}

async fn shutdown_signal(state: Arc<AppState>) {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    info!("Shutdown signal received");

    // Flush every open session and evict its members; their coordinators
    // close out, which is what lets the graceful shutdown finish.
    state.registry.shutdown().await;
}
