pub mod config;
pub mod docs;
pub mod engine;
pub mod handlers;
pub mod models;
pub mod registry;
pub mod resolver;
pub mod routes;
pub mod services;
pub mod ws;

use config::Config;
use registry::SessionRegistry;

/// Shared application state, injected into every handler.
pub struct AppState {
    pub config: Config,
    pub registry: SessionRegistry,
}
