//! Web server module: management API and the WebSocket push channel.

mod handlers;
mod ws;

pub use handlers::*;
pub use ws::*;

use crate::admin::Admin;
use crate::config::ServerConfig;
use crate::events::EventBus;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub admin: Arc<Admin>,
    pub events: Arc<EventBus>,
}

/// Web server for plcwatch.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, admin: Arc<Admin>, events: Arc<EventBus>) -> Self {
        Self {
            state: AppState { config, admin, events },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            // Controllers
            .route("/api/controllers", get(handlers::handle_list_controllers))
            .route("/api/controllers", post(handlers::handle_create_controller))
            .route("/api/controllers/{id}", get(handlers::handle_get_controller))
            .route("/api/controllers/{id}", put(handlers::handle_update_controller))
            .route("/api/controllers/{id}", delete(handlers::handle_delete_controller))
            .route("/api/controllers/{id}/tags", get(handlers::handle_list_tags))
            // Tags
            .route("/api/tags", post(handlers::handle_create_tag))
            .route("/api/tags/{id}", get(handlers::handle_get_tag))
            .route("/api/tags/{id}", put(handlers::handle_update_tag))
            .route("/api/tags/{id}", delete(handlers::handle_delete_tag))
            .route("/api/tags/{id}/value", get(handlers::handle_read_tag_value))
            .route("/api/tags/{id}/value", put(handlers::handle_write_tag_value))
            // Faults
            .route("/api/faults/active", get(handlers::handle_active_faults))
            .route("/api/faults/history", get(handlers::handle_fault_history))
            .route("/api/faults/{id}/acknowledge", post(handlers::handle_acknowledge_fault))
            .route("/api/fault-definitions", get(handlers::handle_list_definitions))
            .route("/api/fault-definitions", post(handlers::handle_create_definition))
            .route("/api/fault-definitions/import", post(handlers::handle_import_definitions))
            .route("/api/fault-definitions/{id}", get(handlers::handle_get_definition))
            .route("/api/fault-definitions/{id}", put(handlers::handle_update_definition))
            .route("/api/fault-definitions/{id}", delete(handlers::handle_delete_definition))
            .route("/api/sites", get(handlers::handle_sites))
            .route("/api/subsystems", get(handlers::handle_subsystems))
            // Runtime
            .route("/api/fleet", get(handlers::handle_fleet_snapshot))
            .route("/api/stats", get(handlers::handle_stats))
            .route("/ws", get(ws::handle_ws))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(4 * 1024 * 1024)) // 4MB, for bulk imports
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
