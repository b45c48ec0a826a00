//! Web server module.

mod handlers;

pub use handlers::*;

use crate::alerts::{AlertManager, WebhookNotifier};
use crate::config::ServerConfig;
use crate::db::Store;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, patch, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    /// The hub's public key line, handed to agents.
    pub public_key: String,
    pub alerts: Arc<AlertManager>,
    pub notifier: Arc<WebhookNotifier>,
}

/// HTTP API of the hub.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            .route("/api/fleet/getkey", get(handlers::handle_get_key))
            .route("/api/fleet/test-notification", post(handlers::handle_test_notification))
            .route("/api/fleet/config-yaml", get(handlers::handle_config_yaml))
            .route(
                "/api/hosts",
                get(handlers::handle_get_hosts).post(handlers::handle_create_host),
            )
            .route(
                "/api/hosts/{id}",
                patch(handlers::handle_update_host).delete(handlers::handle_delete_host),
            )
            .route("/api/records", get(handlers::handle_get_records))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
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
