//! Web server module.

mod auth;
mod error;
mod handlers;
mod upload;

pub use auth::*;
pub use error::*;
pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::orchestrator::Orchestrator;
use crate::registry::ClientRegistry;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const UPLOAD_LIMIT: usize = 512 * 1024 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub registry: ClientRegistry,
    pub orchestrator: Orchestrator,
}

/// Web server for the deployment API.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ServerConfig,
        store: Arc<Store>,
        registry: ClientRegistry,
        orchestrator: Orchestrator,
    ) -> Self {
        Self {
            state: AppState {
                config,
                store,
                registry,
                orchestrator,
            },
        }
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = routes(self.state.clone());

        if !self.state.config.auth_enabled() {
            tracing::warn!("No API tokens configured, authentication is disabled");
        }
        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

/// Build the router with all routes.
pub fn routes(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        // Clients
        .route(
            "/clients/",
            get(handlers::handle_get_clients).post(handlers::handle_create_client),
        )
        .route("/clients/{id}/", get(handlers::handle_get_client))
        .route("/clients/{id}/checkin/", post(handlers::handle_client_checkin))
        .route(
            "/clients/{id}/update_status/",
            post(handlers::handle_update_client_status),
        )
        // Packages
        .route(
            "/packages/",
            get(handlers::handle_get_packages).post(handlers::handle_upload_package),
        )
        .route(
            "/packages/{id}/",
            get(handlers::handle_get_package).patch(handlers::handle_update_package),
        )
        // Deployments
        .route(
            "/deployments/",
            get(handlers::handle_get_deployments).post(handlers::handle_create_deployment),
        )
        .route("/deployments/{id}/", get(handlers::handle_get_deployment))
        .route(
            "/deployments/{id}/cancel/",
            post(handlers::handle_cancel_deployment),
        )
        .route(
            "/deployments/{id}/retry_failed/",
            post(handlers::handle_retry_failed),
        )
        // Per-client status rows
        .route("/deployment-status/", get(handlers::handle_get_statuses))
        .route("/deployment-status/{id}/", get(handlers::handle_get_status))
        .route(
            "/deployment-status/{id}/result/",
            post(handlers::handle_report_result),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_token));

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(UPLOAD_LIMIT))
        .with_state(state)
}
