//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
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
    pub scheduler: Arc<Scheduler>,
}

/// JSON control surface for the scheduler.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, store: Arc<Store>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            state: AppState {
                config,
                store,
                scheduler,
            },
        }
    }

    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            .route("/api/jobs", get(handlers::handle_list_jobs).post(handlers::handle_create_job))
            .route("/api/jobs/{id}", get(handlers::handle_get_job))
            .route("/api/jobs/{id}/stop", post(handlers::handle_stop_job))
            .route("/api/jobs/{id}/data", get(handlers::handle_job_data))
            .route("/api/jobs/{id}/report", get(handlers::handle_job_report))
            .route("/api/jobs/{id}/export", get(handlers::handle_export))
            .route("/api/history", get(handlers::handle_history))
            .route("/api/cleanup", post(handlers::handle_cleanup))
            .route("/health", get(handlers::handle_health))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve until the listener fails.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
