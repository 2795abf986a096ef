//! HTTP API server.

mod handlers;

use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::alerts::AlertStore;
use crate::db::Store;
use crate::healing::EngineCommand;
use crate::monitor::StatusBoard;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub board: StatusBoard,
    pub store: Store,
    pub alerts: AlertStore,
    pub heal_cmd_tx: mpsc::Sender<EngineCommand>,
}

pub struct Server {
    port: u16,
    state: AppState,
}

impl Server {
    pub fn new(port: u16, state: AppState) -> Self {
        Self { port, state }
    }

    fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/api/health", get(handlers::health))
            .route("/api/health/{service}", get(handlers::health_service))
            .route("/api/metrics", get(handlers::metrics))
            .route(
                "/api/alerts",
                get(handlers::alerts).delete(handlers::clear_alerts),
            )
            .route("/api/healing/{service}/reset", post(handlers::reset_healing))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self.state.clone())
    }

    /// Serve until the shutdown signal arrives.
    pub async fn start(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("HTTP API listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
    }
}
