mod api;

use async_trait::async_trait;
use axum::{Router, routing::get};
use heron_core::Result;
use heron_sftp::{Engine, EngineStatus, PamEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// What the HTTP layer needs from the running engine.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    async fn handle_session(&self, event: PamEvent) -> bool;

    fn status(&self) -> EngineStatus;
}

#[async_trait]
impl EngineHandle for Engine {
    async fn handle_session(&self, event: PamEvent) -> bool {
        Engine::handle_session(self, event).await
    }

    fn status(&self) -> EngineStatus {
        Engine::status(self)
    }
}

pub struct HttpServer {
    engine: Arc<dyn EngineHandle>,
    bind: SocketAddr,
}

impl HttpServer {
    pub fn new(engine: Arc<dyn EngineHandle>, bind: SocketAddr) -> Self {
        Self { engine, bind }
    }

    /// Serve until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let app = create_router(self.engine.clone());
        let listener = tokio::net::TcpListener::bind(self.bind).await?;
        info!("HTTP server listening on http://{}", self.bind);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}

pub fn create_router(engine: Arc<dyn EngineHandle>) -> Router {
    let state = AppState { engine };

    Router::new()
        // PAM exec hook
        .route("/api/events/pam/generic", get(api::pam_event))

        // Diagnostics
        .route("/api/status", get(api::status))
        .route("/health", get(api::health))

        // Add middleware
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn EngineHandle>,
}
