//! HTTP server assembly.

use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::handlers::{
    abort_chat, chat, create_conversation, delete_conversation, get_conversation, health,
    list_collections, list_conversations, serve_pdf, update_conversation, AppState,
};

/// Server bind configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl ApiConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self { config, state }
    }

    fn build_router(&self) -> Router {
        Router::new()
            .route("/api/health", get(health))
            .route("/api/collections", get(list_collections))
            .route(
                "/api/conversations",
                get(list_conversations).post(create_conversation),
            )
            .route(
                "/api/conversations/:id",
                get(get_conversation)
                    .patch(update_conversation)
                    .delete(delete_conversation),
            )
            .route("/api/chat", post(chat))
            .route("/api/chat/abort", delete(abort_chat))
            .route("/api/documents/:id/pdf", get(serve_pdf))
            .with_state(self.state.clone())
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
    }

    /// Run until the shutdown future resolves.
    pub async fn run_with_shutdown(
        self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let app = self.build_router();
        let bind_addr = self.config.bind_address();

        tracing::info!(addr = %bind_addr, "starting API server");

        let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}
