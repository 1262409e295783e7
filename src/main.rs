use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use docqa::api::{ApiConfig, ApiServer, AppState};
use docqa::chat::{ChatOrchestrator, OpenAiChat};
use docqa::config::AppConfig;
use docqa::embeddings::EmbeddingsClient;
use docqa::retriever::HybridRetriever;
use docqa::store::PgStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.logging.filter))
        .with_target(false)
        .init();

    let store = Arc::new(PgStore::connect(&config.database).await?);
    tracing::info!(url = %config.database.url, "connected to store");

    let embeddings = EmbeddingsClient::from_config(&config.embedding);
    let chat_service = Arc::new(OpenAiChat::from_config(&config.chat));

    let retriever = Arc::new(HybridRetriever::new(
        store.clone(),
        embeddings,
        config.retrieval.clone(),
    ));
    let orchestrator = Arc::new(ChatOrchestrator::new(
        retriever,
        store.clone(),
        chat_service,
        config.retrieval.clone(),
    ));

    let state = AppState::new(
        store,
        orchestrator,
        Duration::from_secs(config.server.request_deadline_secs),
    );
    let server = ApiServer::new(
        ApiConfig {
            host: config.server.host.clone(),
            port: config.server.port,
        },
        state,
    );

    server
        .run_with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
}
