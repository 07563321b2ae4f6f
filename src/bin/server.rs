//! API server entry point
//!
//! Loads the configuration, builds the index on first run (or loads the
//! persisted one), and serves the HTTP API.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use noteseek::api::{start_server, AppState};
use noteseek::{
    ArkChatClient, EmbedderService, EmbeddingCache, IndexerService, MetadataStore,
    RetrieverService, Settings, WebSearchService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // LOG_LEVEL seeds the filter, e.g. LOG_LEVEL=debug
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let settings = Arc::new(Settings::load(&config_path)?);
    settings.prepare_storage()?;

    info!("Starting noteseek backend (v{})", noteseek::VERSION);

    let metadata_store = MetadataStore::open(&settings.storage.metadata_db_path()).await?;
    let cache = EmbeddingCache::open(&settings.storage.embedding_cache_path()).await?;
    let embedder = EmbedderService::new(&settings.embedding, &settings.api_key, cache)?;
    let indexer = Arc::new(IndexerService::new(
        Arc::clone(&settings),
        metadata_store,
        embedder,
    )?);

    if indexer.is_index_exists() {
        info!("Loading existing index");
        indexer.load_index().await?;
    } else {
        info!("First run, building index");
        indexer.build_index().await?;
    }

    let chat = Box::new(ArkChatClient::new(&settings.llm, &settings.api_key)?);
    let retriever = Arc::new(RetrieverService::new(
        Arc::clone(&indexer),
        WebSearchService::new(),
        chat,
        settings.search.clone(),
    ));

    let state = AppState {
        settings: Arc::clone(&settings),
        indexer,
        retriever,
    };

    let port = settings.server.backend_port;
    start_server(state, port).await
}
