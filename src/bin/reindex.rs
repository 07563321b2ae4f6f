//! Force a full index rebuild from the command line

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use noteseek::{EmbedderService, EmbeddingCache, IndexerService, MetadataStore, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let settings = Arc::new(Settings::load(&config_path)?);
    settings.prepare_storage()?;

    let metadata_store = MetadataStore::open(&settings.storage.metadata_db_path()).await?;
    let cache = EmbeddingCache::open(&settings.storage.embedding_cache_path()).await?;
    let embedder = EmbedderService::new(&settings.embedding, &settings.api_key, cache)?;
    let indexer = IndexerService::new(Arc::clone(&settings), metadata_store, embedder)?;

    info!("Rebuilding index from {}", settings.notes.directory.display());
    indexer.build_index().await?;

    let stats = indexer.stats().await?;
    println!(
        "Rebuild complete: {} documents, {} chunks, {} tags, {} vectors ({} MB)",
        stats.total_documents,
        stats.total_chunks,
        stats.total_tags,
        stats.vector_count,
        stats.index_size_mb
    );

    indexer.close().await;
    Ok(())
}
