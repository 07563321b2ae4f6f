//! End-to-end index build tests
//!
//! Runs `build_index` over a scratch notes directory against a mock
//! embeddings endpoint and checks the pipeline invariants: chunk ids and
//! indices, vector/chunk count agreement, rebuild idempotence, and the
//! warm-cache rebuild issuing zero API calls.

use noteseek::cache::EmbeddingCache;
use noteseek::config::{
    EmbeddingConfig, IndexingConfig, LlmConfig, NotesConfig, SearchConfig, ServerConfig, Settings,
    StorageConfig, TimeDecayConfig,
};
use noteseek::embedder::EmbedderService;
use noteseek::indexer::IndexerService;
use noteseek::metadata_store::MetadataStore;
use noteseek::models::DocumentChunk;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Deterministic fake embedding derived from the text (FNV-style)
fn fake_embedding(text: &str) -> Vec<f32> {
    let mut hash: u32 = 2166136261;
    for byte in text.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    (0..4)
        .map(|i| ((hash.rotate_left(i * 8) & 0xFFFF) as f32 / 65535.0) + 0.1)
        .collect()
}

fn embedding_responder(req: &wiremock::Request) -> ResponseTemplate {
    let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
    let inputs = body["input"].as_array().unwrap();
    let data: Vec<serde_json::Value> = inputs
        .iter()
        .enumerate()
        .map(|(i, text)| {
            json!({ "index": i, "embedding": fake_embedding(text.as_str().unwrap()) })
        })
        .collect();
    ResponseTemplate::new(200).set_body_json(json!({ "data": data }))
}

fn settings_for(notes_dir: &Path, data_dir: &Path, api_base: String) -> Arc<Settings> {
    Arc::new(Settings {
        notes: NotesConfig {
            directory: notes_dir.to_path_buf(),
            exclude_patterns: vec!["*.bak".to_string()],
        },
        embedding: EmbeddingConfig {
            api_base,
            model: "test-embedding-model".to_string(),
            batch_size: 4,
            dimension: 4,
            max_concurrent: 2,
        },
        llm: LlmConfig {
            api_base: "http://localhost:9".to_string(),
            model: "chat".to_string(),
            temperature: 0.7,
            max_tokens: 512,
        },
        search: SearchConfig {
            local_ratio: 0.8,
            network_ratio: 0.2,
            time_decay: TimeDecayConfig {
                recent_months: 3,
                recent_boost: 1.5,
                old_years: 1,
                old_penalty: 0.8,
            },
            top_k_local: 16,
            top_k_network: 4,
            similarity_threshold: 0.1,
            context_before: 3,
            context_after: 2,
        },
        indexing: IndexingConfig {
            chunk_size: 300,
            chunk_overlap: 80,
            min_chunk_size: 100,
            update_interval: 3600,
        },
        server: ServerConfig {
            backend_port: 0,
            frontend_port: 0,
            cors_origins: vec![],
        },
        storage: StorageConfig {
            data_dir: data_dir.to_path_buf(),
            metadata_db: PathBuf::from("metadata.db"),
            vector_index: PathBuf::from("notes.index"),
            cache_dir: PathBuf::from("cache"),
        },
        api_key: "test".to_string(),
    })
}

fn write_corpus(notes_dir: &Path) {
    let long_paragraphs: Vec<String> = (0..8)
        .map(|i| {
            format!(
                "Paragraph number {} talks about the retrieval pipeline in enough \
                 detail to fill a realistic amount of space for chunking purposes. \
                 It keeps going until it reaches a useful length.",
                i
            )
        })
        .collect();
    std::fs::write(
        notes_dir.join("long-note.md"),
        format!(
            "---\ntitle: Long Note\n---\n# Long Note\n\n{}",
            long_paragraphs.join("\n\n")
        ),
    )
    .unwrap();

    std::fs::write(
        notes_dir.join("short-note.md"),
        "A short note mentioning [[Long Note]] and tagged #retrieval for lookup tests.",
    )
    .unwrap();

    // Must be excluded by the *.bak pattern
    std::fs::write(notes_dir.join("ignored.bak"), "not indexed").unwrap();
}

async fn build_indexer(settings: Arc<Settings>) -> IndexerService {
    settings.prepare_storage().unwrap();
    let store = MetadataStore::open(&settings.storage.metadata_db_path())
        .await
        .unwrap();
    let cache = EmbeddingCache::open(&settings.storage.embedding_cache_path())
        .await
        .unwrap();
    let embedder = EmbedderService::new(&settings.embedding, "key", cache).unwrap();
    IndexerService::new(settings, store, embedder).unwrap()
}

#[tokio::test]
async fn build_index_satisfies_invariants() {
    let notes_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    write_corpus(notes_dir.path());

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(embedding_responder)
        .mount(&server)
        .await;

    let settings = settings_for(notes_dir.path(), data_dir.path(), server.uri());
    let indexer = build_indexer(Arc::clone(&settings)).await;

    indexer.build_index().await.unwrap();

    let stats = indexer.stats().await.unwrap();
    assert_eq!(stats.total_documents, 2);
    assert!(stats.total_chunks >= 3, "long note should produce several chunks");

    // Vector count equals chunk count after every build
    assert_eq!(stats.vector_count as i64, stats.total_chunks);

    // The index and its id sidecar were published
    assert!(indexer.is_index_exists());

    // Chunk ids parse back to their doc and position; indices are dense
    let store = indexer.metadata_store();
    let short = store
        .get_document_by_path(&notes_dir.path().join("short-note.md").display().to_string())
        .await
        .unwrap()
        .expect("short note indexed");

    let chunks = store.get_chunks_by_doc(&short.doc_id).await.unwrap();
    assert!(!chunks.is_empty());
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i as i64);
        let (doc_id, index) = DocumentChunk::parse_id(&chunk.chunk_id).unwrap();
        assert_eq!(doc_id, short.doc_id);
        assert_eq!(index as i64, chunk.chunk_index);
    }

    // Tags and backlinks extracted from the raw content
    assert_eq!(
        store.get_tags(&short.doc_id).await.unwrap(),
        vec!["retrieval".to_string()]
    );
    assert_eq!(
        store.get_backlinks(&short.doc_id).await.unwrap(),
        vec!["Long Note".to_string()]
    );
    assert_eq!(
        store.get_backlinked_documents("Long Note").await.unwrap(),
        vec![short.doc_id.clone()]
    );

    indexer.close().await;
}

#[tokio::test]
async fn rebuild_is_idempotent_and_served_from_cache() {
    let notes_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    write_corpus(notes_dir.path());

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(embedding_responder)
        .expect(1..)
        .mount(&server)
        .await;

    let settings = settings_for(notes_dir.path(), data_dir.path(), server.uri());
    let indexer = build_indexer(Arc::clone(&settings)).await;

    indexer.build_index().await.unwrap();

    let store = indexer.metadata_store();
    let first_stats = indexer.stats().await.unwrap();
    let long = store
        .get_document_by_path(&notes_dir.path().join("long-note.md").display().to_string())
        .await
        .unwrap()
        .unwrap();
    let first_chunks = store.get_chunks_by_doc(&long.doc_id).await.unwrap();

    // From here on the embedding endpoint must not be needed at all
    server.reset().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    indexer.build_index().await.unwrap();

    let second_stats = indexer.stats().await.unwrap();
    assert_eq!(first_stats.total_documents, second_stats.total_documents);
    assert_eq!(first_stats.total_chunks, second_stats.total_chunks);
    assert_eq!(first_stats.vector_count, second_stats.vector_count);

    let second_long = store
        .get_document_by_path(&notes_dir.path().join("long-note.md").display().to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(long.doc_id, second_long.doc_id);
    assert_eq!(long.content_hash, second_long.content_hash);

    let second_chunks = store.get_chunks_by_doc(&long.doc_id).await.unwrap();
    assert_eq!(first_chunks.len(), second_chunks.len());
    for (a, b) in first_chunks.iter().zip(second_chunks.iter()) {
        assert_eq!(a.chunk_id, b.chunk_id);
        assert_eq!(a.content, b.content);
        assert_eq!(a.start_pos, b.start_pos);
        assert_eq!(a.end_pos, b.end_pos);
    }

    server.verify().await;
    indexer.close().await;
}

#[tokio::test]
async fn embedding_failure_aborts_the_build() {
    let notes_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    write_corpus(notes_dir.path());

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("rejected"))
        .mount(&server)
        .await;

    let settings = settings_for(notes_dir.path(), data_dir.path(), server.uri());
    let indexer = build_indexer(Arc::clone(&settings)).await;

    assert!(indexer.build_index().await.is_err());

    // Nothing partial was published
    assert!(!indexer.is_index_exists());

    indexer.close().await;
}
