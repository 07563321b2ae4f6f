//! noteseek — retrieval-augmented question answering over Markdown notes
//!
//! Indexes a Logseq-style note corpus (wiki-link backlinks, hashtag tags)
//! into a vector index plus a relational metadata store, then answers
//! natural-language questions with a streamed, citation-backed synthesis
//! grounded in the notes and optionally supplemented by web search.
//!
//! The pipeline: scan → parse → chunk → embed (batched, concurrent,
//! cached) → persist. Queries run hybrid retrieval — vector search with
//! context expansion, time-decay and title-boost re-ranking, fused with a
//! web-search channel — and stream the answer over SSE.

pub mod api;
pub mod cache;
pub mod config;
pub mod embedder;
pub mod error;
pub mod indexer;
pub mod llm;
pub mod metadata_store;
pub mod models;
pub mod parser;
pub mod retriever;
pub mod vector_index;
pub mod web_search;

// Re-export main types
pub use cache::EmbeddingCache;
pub use config::Settings;
pub use embedder::EmbedderService;
pub use error::{EmbeddingError, NoteseekError, Result, StoreError};
pub use indexer::{IndexStats, IndexerService};
pub use llm::{ArkChatClient, ChatClient};
pub use metadata_store::MetadataStore;
pub use models::{Citation, Document, DocumentChunk, SearchResult};
pub use parser::MarkdownParser;
pub use retriever::RetrieverService;
pub use vector_index::VectorIndex;
pub use web_search::{WebSearchHit, WebSearchService};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
