//! Index construction
//!
//! Orchestrates the build pipeline: scan the notes directory, parse and
//! clean each file, chunk, embed (batched and cached), persist metadata and
//! the vector index. Queries keep running against the previously published
//! index snapshot; a finished build swaps the snapshot under a write lock.

use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::Settings;
use crate::embedder::EmbedderService;
use crate::error::Result;
use crate::metadata_store::MetadataStore;
use crate::models::{Document, DocumentChunk};
use crate::parser::MarkdownParser;
use crate::vector_index::VectorIndex;

/// Index statistics exposed by the status endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStats {
    pub total_documents: i64,
    pub total_chunks: i64,
    pub total_tags: i64,
    pub vector_count: usize,
    pub last_update: String,
    pub index_size_mb: f64,
}

/// Builds and owns the searchable index
pub struct IndexerService {
    notes_dir: PathBuf,
    exclude_suffixes: Vec<String>,
    exclude_globs: GlobSet,
    settings: Arc<Settings>,
    parser: MarkdownParser,
    metadata_store: MetadataStore,
    embedder: EmbedderService,
    vector_index: RwLock<VectorIndex>,
}

impl IndexerService {
    pub fn new(
        settings: Arc<Settings>,
        metadata_store: MetadataStore,
        embedder: EmbedderService,
    ) -> Result<Self> {
        // `*.ext` patterns match by extension, everything else is a glob
        let mut exclude_suffixes = Vec::new();
        let mut glob_builder = GlobSetBuilder::new();
        for pattern in &settings.notes.exclude_patterns {
            if let Some(ext) = pattern.strip_prefix("*.") {
                exclude_suffixes.push(ext.to_string());
            } else {
                match Glob::new(pattern) {
                    Ok(glob) => {
                        glob_builder.add(glob);
                    }
                    Err(e) => warn!("Ignoring invalid exclude pattern '{}': {}", pattern, e),
                }
            }
        }
        let exclude_globs = glob_builder
            .build()
            .map_err(|e| crate::error::NoteseekError::Config(e.to_string()))?;

        let dimension = settings.embedding.dimension;

        Ok(Self {
            notes_dir: settings.notes.directory.clone(),
            exclude_suffixes,
            exclude_globs,
            settings,
            parser: MarkdownParser::new(),
            metadata_store,
            embedder,
            vector_index: RwLock::new(VectorIndex::new(dimension)),
        })
    }

    pub fn embedder(&self) -> &EmbedderService {
        &self.embedder
    }

    pub fn metadata_store(&self) -> &MetadataStore {
        &self.metadata_store
    }

    /// Search the current index snapshot
    pub async fn search_vectors(&self, query: &[f32], top_k: usize) -> Vec<(String, f32)> {
        self.vector_index.read().await.search(query, top_k)
    }

    /// True when both the metadata DB and the vector index files exist
    pub fn is_index_exists(&self) -> bool {
        self.settings.storage.metadata_db_path().exists()
            && VectorIndex::exists(&self.settings.storage.vector_index_path())
    }

    /// Load the persisted vector index into memory
    pub async fn load_index(&self) -> Result<()> {
        let index = VectorIndex::load(&self.settings.storage.vector_index_path())?;
        *self.vector_index.write().await = index;
        info!("Index loaded");
        Ok(())
    }

    /// Build the full index from scratch.
    ///
    /// Per-file parse failures are logged and skipped; an embedding failure
    /// (after retries) aborts the build so no partial index is published.
    pub async fn build_index(&self) -> Result<()> {
        info!("Scanning notes directory: {}", self.notes_dir.display());

        let files = self.scan_markdown_files();
        info!("Found {} Markdown files", files.len());

        if files.is_empty() {
            warn!("No Markdown files found, nothing to index");
            return Ok(());
        }

        let mut documents = Vec::new();
        for file_path in &files {
            match self.parse_document(file_path) {
                Ok(doc) => documents.push(doc),
                Err(e) => error!("Failed to parse {}: {}", file_path.display(), e),
            }
        }
        info!("Parsed {} documents", documents.len());

        let mut all_chunks = Vec::new();
        for doc in &documents {
            all_chunks.extend(self.chunk_document(doc));
        }
        info!("Produced {} chunks", all_chunks.len());

        // Embedding aborts the whole build on failure; the previous
        // snapshot stays live
        let texts: Vec<String> = all_chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embedder.embed_texts(&texts, true).await?;
        for (chunk, embedding) in all_chunks.iter_mut().zip(embeddings) {
            chunk.embedding = Some(embedding);
        }
        info!("Embedded {} chunks", all_chunks.len());

        for doc in &documents {
            self.store_document(doc).await?;
        }

        for chunk in &all_chunks {
            self.metadata_store
                .insert_chunk(
                    &chunk.chunk_id,
                    &chunk.doc_id,
                    &chunk.content,
                    chunk.chunk_index,
                    chunk.start_pos,
                    chunk.end_pos,
                )
                .await?;
        }

        let mut new_index = VectorIndex::new(self.settings.embedding.dimension);
        new_index.add(&all_chunks)?;
        new_index.save(&self.settings.storage.vector_index_path())?;

        *self.vector_index.write().await = new_index;

        info!("Index build complete");
        Ok(())
    }

    /// Walk the notes tree for `.md`/`.markdown` files, honouring excludes
    fn scan_markdown_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();

        for entry in WalkDir::new(&self.notes_dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();

            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if ext != "md" && ext != "markdown" {
                continue;
            }

            if self.is_excluded(path) {
                debug!("Excluded from scan: {}", path.display());
                continue;
            }

            files.push(path.to_path_buf());
        }

        files.sort();
        files
    }

    fn is_excluded(&self, path: &Path) -> bool {
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if self.exclude_suffixes.iter().any(|s| s == ext) {
                return true;
            }
        }

        let relative = path.strip_prefix(&self.notes_dir).unwrap_or(path);
        if self.exclude_globs.is_match(relative) {
            return true;
        }
        if let Some(name) = path.file_name() {
            if self.exclude_globs.is_match(name) {
                return true;
            }
        }

        false
    }

    /// Parse one file into a [`Document`] with cleaned content
    fn parse_document(&self, file_path: &Path) -> Result<Document> {
        let note = self.parser.parse_file(file_path)?;

        let backlinks = self.parser.extract_backlinks(&note.content);
        let tags = self.parser.extract_tags(&note.content);
        let content = self.parser.clean_content(&note.content);

        Ok(Document {
            file_path: file_path.to_path_buf(),
            content,
            title: note.title,
            created_at: note.created_at,
            modified_at: note.modified_at,
            tags,
            backlinks,
            metadata: note.metadata,
        })
    }

    /// Chunk a document, propagating parent metadata into every chunk
    fn chunk_document(&self, doc: &Document) -> Vec<DocumentChunk> {
        let indexing = &self.settings.indexing;
        let spans = self.parser.chunk_content(
            &doc.content,
            indexing.chunk_size,
            indexing.chunk_overlap,
            indexing.min_chunk_size,
        );

        let doc_id = self.generate_doc_id(&doc.file_path);

        spans
            .into_iter()
            .enumerate()
            .map(|(idx, span)| DocumentChunk {
                chunk_id: DocumentChunk::make_id(&doc_id, idx),
                doc_id: doc_id.clone(),
                content: span.text,
                chunk_index: idx,
                start_pos: span.start,
                end_pos: span.end,
                embedding: None,
                file_path: doc.file_path.display().to_string(),
                title: doc.title.clone(),
                tags: doc.tags.clone(),
                backlinks: doc.backlinks.clone(),
                created_at: doc.created_at,
                modified_at: doc.modified_at,
            })
            .collect()
    }

    /// Persist a document row with its tags and backlinks; chunk rows of a
    /// previous build are dropped first so indices stay dense
    async fn store_document(&self, doc: &Document) -> Result<()> {
        let doc_id = self.generate_doc_id(&doc.file_path);
        let content_hash = format!("{:x}", md5::compute(doc.content.as_bytes()));

        self.metadata_store
            .insert_document(
                &doc_id,
                &doc.file_path.display().to_string(),
                &doc.title,
                doc.created_at,
                doc.modified_at,
                &content_hash,
                &doc.metadata,
            )
            .await?;

        self.metadata_store.delete_chunks_by_doc(&doc_id).await?;
        self.metadata_store.insert_tags(&doc_id, &doc.tags).await?;
        self.metadata_store
            .insert_backlinks(&doc_id, &doc.backlinks)
            .await?;

        Ok(())
    }

    /// Document ids are the md5 of the path relative to the notes root
    fn generate_doc_id(&self, file_path: &Path) -> String {
        let relative = file_path.strip_prefix(&self.notes_dir).unwrap_or(file_path);
        format!("{:x}", md5::compute(relative.display().to_string().as_bytes()))
    }

    /// Index statistics for the status endpoint
    pub async fn stats(&self) -> Result<IndexStats> {
        let store_stats = self.metadata_store.stats().await?;
        let vector_count = self.vector_index.read().await.len();

        let index_path = self.settings.storage.vector_index_path();
        let index_size = std::fs::metadata(&index_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let index_size_mb = (index_size as f64 / 1024.0 / 1024.0 * 100.0).round() / 100.0;

        Ok(IndexStats {
            total_documents: store_stats.total_documents,
            total_chunks: store_stats.total_chunks,
            total_tags: store_stats.total_tags,
            vector_count,
            last_update: Utc::now().to_rfc3339(),
            index_size_mb,
        })
    }

    pub async fn close(&self) {
        self.metadata_store.close().await;
        self.embedder.close().await;
    }
}
