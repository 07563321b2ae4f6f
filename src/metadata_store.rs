//! Relational metadata store (SQLite)
//!
//! Holds documents, chunks, tags and backlinks. Tags and backlinks follow a
//! replace-on-reindex discipline: the rows for a document are deleted and
//! re-inserted inside one transaction.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::Result;

/// A document row
#[derive(Debug, Clone)]
pub struct DocumentRow {
    pub doc_id: String,
    pub file_path: String,
    pub title: String,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub content_hash: String,
    pub metadata: serde_json::Value,
}

/// A chunk row
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub chunk_id: String,
    pub doc_id: String,
    pub content: String,
    pub chunk_index: i64,
    pub start_pos: i64,
    pub end_pos: i64,
}

/// Corpus-level counters
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub total_documents: i64,
    pub total_chunks: i64,
    pub total_tags: i64,
}

/// SQLite store for document/chunk metadata
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (or create) the database and bootstrap the schema
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize().await?;

        info!("Metadata store ready at {}", db_path.display());
        Ok(store)
    }

    /// Open an in-memory store (tests)
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                doc_id TEXT PRIMARY KEY,
                file_path TEXT UNIQUE NOT NULL,
                title TEXT,
                created_at TIMESTAMP,
                modified_at TIMESTAMP,
                content_hash TEXT,
                metadata TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                doc_id TEXT NOT NULL,
                content TEXT NOT NULL,
                chunk_index INTEGER,
                start_pos INTEGER,
                end_pos INTEGER,
                FOREIGN KEY (doc_id) REFERENCES documents(doc_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tags (
                tag_id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_id TEXT NOT NULL,
                tag_name TEXT NOT NULL,
                FOREIGN KEY (doc_id) REFERENCES documents(doc_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backlinks (
                link_id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_doc_id TEXT NOT NULL,
                target_page TEXT NOT NULL,
                FOREIGN KEY (source_doc_id) REFERENCES documents(doc_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for sql in [
            "CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id)",
            "CREATE INDEX IF NOT EXISTS idx_tags_doc ON tags(doc_id)",
            "CREATE INDEX IF NOT EXISTS idx_tags_name ON tags(tag_name)",
            "CREATE INDEX IF NOT EXISTS idx_backlinks_source ON backlinks(source_doc_id)",
            "CREATE INDEX IF NOT EXISTS idx_backlinks_target ON backlinks(target_page)",
        ] {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Upsert a document row; metadata is stored as JSON with time-typed
    /// values already normalised to RFC 3339 strings
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_document(
        &self,
        doc_id: &str,
        file_path: &str,
        title: &str,
        created_at: Option<DateTime<Utc>>,
        modified_at: Option<DateTime<Utc>>,
        content_hash: &str,
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO documents
            (doc_id, file_path, title, created_at, modified_at, content_hash, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(doc_id)
        .bind(file_path)
        .bind(title)
        .bind(created_at.map(|t| t.to_rfc3339()))
        .bind(modified_at.map(|t| t.to_rfc3339()))
        .bind(content_hash)
        .bind(serde_json::to_string(metadata)?)
        .execute(&self.pool)
        .await?;

        debug!("Stored document {}", doc_id);
        Ok(())
    }

    /// Upsert a chunk row
    pub async fn insert_chunk(
        &self,
        chunk_id: &str,
        doc_id: &str,
        content: &str,
        chunk_index: usize,
        start_pos: usize,
        end_pos: usize,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO chunks
            (chunk_id, doc_id, content, chunk_index, start_pos, end_pos)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chunk_id)
        .bind(doc_id)
        .bind(content)
        .bind(chunk_index as i64)
        .bind(start_pos as i64)
        .bind(end_pos as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Replace all tags for a document atomically
    pub async fn insert_tags(&self, doc_id: &str, tags: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM tags WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        for tag in tags {
            sqlx::query("INSERT INTO tags (doc_id, tag_name) VALUES (?, ?)")
                .bind(doc_id)
                .bind(tag)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Replace all backlinks for a document atomically
    pub async fn insert_backlinks(&self, doc_id: &str, backlinks: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM backlinks WHERE source_doc_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        for target in backlinks {
            sqlx::query("INSERT INTO backlinks (source_doc_id, target_page) VALUES (?, ?)")
                .bind(doc_id)
                .bind(target)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Fetch a chunk by id
    pub async fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRow>> {
        let row = sqlx::query(
            "SELECT chunk_id, doc_id, content, chunk_index, start_pos, end_pos \
             FROM chunks WHERE chunk_id = ?",
        )
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ChunkRow {
            chunk_id: r.get("chunk_id"),
            doc_id: r.get("doc_id"),
            content: r.get("content"),
            chunk_index: r.get("chunk_index"),
            start_pos: r.get("start_pos"),
            end_pos: r.get("end_pos"),
        }))
    }

    /// Fetch just a chunk's content (context expansion fast path)
    pub async fn get_chunk_content(&self, chunk_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT content FROM chunks WHERE chunk_id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("content")))
    }

    /// Fetch a document by id
    pub async fn get_document(&self, doc_id: &str) -> Result<Option<DocumentRow>> {
        let row = sqlx::query(
            "SELECT doc_id, file_path, title, created_at, modified_at, content_hash, metadata \
             FROM documents WHERE doc_id = ?",
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(document_from_row))
    }

    /// Fetch a document by file path
    pub async fn get_document_by_path(&self, file_path: &str) -> Result<Option<DocumentRow>> {
        let row = sqlx::query(
            "SELECT doc_id, file_path, title, created_at, modified_at, content_hash, metadata \
             FROM documents WHERE file_path = ?",
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(document_from_row))
    }

    /// All chunks of a document in chunk order
    pub async fn get_chunks_by_doc(&self, doc_id: &str) -> Result<Vec<ChunkRow>> {
        let rows = sqlx::query(
            "SELECT chunk_id, doc_id, content, chunk_index, start_pos, end_pos \
             FROM chunks WHERE doc_id = ? ORDER BY chunk_index",
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ChunkRow {
                chunk_id: r.get("chunk_id"),
                doc_id: r.get("doc_id"),
                content: r.get("content"),
                chunk_index: r.get("chunk_index"),
                start_pos: r.get("start_pos"),
                end_pos: r.get("end_pos"),
            })
            .collect())
    }

    /// Tags of a document
    pub async fn get_tags(&self, doc_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT tag_name FROM tags WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|r| r.get("tag_name")).collect())
    }

    /// Backlink targets of a document
    pub async fn get_backlinks(&self, doc_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT target_page FROM backlinks WHERE source_doc_id = ?")
            .bind(doc_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|r| r.get("target_page")).collect())
    }

    /// Ids of documents carrying a tag
    pub async fn get_documents_by_tag(&self, tag_name: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT doc_id FROM tags WHERE tag_name = ?")
            .bind(tag_name)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|r| r.get("doc_id")).collect())
    }

    /// Ids of documents that reference a page
    pub async fn get_backlinked_documents(&self, target_page: &str) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT DISTINCT source_doc_id FROM backlinks WHERE target_page = ?")
                .bind(target_page)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|r| r.get("source_doc_id")).collect())
    }

    /// Corpus counters: documents, chunks, distinct tags
    pub async fn stats(&self) -> Result<StoreStats> {
        let doc_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let chunk_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let tag_count: (i64,) = sqlx::query_as("SELECT COUNT(DISTINCT tag_name) FROM tags")
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreStats {
            total_documents: doc_count.0,
            total_chunks: chunk_count.0,
            total_tags: tag_count.0,
        })
    }

    /// Delete all chunks of a document (used before re-inserting on rebuild)
    pub async fn delete_chunks_by_doc(&self, doc_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn document_from_row(r: sqlx::sqlite::SqliteRow) -> DocumentRow {
    let created_at: Option<String> = r.get("created_at");
    let modified_at: Option<String> = r.get("modified_at");
    let metadata: Option<String> = r.get("metadata");

    DocumentRow {
        doc_id: r.get("doc_id"),
        file_path: r.get("file_path"),
        title: r.get::<Option<String>, _>("title").unwrap_or_default(),
        created_at: created_at.and_then(parse_timestamp),
        modified_at: modified_at.and_then(parse_timestamp),
        content_hash: r
            .get::<Option<String>, _>("content_hash")
            .unwrap_or_default(),
        metadata: metadata
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or(serde_json::Value::Null),
    }
}

fn parse_timestamp(s: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
