//! Content-addressed embedding cache
//!
//! Persists computed embedding vectors keyed by `(sha256(text), model)` so
//! that re-indexing an unchanged corpus costs no API calls. Entries survive
//! index rebuilds; a warm cache turns a full rebuild into pure SQLite reads.

use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::Result;

/// SQLite-backed embedding cache
pub struct EmbeddingCache {
    pool: SqlitePool,
    cache_path: PathBuf,
}

impl EmbeddingCache {
    /// Open (or create) the cache database at the given path
    pub async fn open(cache_path: &Path) -> Result<Self> {
        if let Some(parent) = cache_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", cache_path.display()))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let cache = Self {
            pool,
            cache_path: cache_path.to_path_buf(),
        };
        cache.initialize().await?;

        info!("Embedding cache ready at {}", cache.cache_path.display());
        Ok(cache)
    }

    /// Open an in-memory cache (tests)
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let cache = Self {
            pool,
            cache_path: PathBuf::from(":memory:"),
        };
        cache.initialize().await?;
        Ok(cache)
    }

    /// Create the schema; safe to call repeatedly
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embedding_cache (
                content_hash TEXT NOT NULL,
                model TEXT NOT NULL,
                embedding BLOB NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (content_hash, model)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_cache_lookup
            ON embedding_cache(content_hash, model)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn compute_hash(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Encode a vector as a little-endian f32 BLOB
    pub fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(embedding.len() * 4);
        for v in embedding {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    /// Decode a little-endian f32 BLOB back into a vector
    pub fn deserialize_embedding(data: &[u8]) -> Vec<f32> {
        data.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    /// Look up a single cached vector
    pub async fn get(&self, text: &str, model: &str) -> Result<Option<Vec<f32>>> {
        let content_hash = Self::compute_hash(text);

        let row = sqlx::query(
            "SELECT embedding FROM embedding_cache WHERE content_hash = ? AND model = ?",
        )
        .bind(&content_hash)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let blob: Vec<u8> = r.get("embedding");
            Self::deserialize_embedding(&blob)
        }))
    }

    /// Bulk lookup; the result is aligned with `texts`, `None` marking misses
    pub async fn get_batch(&self, texts: &[String], model: &str) -> Result<Vec<Option<Vec<f32>>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let hashes: Vec<String> = texts.iter().map(|t| Self::compute_hash(t)).collect();

        let placeholders = vec!["?"; hashes.len()].join(",");
        let sql = format!(
            "SELECT content_hash, embedding FROM embedding_cache \
             WHERE content_hash IN ({}) AND model = ?",
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for hash in &hashes {
            query = query.bind(hash);
        }
        query = query.bind(model);

        let rows = query.fetch_all(&self.pool).await?;

        let mut found: HashMap<String, Vec<f32>> = HashMap::with_capacity(rows.len());
        for row in rows {
            let hash: String = row.get("content_hash");
            let blob: Vec<u8> = row.get("embedding");
            found.insert(hash, Self::deserialize_embedding(&blob));
        }

        Ok(hashes.iter().map(|h| found.get(h).cloned()).collect())
    }

    /// Store a single vector (last write wins)
    pub async fn set(&self, text: &str, model: &str, embedding: &[f32]) -> Result<()> {
        let content_hash = Self::compute_hash(text);

        sqlx::query(
            "INSERT OR REPLACE INTO embedding_cache (content_hash, model, embedding) \
             VALUES (?, ?, ?)",
        )
        .bind(&content_hash)
        .bind(model)
        .bind(Self::serialize_embedding(embedding))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Store many vectors in one transaction
    pub async fn set_batch(
        &self,
        texts: &[String],
        model: &str,
        embeddings: &[Vec<f32>],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for (text, embedding) in texts.iter().zip(embeddings.iter()) {
            sqlx::query(
                "INSERT OR REPLACE INTO embedding_cache (content_hash, model, embedding) \
                 VALUES (?, ?, ?)",
            )
            .bind(Self::compute_hash(text))
            .bind(model)
            .bind(Self::serialize_embedding(embedding))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Cached {} embeddings for model {}", texts.len(), model);
        Ok(())
    }

    /// Entry counts per model
    pub async fn stats(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT model, COUNT(*) as count FROM embedding_cache GROUP BY model",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("model"), row.get::<i64, _>("count")))
            .collect())
    }

    /// Drop all entries, or only those of one model
    pub async fn clear(&self, model: Option<&str>) -> Result<()> {
        match model {
            Some(m) => {
                sqlx::query("DELETE FROM embedding_cache WHERE model = ?")
                    .bind(m)
                    .execute(&self.pool)
                    .await?;
                info!("Cleared embedding cache for model {}", m);
            }
            None => {
                sqlx::query("DELETE FROM embedding_cache")
                    .execute(&self.pool)
                    .await?;
                info!("Cleared embedding cache");
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = "test-embedding-model";

    #[tokio::test]
    async fn test_set_then_get_is_fixed_point() {
        let cache = EmbeddingCache::open_in_memory().await.unwrap();

        let embedding = vec![0.25_f32, -1.5, 3.125];
        cache.set("测试文本", MODEL, &embedding).await.unwrap();

        let cached = cache.get("测试文本", MODEL).await.unwrap();
        assert_eq!(cached, Some(embedding));
    }

    #[tokio::test]
    async fn test_miss_returns_none() {
        let cache = EmbeddingCache::open_in_memory().await.unwrap();
        assert_eq!(cache.get("absent", MODEL).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_model_is_part_of_the_key() {
        let cache = EmbeddingCache::open_in_memory().await.unwrap();
        cache.set("text", "model-a", &[1.0]).await.unwrap();

        assert!(cache.get("text", "model-a").await.unwrap().is_some());
        assert!(cache.get("text", "model-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_partial_hits_keep_input_order() {
        let cache = EmbeddingCache::open_in_memory().await.unwrap();

        let texts = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let embeddings = vec![vec![0.1_f32], vec![0.2], vec![0.3]];
        cache.set_batch(&texts, MODEL, &embeddings).await.unwrap();

        let mixed = vec!["one".to_string(), "brand new".to_string(), "three".to_string()];
        let results = cache.get_batch(&mixed, MODEL).await.unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0], Some(vec![0.1]));
        assert_eq!(results[1], None);
        assert_eq!(results[2], Some(vec![0.3]));
    }

    #[tokio::test]
    async fn test_clear_by_model() {
        let cache = EmbeddingCache::open_in_memory().await.unwrap();
        cache.set("a", "model-a", &[1.0]).await.unwrap();
        cache.set("b", "model-b", &[2.0]).await.unwrap();

        cache.clear(Some("model-a")).await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert!(!stats.contains_key("model-a"));
        assert_eq!(stats.get("model-b"), Some(&1));
    }

    #[tokio::test]
    async fn test_stats_counts_per_model() {
        let cache = EmbeddingCache::open_in_memory().await.unwrap();
        cache.set("a", MODEL, &[1.0]).await.unwrap();
        cache.set("b", MODEL, &[2.0]).await.unwrap();
        // Overwriting does not add a row
        cache.set("a", MODEL, &[9.0]).await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.get(MODEL), Some(&2));
    }

    #[test]
    fn test_embedding_blob_roundtrip() {
        let embedding = vec![1.5_f32, -2.3, 0.0, 42.1];
        let blob = EmbeddingCache::serialize_embedding(&embedding);
        assert_eq!(blob.len(), 16);
        let restored = EmbeddingCache::deserialize_embedding(&blob);
        assert_eq!(embedding, restored);
    }
}
