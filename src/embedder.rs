//! Remote embedding client
//!
//! Wraps the `/v1/embeddings` endpoint with contiguous batching, a
//! semaphore-bounded concurrency fan-out, a read-through/write-through
//! embedding cache and a small retry ladder. Output order always matches
//! input order: batches are reassembled in slice order and every API
//! response is re-sorted by its server-supplied `index` field.

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::cache::EmbeddingCache;
use crate::config::EmbeddingConfig;
use crate::error::{EmbeddingError, Result};

const MAX_RETRIES: u32 = 3;

/// Batched, cache-fronted embedding client
pub struct EmbedderService {
    client: reqwest::Client,
    api_base: String,
    model: String,
    batch_size: usize,
    dimension: usize,
    semaphore: Arc<Semaphore>,
    cache: EmbeddingCache,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

impl EmbedderService {
    /// Build the client. Timeouts are split so that large response bodies
    /// do not trip the connect timeout: connect 30s, read 180s, with a
    /// small keep-alive pool.
    pub fn new(config: &EmbeddingConfig, api_key: &str, cache: EmbeddingCache) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| crate::error::NoteseekError::Config(format!("Invalid API key: {}", e)))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(180))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            batch_size: config.batch_size,
            dimension: config.dimension,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            cache,
        })
    }

    /// Embedding vector dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Model identifier used for API calls and cache keys
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embed a batch of texts, positionally aligned with the input.
    ///
    /// The input is partitioned into contiguous `batch_size` slices; at most
    /// `max_concurrent` slices are in flight at once. A slice that exhausts
    /// its retries fails the whole call.
    pub async fn embed_texts(
        &self,
        texts: &[String],
        show_progress: bool,
    ) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batches: Vec<&[String]> = texts.chunks(self.batch_size).collect();
        let total_batches = batches.len();

        let futures = batches.into_iter().enumerate().map(|(batch_idx, batch)| {
            let semaphore = Arc::clone(&self.semaphore);
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .expect("embedding semaphore closed");
                let embeddings = self.embed_batch_with_cache(batch).await?;
                if show_progress {
                    info!("Embedded batch {}/{}", batch_idx + 1, total_batches);
                }
                Ok::<Vec<Vec<f32>>, crate::error::NoteseekError>(embeddings)
            }
        });

        // try_join_all keeps slice order, so concurrency never reorders output
        let results = try_join_all(futures).await?;

        Ok(results.into_iter().flatten().collect())
    }

    /// Embed a single query text
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_texts(&[query.to_string()], false).await?;
        embeddings.pop().ok_or_else(|| {
            EmbeddingError::InvalidResponse("empty embedding response".into()).into()
        })
    }

    /// Cache-fronted embedding of one slice: hits come from the cache,
    /// only misses reach the API, and new vectors are written back.
    async fn embed_batch_with_cache(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let cached = self.cache.get_batch(texts, &self.model).await?;

        let miss_indices: Vec<usize> = cached
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_none())
            .map(|(i, _)| i)
            .collect();

        if miss_indices.is_empty() {
            debug!("Cache hit {}/{}", texts.len(), texts.len());
            return Ok(cached.into_iter().map(|c| c.unwrap()).collect());
        }

        debug!(
            "Cache hit {}/{}, requesting {}",
            texts.len() - miss_indices.len(),
            texts.len(),
            miss_indices.len()
        );

        let miss_texts: Vec<String> = miss_indices.iter().map(|&i| texts[i].clone()).collect();
        let new_embeddings = self.embed_batch(&miss_texts).await?;

        self.cache
            .set_batch(&miss_texts, &self.model, &new_embeddings)
            .await?;

        let mut result: Vec<Option<Vec<f32>>> = cached;
        for (miss_pos, embedding) in miss_indices.into_iter().zip(new_embeddings) {
            result[miss_pos] = Some(embedding);
        }

        Ok(result.into_iter().map(|c| c.unwrap()).collect())
    }

    /// One API call with the retry ladder:
    /// 429 → sleep 5×attempt s, read timeout → 2 s, other transient → 1 s,
    /// up to three attempts.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.api_base);
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        for attempt in 1..=MAX_RETRIES {
            debug!(
                "Embedding request: {} texts (attempt {}/{})",
                texts.len(),
                attempt,
                MAX_RETRIES
            );

            match self.client.post(&url).json(&body).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
                            EmbeddingError::InvalidResponse(e.to_string())
                        })?;
                        return self.extract_embeddings(parsed, texts.len());
                    }

                    if status.as_u16() == 429 {
                        let wait = Duration::from_secs(5 * attempt as u64);
                        warn!("Rate limited by embedding API, retrying in {:?}", wait);
                        if attempt == MAX_RETRIES {
                            return Err(EmbeddingError::RateLimited.into());
                        }
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    error!("Embedding API error {}: {}", status, body_text);
                    if attempt == MAX_RETRIES {
                        return Err(EmbeddingError::Api {
                            status: status.as_u16(),
                            body: body_text,
                        }
                        .into());
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) if e.is_timeout() => {
                    warn!("Embedding request timed out, retrying");
                    if attempt == MAX_RETRIES {
                        return Err(EmbeddingError::Timeout.into());
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Err(e) => {
                    error!("Embedding request failed: {}", e);
                    if attempt == MAX_RETRIES {
                        return Err(e.into());
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        Err(EmbeddingError::RetriesExhausted(MAX_RETRIES).into())
    }

    /// The server may return items in any order; re-sort by `index`
    fn extract_embeddings(
        &self,
        mut response: EmbeddingResponse,
        expected: usize,
    ) -> Result<Vec<Vec<f32>>> {
        if response.data.len() != expected {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                expected,
                response.data.len()
            ))
            .into());
        }

        response.data.sort_by_key(|d| d.index);

        for item in &response.data {
            if item.embedding.len() != self.dimension {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "expected dimension {}, got {}",
                    self.dimension,
                    item.embedding.len()
                ))
                .into());
            }
        }

        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }

    pub async fn close(&self) {
        self.cache.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EmbeddingConfig {
        EmbeddingConfig {
            api_base: "http://localhost:9".to_string(),
            model: "test-model".to_string(),
            batch_size: 2,
            dimension: 3,
            max_concurrent: 2,
        }
    }

    #[tokio::test]
    async fn test_extract_embeddings_sorts_by_index() {
        let cache = EmbeddingCache::open_in_memory().await.unwrap();
        let service = EmbedderService::new(&test_config(), "key", cache).unwrap();

        let response = EmbeddingResponse {
            data: vec![
                EmbeddingData {
                    index: 1,
                    embedding: vec![1.0, 1.0, 1.0],
                },
                EmbeddingData {
                    index: 0,
                    embedding: vec![0.0, 0.0, 0.0],
                },
            ],
        };

        let embeddings = service.extract_embeddings(response, 2).unwrap();
        assert_eq!(embeddings[0], vec![0.0, 0.0, 0.0]);
        assert_eq!(embeddings[1], vec![1.0, 1.0, 1.0]);
    }

    #[tokio::test]
    async fn test_extract_embeddings_rejects_wrong_count() {
        let cache = EmbeddingCache::open_in_memory().await.unwrap();
        let service = EmbedderService::new(&test_config(), "key", cache).unwrap();

        let response = EmbeddingResponse {
            data: vec![EmbeddingData {
                index: 0,
                embedding: vec![0.0, 0.0, 0.0],
            }],
        };

        assert!(service.extract_embeddings(response, 2).is_err());
    }

    #[tokio::test]
    async fn test_extract_embeddings_rejects_wrong_dimension() {
        let cache = EmbeddingCache::open_in_memory().await.unwrap();
        let service = EmbedderService::new(&test_config(), "key", cache).unwrap();

        let response = EmbeddingResponse {
            data: vec![EmbeddingData {
                index: 0,
                embedding: vec![0.0, 0.0],
            }],
        };

        assert!(service.extract_embeddings(response, 1).is_err());
    }

    #[tokio::test]
    async fn test_fully_cached_batch_needs_no_api() {
        let cache = EmbeddingCache::open_in_memory().await.unwrap();
        let texts = vec!["a".to_string(), "b".to_string()];
        cache
            .set_batch(
                &texts,
                "test-model",
                &[vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]],
            )
            .await
            .unwrap();

        // api_base points nowhere; a cache hit must not touch the network
        let service = EmbedderService::new(&test_config(), "key", cache).unwrap();
        let embeddings = service.embed_texts(&texts, false).await.unwrap();

        assert_eq!(embeddings[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(embeddings[1], vec![0.0, 1.0, 0.0]);
    }
}
