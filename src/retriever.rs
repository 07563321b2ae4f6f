//! Hybrid retrieval
//!
//! Local retrieval runs the query embedding against the vector index,
//! expands each hit with neighbouring chunks, and re-ranks with time-decay
//! and title-boost weights. Web retrieval goes through the search adapter.
//! Both sides share a fixed result budget split by `local_ratio` and run
//! concurrently.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{SearchConfig, TimeDecayConfig};
use crate::error::Result;
use crate::indexer::IndexerService;
use crate::llm::{self, ChatClient};
use crate::models::{Citation, DocumentChunk, SearchResult};
use crate::web_search::WebSearchService;

/// Combined result budget for one hybrid query
const TOTAL_RESULTS: usize = 20;

/// Fixed score assigned to web hits
const WEB_RESULT_SCORE: f32 = 0.5;

/// Stopwords excluded from title-boost keywords: CJK function/noise words,
/// English articles and prepositions, and domain noise
const STOPWORDS: &[&str] = &[
    "的", "了", "和", "是", "在", "有", "我", "你", "他", "她", "它",
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for",
    "告诉", "笔记", "中", "哪些", "相关", "信息", "关于", "有关", "么", "吗",
    "note", "notes", "about",
];

/// Hybrid search service
pub struct RetrieverService {
    indexer: Arc<IndexerService>,
    web_search: WebSearchService,
    chat: Box<dyn ChatClient>,
    search_config: SearchConfig,
}

/// Chunk data joined with its document and expanded with neighbours
struct ChunkContext {
    extended_content: String,
    file_path: String,
    title: String,
    tags: Vec<String>,
    backlinks: Vec<String>,
    created_at: Option<DateTime<Utc>>,
    modified_at: Option<DateTime<Utc>>,
}

impl RetrieverService {
    pub fn new(
        indexer: Arc<IndexerService>,
        web_search: WebSearchService,
        chat: Box<dyn ChatClient>,
        search_config: SearchConfig,
    ) -> Self {
        Self {
            indexer,
            web_search,
            chat,
            search_config,
        }
    }

    /// Split the result budget between the local and web sides
    pub fn split_budget(local_ratio: f32) -> (usize, usize) {
        let ratio = local_ratio.clamp(0.0, 1.0);
        let local_k = (TOTAL_RESULTS as f32 * ratio).floor() as usize;
        let web_k = (TOTAL_RESULTS as f32 * (1.0 - ratio)).floor() as usize;
        (local_k, web_k)
    }

    /// Hybrid search over local notes and the web, merged and sorted by
    /// final score descending. A side whose share of the budget is zero is
    /// skipped entirely.
    pub async fn hybrid_search(
        &self,
        query: &str,
        local_ratio: Option<f32>,
    ) -> Result<Vec<SearchResult>> {
        let ratio = local_ratio.unwrap_or(self.search_config.local_ratio);
        let (local_k, web_k) = Self::split_budget(ratio);

        info!(
            "Hybrid search: local_ratio={:.2}, local_k={}, web_k={}",
            ratio, local_k, web_k
        );

        let (local_results, web_results) = tokio::join!(
            async {
                if local_k > 0 {
                    match self.local_search(query, local_k).await {
                        Ok(results) => results,
                        Err(e) => {
                            error!("Local search failed: {}", e);
                            Vec::new()
                        }
                    }
                } else {
                    debug!("Skipping local search (local_k=0)");
                    Vec::new()
                }
            },
            async {
                if web_k > 0 {
                    self.web_search(query, web_k).await
                } else {
                    debug!("Skipping web search (web_k=0)");
                    Vec::new()
                }
            }
        );

        let mut all_results = local_results;
        all_results.extend(web_results);
        all_results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(all_results)
    }

    /// Vector search with context expansion and re-ranking.
    ///
    /// The index is oversampled at `3 × top_k` so that threshold filtering
    /// and the re-ranking weights still leave enough candidates.
    pub async fn local_search(&self, query: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        info!("Local search: \"{}\", top_k={}", query, top_k);

        let query_vector = self.indexer.embedder().embed_query(query).await?;
        let candidates = self.indexer.search_vectors(&query_vector, top_k * 3).await;

        if candidates.is_empty() {
            warn!("No similar chunks found");
            return Ok(Vec::new());
        }

        debug!("Vector search returned {} candidates", candidates.len());

        let threshold = self.search_config.similarity_threshold;
        let mut results = Vec::new();

        for (chunk_id, similarity) in &candidates {
            // Threshold applies to raw similarity, before any boost
            if *similarity < threshold {
                continue;
            }

            let Some(context) = self
                .chunk_context(
                    chunk_id,
                    self.search_config.context_before,
                    self.search_config.context_after,
                )
                .await?
            else {
                continue;
            };

            let time_weight = time_decay_weight(&self.search_config.time_decay, context.modified_at);
            let boost = title_boost(query, &context.title);
            let final_score = similarity * time_weight * boost;

            results.push(SearchResult {
                content: context.extended_content,
                file_path: context.file_path,
                title: context.title,
                score: final_score,
                source: "local".to_string(),
                chunk_id: Some(chunk_id.clone()),
                tags: context.tags,
                backlinks: context.backlinks,
                created_at: context.created_at,
                url: None,
            });
        }

        info!(
            "Similarity filter: {} -> {} (threshold={})",
            candidates.len(),
            results.len(),
            threshold
        );

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(top_k);

        info!("Local search complete: {} results", results.len());
        Ok(results)
    }

    /// Web search mapped onto [`SearchResult`]s with a fixed score
    pub async fn web_search(&self, query: &str, top_k: usize) -> Vec<SearchResult> {
        let hits = self.web_search.search(query, top_k).await;

        hits.into_iter()
            .map(|hit| {
                let content = if hit.content.is_empty() {
                    hit.snippet
                } else {
                    hit.content
                };
                SearchResult {
                    content,
                    file_path: String::new(),
                    title: hit.title,
                    score: WEB_RESULT_SCORE,
                    source: "web".to_string(),
                    chunk_id: None,
                    tags: vec![],
                    backlinks: vec![],
                    created_at: None,
                    url: Some(hit.url),
                }
            })
            .collect()
    }

    /// Fetch a hit chunk joined with its document row and expanded with its
    /// neighbours: `context_before` chunks back (clamped at the document
    /// head) and `context_after` chunks forward, stopping at the first
    /// missing neighbour. Contents are joined with blank lines.
    async fn chunk_context(
        &self,
        chunk_id: &str,
        context_before: usize,
        context_after: usize,
    ) -> Result<Option<ChunkContext>> {
        let store = self.indexer.metadata_store();

        let Some(chunk) = store.get_chunk(chunk_id).await? else {
            return Ok(None);
        };
        let Some((doc_id, chunk_index)) = DocumentChunk::parse_id(chunk_id) else {
            return Ok(None);
        };
        let Some(document) = store.get_document(doc_id).await? else {
            return Ok(None);
        };

        let tags = store.get_tags(doc_id).await?;
        let backlinks = store.get_backlinks(doc_id).await?;

        let mut contents = Vec::new();

        for i in chunk_index.saturating_sub(context_before)..chunk_index {
            let neighbour_id = DocumentChunk::make_id(doc_id, i);
            if let Some(content) = store.get_chunk_content(&neighbour_id).await? {
                contents.push(content);
            }
        }

        contents.push(chunk.content);

        for i in (chunk_index + 1)..=(chunk_index + context_after) {
            let neighbour_id = DocumentChunk::make_id(doc_id, i);
            match store.get_chunk_content(&neighbour_id).await? {
                Some(content) => contents.push(content),
                None => break,
            }
        }

        Ok(Some(ChunkContext {
            extended_content: contents.join("\n\n"),
            file_path: document.file_path,
            title: document.title,
            tags,
            backlinks,
            created_at: document.created_at,
            modified_at: document.modified_at,
        }))
    }

    /// Produce the final answer text, degrading to a deterministic
    /// assembly of the results when the chat API fails
    pub async fn format_answer(&self, query: &str, results: &[SearchResult]) -> String {
        let local: Vec<SearchResult> = results
            .iter()
            .filter(|r| r.source == "local")
            .cloned()
            .collect();
        let web: Vec<SearchResult> = results
            .iter()
            .filter(|r| r.source == "web")
            .cloned()
            .collect();

        info!(
            "Generating answer: {} local, {} web results",
            local.len(),
            web.len()
        );

        match self.chat.generate_answer(query, &local, &web).await {
            Ok(answer) => answer,
            Err(e) => {
                error!("Answer generation failed: {}", e);
                llm::fallback_answer(query, &local, &web)
            }
        }
    }

    /// Deduplicate results into citations: one entry per file (local) or
    /// URL (web), keeping the highest-scoring representative, ids assigned
    /// in descending score order
    pub fn format_citations(&self, results: &[SearchResult]) -> Vec<Citation> {
        let mut best: HashMap<String, &SearchResult> = HashMap::new();

        for result in results {
            let key = if result.source == "web" {
                result.url.clone().unwrap_or_default()
            } else {
                result.file_path.clone()
            };
            if key.is_empty() {
                continue;
            }

            let replace = match best.get(&key) {
                Some(existing) => result.score > existing.score,
                None => true,
            };
            if replace {
                best.insert(key, result);
            }
        }

        let mut unique: Vec<&SearchResult> = best.into_values().collect();
        unique.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let citations: Vec<Citation> = unique
            .into_iter()
            .enumerate()
            .map(|(idx, result)| {
                if result.source == "local" {
                    Citation {
                        id: idx + 1,
                        title: result.title.clone(),
                        source: result.source.clone(),
                        file_path: Some(result.file_path.clone()),
                        tags: Some(result.tags.clone()),
                        created_at: result.created_at,
                        url: None,
                    }
                } else {
                    Citation {
                        id: idx + 1,
                        title: result.title.clone(),
                        source: result.source.clone(),
                        file_path: None,
                        tags: None,
                        created_at: None,
                        url: result.url.clone(),
                    }
                }
            })
            .collect();

        info!(
            "Citations: {} results -> {} unique sources",
            results.len(),
            citations.len()
        );
        citations
    }
}

/// Multiplicative time-decay weight for a document's modification time.
///
/// Recently modified notes (within `recent_months`) are boosted, notes
/// older than `old_years` are penalised, everything between is neutral.
/// A missing timestamp is neutral.
pub fn time_decay_weight(config: &TimeDecayConfig, modified_at: Option<DateTime<Utc>>) -> f32 {
    let Some(modified_at) = modified_at else {
        return 1.0;
    };

    let delta = Utc::now().signed_duration_since(modified_at);

    if delta < Duration::days(config.recent_months as i64 * 30) {
        return config.recent_boost;
    }
    if delta > Duration::days(config.old_years as i64 * 365) {
        return config.old_penalty;
    }

    1.0
}

/// Multiplicative title-match boost in `[1.0, 2.0]`.
///
/// Query keywords are matched against the case-folded title by substring;
/// the boost is `1 + matched / total`. ASCII tokens contribute whole words,
/// non-ASCII tokens contribute their character 2-grams and 3-grams.
pub fn title_boost(query: &str, title: &str) -> f32 {
    if query.is_empty() || title.is_empty() {
        return 1.0;
    }

    let title_lower = title.to_lowercase();
    let keywords = query_keywords(query);

    if keywords.is_empty() {
        return 1.0;
    }

    let matched = keywords
        .iter()
        .filter(|k| title_lower.contains(k.as_str()))
        .count();

    let coverage = matched as f32 / keywords.len() as f32;
    let boost = 1.0 + coverage;

    if boost > 1.1 {
        debug!(
            "Title boost: '{}' -> {:.2}x (coverage {:.0}%)",
            title,
            boost,
            coverage * 100.0
        );
    }

    boost
}

/// Extract boost keywords from a query
fn query_keywords(query: &str) -> HashSet<String> {
    let stopwords: HashSet<&str> = STOPWORDS.iter().copied().collect();
    let query_lower = query.to_lowercase();

    let mut keywords = HashSet::new();

    for token in query_lower.split(|c: char| c.is_whitespace() || "，。！？、,.!?;:：；".contains(c))
    {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        if token.is_ascii() {
            if token.len() >= 2 && !stopwords.contains(token) {
                keywords.insert(token.to_string());
            }
        } else {
            let chars: Vec<char> = token.chars().collect();
            for size in [2_usize, 3] {
                if chars.len() < size {
                    continue;
                }
                for window in chars.windows(size) {
                    let word: String = window.iter().collect();
                    if !stopwords.contains(word.as_str()) && !word.is_ascii() {
                        keywords.insert(word);
                    }
                }
            }
        }
    }

    keywords
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decay_config() -> TimeDecayConfig {
        TimeDecayConfig {
            recent_months: 3,
            recent_boost: 1.5,
            old_years: 1,
            old_penalty: 0.8,
        }
    }

    #[test]
    fn test_time_decay_recent() {
        let modified = Utc::now() - Duration::days(10);
        assert_eq!(time_decay_weight(&decay_config(), Some(modified)), 1.5);
    }

    #[test]
    fn test_time_decay_old() {
        let modified = Utc::now() - Duration::days(400);
        assert_eq!(time_decay_weight(&decay_config(), Some(modified)), 0.8);
    }

    #[test]
    fn test_time_decay_middle() {
        let modified = Utc::now() - Duration::days(180);
        assert_eq!(time_decay_weight(&decay_config(), Some(modified)), 1.0);
    }

    #[test]
    fn test_time_decay_missing_timestamp() {
        assert_eq!(time_decay_weight(&decay_config(), None), 1.0);
    }

    #[test]
    fn test_title_boost_half_coverage() {
        // {logseq, usage}: "logseq" matches, "usage" does not
        let boost = title_boost("Logseq usage", "Logseq tips");
        assert!((boost - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_title_boost_full_coverage() {
        let boost = title_boost("logseq tips", "Logseq Tips and Tricks");
        assert!((boost - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_title_boost_case_insensitive() {
        let lower = title_boost("logseq usage", "logseq tips");
        let upper = title_boost("LOGSEQ USAGE", "Logseq Tips");
        assert!((lower - upper).abs() < 1e-6);
    }

    #[test]
    fn test_title_boost_no_keywords() {
        // Only stopwords and single letters: no keywords, neutral boost
        assert_eq!(title_boost("the a an", "Anything"), 1.0);
        assert_eq!(title_boost("", "Title"), 1.0);
        assert_eq!(title_boost("query", ""), 1.0);
    }

    #[test]
    fn test_title_boost_cjk_ngrams() {
        // "读书笔记" contributes 2-grams and 3-grams; the title contains them
        let boost = title_boost("读书方法", "读书方法总结");
        assert!(boost > 1.9);
    }

    #[test]
    fn test_title_boost_range() {
        let boost = title_boost("rust async tokio runtime", "Rust notes");
        assert!((1.0..=2.0).contains(&boost));
    }

    #[test]
    fn test_query_keywords_filters_stopwords() {
        let keywords = query_keywords("the rust book");
        assert!(keywords.contains("rust"));
        assert!(keywords.contains("book"));
        assert!(!keywords.contains("the"));
    }

    #[test]
    fn test_query_keywords_cjk_ngrams() {
        let keywords = query_keywords("读书方法");
        assert!(keywords.contains("读书"));
        assert!(keywords.contains("方法"));
        assert!(keywords.contains("读书方"));
    }

    #[test]
    fn test_split_budget() {
        // 1 - 0.8 is just under 0.2 in binary floating point, so the web
        // share floors to 3
        assert_eq!(RetrieverService::split_budget(0.8), (16, 3));
        assert_eq!(RetrieverService::split_budget(1.0), (20, 0));
        assert_eq!(RetrieverService::split_budget(0.0), (0, 20));
        assert_eq!(RetrieverService::split_budget(0.5), (10, 10));
        // Out-of-range ratios are clamped
        assert_eq!(RetrieverService::split_budget(1.7), (20, 0));
    }
}
