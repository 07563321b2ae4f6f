//! Web search adapter
//!
//! Queries DuckDuckGo's HTML endpoint and enriches each hit with a
//! best-effort page fetch. Every failure path degrades to less data rather
//! than an error: a failed fetch falls back to the snippet, a failed search
//! returns an empty list and the retriever proceeds with local results only.

use chrono::Utc;
use futures::future::join_all;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
const MAX_QUERY_CHARS: usize = 500;
const MAX_CONTENT_CHARS: usize = 1000;
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// One web search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,

    /// Extracted page text, or the snippet when the fetch failed
    pub content: String,

    /// Always `"web"`
    pub source: String,

    /// RFC 3339 timestamp of the search
    pub fetched_at: String,
}

/// DuckDuckGo-backed search service
pub struct WebSearchService {
    client: reqwest::Client,
}

impl WebSearchService {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent("noteseek/0.1")
            .build()
            .unwrap_or_default();

        Self { client }
    }

    /// Search the web. The query is trimmed and truncated to 500 chars and
    /// `max_results` is clamped to `[1, 10]`. Returns an empty list on any
    /// total failure.
    pub async fn search(&self, query: &str, max_results: usize) -> Vec<WebSearchHit> {
        let query: String = query.trim().chars().take(MAX_QUERY_CHARS).collect();
        if query.is_empty() {
            warn!("Empty web search query");
            return Vec::new();
        }
        let max_results = max_results.clamp(1, 10);

        info!("Web search: {}", query);

        // Global region first, English region as the fallback
        let mut hits = match self.search_region(&query, max_results, "wt-wt").await {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Web search failed: {}", e);
                return Vec::new();
            }
        };

        if hits.is_empty() {
            hits = match self.search_region(&query, max_results, "us-en").await {
                Ok(hits) => hits,
                Err(e) => {
                    warn!("Web search fallback region failed: {}", e);
                    return Vec::new();
                }
            };
        }

        if hits.is_empty() {
            warn!("Web search returned no results for: {}", query);
            return Vec::new();
        }

        // Enrich every hit concurrently; failures keep the snippet
        let enriched = join_all(hits.into_iter().map(|hit| self.fetch_content(hit))).await;

        info!("Web search complete: {} results", enriched.len());
        enriched
    }

    async fn search_region(
        &self,
        query: &str,
        max_results: usize,
        region: &str,
    ) -> reqwest::Result<Vec<WebSearchHit>> {
        let response = self
            .client
            .post(SEARCH_ENDPOINT)
            .form(&[("q", query), ("kl", region)])
            .send()
            .await?
            .error_for_status()?;

        let html = response.text().await?;
        Ok(parse_search_page(&html, max_results))
    }

    /// Best-effort page fetch: strip scripts and styles, collapse
    /// whitespace, truncate. The snippet stands in when anything fails.
    async fn fetch_content(&self, mut hit: WebSearchHit) -> WebSearchHit {
        let fetched = async {
            let response = self
                .client
                .get(&hit.url)
                .send()
                .await?
                .error_for_status()?;
            response.text().await
        }
        .await;

        match fetched {
            Ok(html) => {
                hit.content = extract_page_text(&html, MAX_CONTENT_CHARS);
                debug!("Fetched page content: {}", hit.url);
            }
            Err(e) => {
                warn!("Page fetch failed for {}: {}", hit.url, e);
                hit.content = hit.snippet.clone();
            }
        }

        if hit.content.is_empty() {
            hit.content = hit.snippet.clone();
        }

        hit
    }
}

impl Default for WebSearchService {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse DuckDuckGo's HTML results page into hits
fn parse_search_page(html: &str, max_results: usize) -> Vec<WebSearchHit> {
    let document = Html::parse_document(html);
    let result_selector = Selector::parse("div.result").unwrap();
    let title_selector = Selector::parse("a.result__a").unwrap();
    let snippet_selector = Selector::parse("a.result__snippet").unwrap();

    let fetched_at = Utc::now().to_rfc3339();
    let mut hits = Vec::new();

    for result in document.select(&result_selector) {
        if hits.len() >= max_results {
            break;
        }

        let Some(anchor) = result.select(&title_selector).next() else {
            continue;
        };
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };

        let title = collapse_whitespace(&anchor.text().collect::<String>());
        if title.is_empty() {
            continue;
        }

        let snippet = result
            .select(&snippet_selector)
            .next()
            .map(|s| collapse_whitespace(&s.text().collect::<String>()))
            .unwrap_or_default();

        hits.push(WebSearchHit {
            title,
            url: absolute_url(href),
            snippet,
            content: String::new(),
            source: "web".to_string(),
            fetched_at: fetched_at.clone(),
        });
    }

    hits
}

/// Result links may be protocol-relative redirect URLs
fn absolute_url(href: &str) -> String {
    if let Some(rest) = href.strip_prefix("//") {
        format!("https://{}", rest)
    } else {
        href.to_string()
    }
}

/// Visible page text with scripts and styles removed, whitespace collapsed,
/// truncated to `max_chars`
fn extract_page_text(html: &str, max_chars: usize) -> String {
    let document = Html::parse_document(html);

    let mut text = String::new();
    for node in document.root_element().descendants() {
        if let scraper::Node::Text(fragment) = node.value() {
            let in_skipped = node
                .parent()
                .and_then(scraper::ElementRef::wrap)
                .map(|el| matches!(el.value().name(), "script" | "style" | "noscript"))
                .unwrap_or(false);
            if !in_skipped {
                text.push_str(fragment);
                text.push(' ');
            }
        }
    }

    let collapsed = collapse_whitespace(&text);
    if collapsed.chars().count() > max_chars {
        let truncated: String = collapsed.chars().take(max_chars).collect();
        format!("{}...", truncated)
    } else {
        collapsed
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
