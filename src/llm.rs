//! Chat completion client
//!
//! Answers are synthesised by a remote chat-completions endpoint from the
//! retrieved local and web results. The [`ChatClient`] trait is the seam
//! the retriever depends on; [`ArkChatClient`] is the production
//! implementation. When the API fails the retriever falls back to
//! [`fallback_answer`], a deterministic assembly of the retrieved results.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::LlmConfig;
use crate::error::{NoteseekError, Result};
use crate::models::SearchResult;

const SYSTEM_PROMPT: &str = "你是一个智能笔记助手，负责根据用户的笔记内容和网络资源回答用户的问题。\
    请基于提供的检索结果生成准确、有用的答案。";

/// How many local results feed the prompt, and their per-result char budget
const PROMPT_LOCAL_RESULTS: usize = 5;
const PROMPT_LOCAL_CHARS: usize = 500;

/// Same for web results
const PROMPT_WEB_RESULTS: usize = 3;
const PROMPT_WEB_CHARS: usize = 400;

/// Trait for answer generation backends
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Generate an answer for the query grounded in the retrieved results
    async fn generate_answer(
        &self,
        query: &str,
        local_results: &[SearchResult],
        web_results: &[SearchResult],
    ) -> Result<String>;
}

/// Chat-completions client for the Ark endpoint
pub struct ArkChatClient {
    client: reqwest::Client,
    api_base: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
    #[serde(default)]
    total_tokens: Option<u32>,
}

impl ArkChatClient {
    pub fn new(config: &LlmConfig, api_key: &str) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| NoteseekError::Config(format!("Invalid API key: {}", e)))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl ChatClient for ArkChatClient {
    async fn generate_answer(
        &self,
        query: &str,
        local_results: &[SearchResult],
        web_results: &[SearchResult],
    ) -> Result<String> {
        let prompt = build_prompt(query, local_results, web_results);

        info!("Chat request (model={}, max_tokens={})", self.model, self.max_tokens);
        debug!("Prompt length: {} chars", prompt.chars().count());

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let url = format!("{}/v1/chat/completions", self.api_base);
        let response = self.client.post(&url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Chat API error {}: {}", status, body);
            return Err(NoteseekError::Chat(format!("HTTP {}: {}", status, body)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| NoteseekError::Chat(format!("invalid response: {}", e)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| NoteseekError::Chat("response carried no choices".into()))?;

        let answer = choice.message.content;
        let finish_reason = choice.finish_reason.as_deref().unwrap_or("unknown");
        info!(
            "Chat answer generated: finish_reason={}, {} chars",
            finish_reason,
            answer.chars().count()
        );

        // A length stop means the answer was cut off by max_tokens
        if finish_reason == "length" {
            warn!(
                "Answer truncated by max_tokens={}, consider raising it",
                self.max_tokens
            );
        }

        if let Some(usage) = parsed.usage {
            info!(
                "Token usage: prompt={:?}, completion={:?}, total={:?}",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            );
        }

        Ok(answer)
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Assemble the user prompt: query, local note excerpts, web excerpts and
/// the answering instructions biasing the model toward local notes
pub fn build_prompt(
    query: &str,
    local_results: &[SearchResult],
    web_results: &[SearchResult],
) -> String {
    let mut parts = vec![format!("用户问题：{}\n", query)];

    if !local_results.is_empty() {
        parts.push("\n## 本地笔记相关内容：\n".to_string());
        for (idx, result) in local_results.iter().take(PROMPT_LOCAL_RESULTS).enumerate() {
            parts.push(format!("\n{}. 【{}】", idx + 1, result.title));
            parts.push(format!(
                "{}...\n",
                truncate_chars(&result.content, PROMPT_LOCAL_CHARS)
            ));
        }
    }

    if !web_results.is_empty() {
        parts.push("\n## 网络资源相关内容：\n".to_string());
        for (idx, result) in web_results.iter().take(PROMPT_WEB_RESULTS).enumerate() {
            parts.push(format!("\n{}. 【{}】", idx + 1, result.title));
            parts.push(format!(
                "{}...\n",
                truncate_chars(&result.content, PROMPT_WEB_CHARS)
            ));
        }
    }

    parts.push(
        "\n\n## 回答要求：\n\
         1. 请基于上述检索结果回答用户的问题\n\
         2. 如果本地笔记有相关内容，优先使用本地笔记\n\
         3. 如果需要补充信息，可以参考网络资源\n\
         4. 回答要清晰、准确、有条理\n\
         5. 如果检索结果无法回答问题，请坦诚说明\n"
            .to_string(),
    );

    parts.concat()
}

/// Deterministic answer assembly used when the chat API is unavailable
pub fn fallback_answer(
    query: &str,
    local_results: &[SearchResult],
    web_results: &[SearchResult],
) -> String {
    warn!("Chat service unavailable, assembling fallback answer");

    let mut parts = vec![format!("关于「{}」，我找到了以下相关内容：\n", query)];

    if !local_results.is_empty() {
        parts.push("\n📚 本地笔记：".to_string());
        for (idx, result) in local_results.iter().take(PROMPT_LOCAL_RESULTS).enumerate() {
            parts.push(format!("\n{}. {}", idx + 1, result.title));
            parts.push(format!("   {}...", truncate_chars(&result.content, 100)));
        }
    }

    if !web_results.is_empty() {
        parts.push("\n\n🌐 网络资源：".to_string());
        for (idx, result) in web_results.iter().take(PROMPT_WEB_RESULTS).enumerate() {
            parts.push(format!("\n{}. {}", idx + 1, result.title));
            parts.push(format!("   {}...", truncate_chars(&result.content, 100)));
        }
    }

    parts.join("\n")
}
