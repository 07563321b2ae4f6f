//! HTTP API for the note retrieval backend
//!
//! REST endpoints for health, status, search and index rebuild, plus the
//! SSE chat endpoint. A chat request streams frames in a fixed order:
//! tool-call progress for each retrieval side, the answer text in small
//! fragments, one citations frame, then a final done frame.

use axum::{
    extract::{Query, State},
    http::{HeaderValue, StatusCode},
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Settings;
use crate::error::NoteseekError;
use crate::indexer::IndexerService;
use crate::models::{Citation, SearchResult};
use crate::retriever::RetrieverService;

/// Answer text is streamed in fragments of this many characters
const TEXT_FRAGMENT_CHARS: usize = 10;

/// Delay between consecutive text frames
const TEXT_FRAGMENT_DELAY: Duration = Duration::from_millis(50);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub indexer: Arc<IndexerService>,
    pub retriever: Arc<RetrieverService>,
}

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    service: String,
    status: String,
    version: String,
}

/// Index status response
#[derive(Debug, Serialize)]
struct StatusResponse {
    indexed_files: i64,
    total_chunks: i64,
    last_update: String,
    index_size_mb: f64,
}

/// Query parameters shared by the search and chat endpoints
#[derive(Debug, Deserialize)]
struct SearchParams {
    query: String,
    local_ratio: Option<f32>,
}

/// Search response body
#[derive(Debug, Serialize)]
struct SearchResponse {
    query: String,
    results: Vec<SearchResult>,
    total: usize,
}

/// Rebuild response body
#[derive(Debug, Serialize)]
struct RebuildResponse {
    status: String,
    message: String,
}

/// Error response body
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// One frame of the chat SSE stream
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatFrame {
    ToolCall {
        tool: &'static str,
        status: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        count: Option<usize>,
    },
    Text {
        content: String,
    },
    Citations {
        data: Vec<Citation>,
    },
    Done,
}

/// Internal errors surface as 500 with an `{error}` body; content issues
/// (empty results, no matches) are never errors
struct ApiError(NoteseekError);

impl From<NoteseekError> for ApiError {
    fn from(err: NoteseekError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("Request failed ({}): {}", self.0.category(), self.0);
        let body = Json(ErrorResponse {
            error: self.0.to_string(),
        });
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.settings.server.cors_origins);

    Router::new()
        .route("/", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/search", post(search_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/rebuild-index", post(rebuild_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| o.parse::<HeaderValue>().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Health check endpoint
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        service: "noteseek".to_string(),
        status: "running".to_string(),
        version: crate::VERSION.to_string(),
    })
}

/// Index status endpoint
async fn status_handler(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let stats = state.indexer.stats().await?;

    Ok(Json(StatusResponse {
        indexed_files: stats.total_documents,
        total_chunks: stats.total_chunks,
        last_update: stats.last_update,
        index_size_mb: stats.index_size_mb,
    }))
}

/// Hybrid search endpoint
async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResponse>> {
    let results = state
        .retriever
        .hybrid_search(&params.query, params.local_ratio)
        .await?;

    Ok(Json(SearchResponse {
        query: params.query,
        total: results.len(),
        results,
    }))
}

/// Streaming chat endpoint
async fn chat_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Sse<impl futures::Stream<Item = std::result::Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded::<Event>();

    tokio::spawn(run_chat_stream(state, params, tx));

    Sse::new(rx.map(Ok))
}

fn send_frame(tx: &UnboundedSender<Event>, frame: &ChatFrame) {
    match Event::default().json_data(frame) {
        // A closed channel means the client went away; in-flight work just
        // finishes with its sends dropped
        Ok(event) => {
            let _ = tx.unbounded_send(event);
        }
        Err(e) => error!("Failed to serialize SSE frame: {}", e),
    }
}

/// Drive one chat request: retrieval progress frames, answer fragments,
/// citations, done
async fn run_chat_stream(state: AppState, params: SearchParams, tx: UnboundedSender<Event>) {
    let query = params.query;
    let local_ratio = params
        .local_ratio
        .unwrap_or(state.settings.search.local_ratio);

    info!("Chat request: '{}' (local_ratio={})", query, local_ratio);

    let (local_k, web_k) = RetrieverService::split_budget(local_ratio);

    let local_results = if local_k > 0 {
        send_frame(
            &tx,
            &ChatFrame::ToolCall {
                tool: "local_search",
                status: "running",
                count: None,
            },
        );

        let results = match state.retriever.local_search(&query, local_k).await {
            Ok(results) => results,
            Err(e) => {
                error!("Local search failed mid-stream: {}", e);
                Vec::new()
            }
        };

        send_frame(
            &tx,
            &ChatFrame::ToolCall {
                tool: "local_search",
                status: "completed",
                count: Some(results.len()),
            },
        );
        results
    } else {
        Vec::new()
    };

    let web_results = if web_k > 0 {
        send_frame(
            &tx,
            &ChatFrame::ToolCall {
                tool: "web_search",
                status: "running",
                count: None,
            },
        );

        let results = state.retriever.web_search(&query, web_k).await;

        send_frame(
            &tx,
            &ChatFrame::ToolCall {
                tool: "web_search",
                status: "completed",
                count: Some(results.len()),
            },
        );
        results
    } else {
        Vec::new()
    };

    let mut all_results = local_results;
    all_results.extend(web_results);
    info!("Chat retrieval done: {} results", all_results.len());

    let answer = state.retriever.format_answer(&query, &all_results).await;

    for fragment in fragment_answer(&answer, TEXT_FRAGMENT_CHARS) {
        send_frame(&tx, &ChatFrame::Text { content: fragment });
        tokio::time::sleep(TEXT_FRAGMENT_DELAY).await;
    }

    let citations = state.retriever.format_citations(&all_results);
    send_frame(&tx, &ChatFrame::Citations { data: citations });

    send_frame(&tx, &ChatFrame::Done);
    info!("Chat stream complete");
}

/// Split an answer into fixed-size character fragments
fn fragment_answer(answer: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = answer.chars().collect();
    chars
        .chunks(size)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Trigger a full index rebuild
async fn rebuild_handler(State(state): State<AppState>) -> ApiResult<Json<RebuildResponse>> {
    info!("Rebuild requested");
    state.indexer.build_index().await?;

    Ok(Json(RebuildResponse {
        status: "success".to_string(),
        message: "Index rebuild complete".to_string(),
    }))
}

/// Start the API server
pub async fn start_server(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
