//! Error handling for the note retrieval backend

use thiserror::Error;

/// Result type alias for noteseek
pub type Result<T> = std::result::Result<T, NoteseekError>;

/// Main error type for the backend
#[derive(Error, Debug)]
pub enum NoteseekError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error in {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chat completion error: {0}")]
    Chat(String),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// Errors from the remote embedding API
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Rate limited by embedding API")]
    RateLimited,

    #[error("Embedding request timed out")]
    Timeout,

    #[error("Embedding API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("Embedding failed after {0} attempts")]
    RetriesExhausted(u32),
}

/// Errors from the persistent stores (metadata DB, vector index, cache)
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store not initialized")]
    NotInitialized,

    #[error("Vector index not found at {0}")]
    IndexMissing(String),

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Corrupt index data: {0}")]
    Corrupt(String),

    #[error("Storage failed: {0}")]
    StorageFailed(String),
}

impl NoteseekError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NoteseekError::Embedding(EmbeddingError::RateLimited)
                | NoteseekError::Embedding(EmbeddingError::Timeout)
                | NoteseekError::Http(_)
        )
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            NoteseekError::Embedding(_) => "embedding",
            NoteseekError::Store(_) => "store",
            NoteseekError::Config(_) => "config",
            NoteseekError::Parse { .. } => "parse",
            NoteseekError::Io(_) => "io",
            NoteseekError::Serialization(_) => "serialization",
            NoteseekError::Http(_) => "http",
            NoteseekError::Database(_) => "database",
            NoteseekError::Chat(_) => "chat",
            NoteseekError::Generic(_) => "generic",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let rate_limited = NoteseekError::Embedding(EmbeddingError::RateLimited);
        assert!(rate_limited.is_retryable());

        let config_error = NoteseekError::Config("missing api key".to_string());
        assert!(!config_error.is_retryable());
    }

    #[test]
    fn test_error_category() {
        let embed_error = NoteseekError::Embedding(EmbeddingError::Timeout);
        assert_eq!(embed_error.category(), "embedding");

        let store_error = NoteseekError::Store(StoreError::NotInitialized);
        assert_eq!(store_error.category(), "store");
    }
}
