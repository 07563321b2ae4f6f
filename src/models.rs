//! Core data types: documents, chunks, search results, citations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A parsed note with its extracted metadata
#[derive(Debug, Clone)]
pub struct Document {
    /// Absolute path of the source file
    pub file_path: PathBuf,

    /// Cleaned body text (markup stripped)
    pub content: String,

    /// Title from front matter, falling back to the file stem
    pub title: String,

    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,

    /// Hashtags found in the raw content
    pub tags: Vec<String>,

    /// Wiki-link targets `[[page]]` found in the raw content
    pub backlinks: Vec<String>,

    /// Front-matter pass-through; time-typed values are RFC 3339 strings
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// A contiguous slice of a document's cleaned content, the unit of
/// embedding and retrieval
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    /// `"{doc_id}_chunk_{index}"`
    pub chunk_id: String,

    /// Parent document id
    pub doc_id: String,

    pub content: String,

    /// 0-based ordinal within the document, dense and strictly increasing
    pub chunk_index: usize,

    /// Character offset range `[start_pos, end_pos)` into the cleaned content
    pub start_pos: usize,
    pub end_pos: usize,

    /// Present only between embedding and index insertion
    pub embedding: Option<Vec<f32>>,

    // Metadata propagated from the parent document
    pub file_path: String,
    pub title: String,
    pub tags: Vec<String>,
    pub backlinks: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// One retrieval hit, from either the local index or the web
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// For local hits this is the context-expanded content
    pub content: String,

    pub file_path: String,
    pub title: String,

    /// Final score after time-decay and title-boost weighting
    pub score: f32,

    /// `"local"` or `"web"`
    pub source: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub backlinks: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Set for web results only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A deduplicated source reference attached to a streamed answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    /// 1-based, assigned in descending score order
    pub id: usize,

    pub title: String,
    pub source: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl DocumentChunk {
    /// Compose the chunk id for a document position
    pub fn make_id(doc_id: &str, index: usize) -> String {
        format!("{}_chunk_{}", doc_id, index)
    }

    /// Split a chunk id back into `(doc_id, chunk_index)`
    pub fn parse_id(chunk_id: &str) -> Option<(&str, usize)> {
        let (doc_id, idx) = chunk_id.rsplit_once("_chunk_")?;
        let index = idx.parse().ok()?;
        Some((doc_id, index))
    }
}
