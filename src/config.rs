//! Configuration management for the note retrieval backend
//!
//! All settings come from a YAML file plus two environment variables:
//! `NOTES_DIRECTORY` overrides the notes root and `ARK_API_KEY` supplies the
//! API key for the embedding and chat endpoints (startup fails without it).
//! The resulting [`Settings`] value is immutable and passed into every
//! component constructor; components never read the environment themselves.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{NoteseekError, Result};

/// Notes corpus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotesConfig {
    /// Root directory scanned for Markdown files
    pub directory: PathBuf,

    /// Patterns excluded from the scan; `*.ext` matches by extension,
    /// anything else is treated as a glob
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

/// Embedding endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Base URL of the embeddings API
    pub api_base: String,

    /// Model identifier sent with every request
    pub model: String,

    /// Inputs per HTTP request
    pub batch_size: usize,

    /// Embedding vector dimension
    pub dimension: usize,

    /// Bound on concurrently in-flight batch requests
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

/// Chat completion endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the chat completions API
    pub api_base: String,

    /// Model identifier
    pub model: String,

    /// Sampling temperature
    pub temperature: f32,

    /// Maximum tokens to generate
    pub max_tokens: u32,
}

/// Time-decay re-ranking parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeDecayConfig {
    /// Notes modified within this many months count as recent
    pub recent_months: u32,

    /// Score multiplier for recent notes
    pub recent_boost: f32,

    /// Notes older than this many years are penalised
    pub old_years: u32,

    /// Score multiplier for old notes
    pub old_penalty: f32,
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Default share of the result budget served from local notes
    pub local_ratio: f32,

    /// Default share served from web search
    pub network_ratio: f32,

    /// Time-decay parameters
    pub time_decay: TimeDecayConfig,

    /// Maximum local results per query
    pub top_k_local: usize,

    /// Maximum web results per query
    pub top_k_network: usize,

    /// Minimum cosine similarity for a local hit
    pub similarity_threshold: f32,

    /// Chunks of context to include before a hit
    #[serde(default = "default_context_before")]
    pub context_before: usize,

    /// Chunks of context to include after a hit
    #[serde(default = "default_context_after")]
    pub context_after: usize,
}

/// Indexing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Target chunk size in characters
    pub chunk_size: usize,

    /// Overlap between adjacent chunks in characters
    pub chunk_overlap: usize,

    /// Chunks shorter than this are dropped
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,

    /// Re-index interval in seconds (informational; rebuilds are explicit)
    pub update_interval: u64,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the API server binds to
    pub backend_port: u16,

    /// Port the frontend is served from (used for CORS hints)
    pub frontend_port: u16,

    /// Allowed CORS origins; `*` allows any origin
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Storage layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding all persisted state
    pub data_dir: PathBuf,

    /// Metadata database file name within `data_dir`
    pub metadata_db: PathBuf,

    /// Vector index file name within `data_dir`
    pub vector_index: PathBuf,

    /// Cache directory name within `data_dir`
    pub cache_dir: PathBuf,
}

impl StorageConfig {
    /// Absolute path of the metadata database
    pub fn metadata_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.metadata_db)
    }

    /// Absolute path of the vector index file
    pub fn vector_index_path(&self) -> PathBuf {
        self.data_dir.join(&self.vector_index)
    }

    /// Absolute path of the embedding cache database
    pub fn embedding_cache_path(&self) -> PathBuf {
        self.data_dir.join("embedding_cache.db")
    }
}

fn default_max_concurrent() -> usize {
    6
}

fn default_context_before() -> usize {
    3
}

fn default_context_after() -> usize {
    2
}

fn default_min_chunk_size() -> usize {
    100
}

/// The YAML document as written on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileConfig {
    notes: NotesConfig,
    embedding: EmbeddingConfig,
    llm: LlmConfig,
    search: SearchConfig,
    indexing: IndexingConfig,
    server: ServerConfig,
    storage: StorageConfig,
}

/// Complete, validated application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub notes: NotesConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub indexing: IndexingConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,

    /// API key for the embedding and chat endpoints
    pub api_key: String,
}

impl Settings {
    /// Load settings from a YAML file, applying environment overrides.
    ///
    /// `NOTES_DIRECTORY` overrides `notes.directory`; `ARK_API_KEY` is
    /// required and its absence is a fatal configuration error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            NoteseekError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let mut file_config: FileConfig = serde_yml::from_str(&content)
            .map_err(|e| NoteseekError::Config(format!("Failed to parse config file: {}", e)))?;

        if let Ok(dir) = std::env::var("NOTES_DIRECTORY") {
            if !dir.is_empty() {
                file_config.notes.directory = PathBuf::from(dir);
            }
        }

        let api_key = std::env::var("ARK_API_KEY")
            .map_err(|_| NoteseekError::Config("ARK_API_KEY environment variable not set".into()))?;

        let settings = Self {
            notes: file_config.notes,
            embedding: file_config.embedding,
            llm: file_config.llm,
            search: file_config.search,
            indexing: file_config.indexing,
            server: file_config.server,
            storage: file_config.storage,
            api_key,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            return Err(NoteseekError::Config(
                "embedding.dimension must be greater than 0".into(),
            ));
        }

        if self.embedding.batch_size == 0 {
            return Err(NoteseekError::Config(
                "embedding.batch_size must be greater than 0".into(),
            ));
        }

        if self.embedding.max_concurrent == 0 {
            return Err(NoteseekError::Config(
                "embedding.max_concurrent must be greater than 0".into(),
            ));
        }

        if !self.embedding.api_base.starts_with("http") {
            return Err(NoteseekError::Config(format!(
                "Invalid embedding API base: {}",
                self.embedding.api_base
            )));
        }

        if !self.llm.api_base.starts_with("http") {
            return Err(NoteseekError::Config(format!(
                "Invalid LLM API base: {}",
                self.llm.api_base
            )));
        }

        if !(0.0..=1.0).contains(&self.search.local_ratio) {
            return Err(NoteseekError::Config(
                "search.local_ratio must be between 0.0 and 1.0".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.search.similarity_threshold) {
            return Err(NoteseekError::Config(
                "search.similarity_threshold must be between 0.0 and 1.0".into(),
            ));
        }

        if self.indexing.chunk_size <= self.indexing.min_chunk_size {
            return Err(NoteseekError::Config(
                "indexing.chunk_size must be greater than indexing.min_chunk_size".into(),
            ));
        }

        if self.indexing.chunk_overlap >= self.indexing.chunk_size {
            return Err(NoteseekError::Config(
                "indexing.chunk_overlap must be smaller than indexing.chunk_size".into(),
            ));
        }

        Ok(())
    }

    /// Ensure the storage directories exist
    pub fn prepare_storage(&self) -> Result<()> {
        std::fs::create_dir_all(&self.storage.data_dir)?;
        std::fs::create_dir_all(self.storage.data_dir.join(&self.storage.cache_dir))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_settings() -> Settings {
        Settings {
            notes: NotesConfig {
                directory: PathBuf::from("/tmp/notes"),
                exclude_patterns: vec!["*.tmp".to_string(), "logseq/bak/**".to_string()],
            },
            embedding: EmbeddingConfig {
                api_base: "https://ark.example.com".to_string(),
                model: "doubao-embedding".to_string(),
                batch_size: 16,
                dimension: 1024,
                max_concurrent: 6,
            },
            llm: LlmConfig {
                api_base: "https://ark.example.com".to_string(),
                model: "doubao-chat".to_string(),
                temperature: 0.7,
                max_tokens: 2048,
            },
            search: SearchConfig {
                local_ratio: 0.8,
                network_ratio: 0.2,
                time_decay: TimeDecayConfig {
                    recent_months: 3,
                    recent_boost: 1.5,
                    old_years: 1,
                    old_penalty: 0.8,
                },
                top_k_local: 16,
                top_k_network: 4,
                similarity_threshold: 0.3,
                context_before: 3,
                context_after: 2,
            },
            indexing: IndexingConfig {
                chunk_size: 300,
                chunk_overlap: 80,
                min_chunk_size: 100,
                update_interval: 3600,
            },
            server: ServerConfig {
                backend_port: 8800,
                frontend_port: 3000,
                cors_origins: vec!["*".to_string()],
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("/tmp/noteseek-data"),
                metadata_db: PathBuf::from("metadata.db"),
                vector_index: PathBuf::from("notes.index"),
                cache_dir: PathBuf::from("cache"),
            },
            api_key: "test-key".to_string(),
        }
    }

    #[test]
    fn test_valid_settings() {
        let settings = sample_settings();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_invalid_dimension() {
        let mut settings = sample_settings();
        settings.embedding.dimension = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_invalid_ratio() {
        let mut settings = sample_settings();
        settings.search.local_ratio = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk_size() {
        let mut settings = sample_settings();
        settings.indexing.chunk_overlap = 300;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_storage_paths() {
        let settings = sample_settings();
        assert_eq!(
            settings.storage.metadata_db_path(),
            PathBuf::from("/tmp/noteseek-data/metadata.db")
        );
        assert_eq!(
            settings.storage.vector_index_path(),
            PathBuf::from("/tmp/noteseek-data/notes.index")
        );
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = r#"
notes:
  directory: /home/user/logseq
  exclude_patterns: ["*.bak", "logseq/.recycle/**"]
embedding:
  api_base: https://ark.example.com
  model: doubao-embedding
  batch_size: 16
  dimension: 1024
llm:
  api_base: https://ark.example.com
  model: doubao-chat
  temperature: 0.7
  max_tokens: 2048
search:
  local_ratio: 0.8
  network_ratio: 0.2
  time_decay:
    recent_months: 3
    recent_boost: 1.5
    old_years: 1
    old_penalty: 0.8
  top_k_local: 16
  top_k_network: 4
  similarity_threshold: 0.3
indexing:
  chunk_size: 300
  chunk_overlap: 80
  update_interval: 3600
server:
  backend_port: 8800
  frontend_port: 3000
  cors_origins: ["http://localhost:3000"]
storage:
  data_dir: data
  metadata_db: metadata.db
  vector_index: notes.index
  cache_dir: cache
"#;
        let parsed: FileConfig = serde_yml::from_str(yaml).unwrap();
        assert_eq!(parsed.embedding.dimension, 1024);
        // Omitted fields fall back to defaults
        assert_eq!(parsed.embedding.max_concurrent, 6);
        assert_eq!(parsed.search.context_before, 3);
        assert_eq!(parsed.search.context_after, 2);
        assert_eq!(parsed.indexing.min_chunk_size, 100);
    }
}
