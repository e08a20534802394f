//! TOML configuration.
//!
//! A single file configures the database, object storage, chunking,
//! retrieval, embedding and ingestion. Sections other than `[db]` and
//! `[storage]` may be omitted and fall back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/course-context.sqlite"
//!
//! [storage]
//! backend = "s3"
//! bucket = "course-materials"
//! region = "us-east-1"
//!
//! [chunking]
//! chunk_size = 1000
//! chunk_overlap = 150
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-ada-002"
//! dims = 1536
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    Local,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Root directory for the `local` backend.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Tokenizer used for chunk lengths when the provider is `openai` and none
/// is configured: the cl100k vocabulary of `text-embedding-ada-002`.
pub const DEFAULT_OPENAI_TOKENIZER: &str = "Xenova/text-embedding-ada-002";

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LengthUnit {
    /// Tokens of the model named by `chunking.tokenizer`.
    Tokens,
    /// Roughly four characters per token.
    ApproxTokens,
    Chars,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,
    /// Defaults to `tokens` when a tokenizer is set, else `approx-tokens`.
    #[serde(default)]
    pub length_unit: Option<LengthUnit>,
    /// Local `tokenizer.json` path or Hugging Face Hub model id.
    #[serde(default)]
    pub tokenizer: Option<String>,
}

impl ChunkingConfig {
    pub fn unit(&self) -> LengthUnit {
        match (self.length_unit, &self.tokenizer) {
            (Some(unit), _) => unit,
            (None, Some(_)) => LengthUnit::Tokens,
            (None, None) => LengthUnit::ApproxTokens,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_chars: default_min_chunk_chars(),
            length_unit: None,
            tokenizer: None,
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    150
}
fn default_min_chunk_chars() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Write the monitor record from a spawned task instead of inline.
    #[serde(default = "default_defer_monitoring")]
    pub defer_monitoring: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            timeout_secs: default_timeout_secs(),
            defer_monitoring: default_defer_monitoring(),
        }
    }
}

fn default_top_k() -> usize {
    4
}
fn default_defer_monitoring() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_file_timeout_secs")]
    pub file_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            file_timeout_secs: default_file_timeout_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_file_timeout_secs() -> u64 {
    300
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;
    if config.embedding.provider == "openai" && config.chunking.tokenizer.is_none() {
        config.chunking.tokenizer = Some(DEFAULT_OPENAI_TOKENIZER.to_string());
    }
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        bail!(
            "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
            config.chunking.chunk_overlap,
            config.chunking.chunk_size
        );
    }

    if config.chunking.unit() == LengthUnit::Tokens && config.chunking.tokenizer.is_none() {
        bail!("chunking.tokenizer must be set when chunking.length_unit is 'tokens'");
    }

    // Validate retrieval
    if config.retrieval.default_top_k < 1 {
        bail!("retrieval.default_top_k must be >= 1");
    }
    if config.retrieval.timeout_secs == 0 {
        bail!("retrieval.timeout_secs must be > 0");
    }

    if config.ingest.workers < 1 {
        bail!("ingest.workers must be >= 1");
    }
    if config.ingest.file_timeout_secs == 0 {
        bail!("ingest.file_timeout_secs must be > 0");
    }

    // Validate storage
    match config.storage.backend {
        StorageBackend::S3 if config.storage.bucket.is_empty() => {
            bail!("storage.bucket must be set when backend is 's3'")
        }
        StorageBackend::Local if config.storage.root.is_none() => {
            bail!("storage.root must be set when backend is 'local'")
        }
        _ => {}
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" | "hash" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, local, or hash.",
            other
        ),
    }

    if matches!(config.embedding.provider.as_str(), "openai" | "ollama") {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    Ok(())
}
