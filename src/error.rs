//! Typed errors for the ingestion and retrieval pipelines.
//!
//! Per-file errors ([`ExtractError`], [`UpsertError`], [`IngestError`]) are
//! caught by bulk ingestion and folded into the batch report. Retrieval
//! returns [`RetrievalError`] instead of a partial result list, so callers
//! tell success from failure by type. Storage and configuration plumbing
//! below these layers uses `anyhow`.

use thiserror::Error;

/// Download or format-parsing failure for a single source file.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    UnsupportedFormat(String),
    #[error("download of '{key}' failed: {message}")]
    Download { key: String, message: String },
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("SRT parsing failed: {0}")]
    Srt(String),
    #[error("thumbnail generation failed: {0}")]
    Thumbnail(String),
    #[error("temporary file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Violation of the chunker's input contract.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkingError {
    #[error("must have equal number of text strings and metadata entries (got {texts} texts, {metadatas} metadatas)")]
    LengthMismatch { texts: usize, metadatas: usize },
}

/// Failure while embedding chunks or writing them to storage.
#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("embedding provider returned {got} vectors for {expected} chunks")]
    VectorCount { expected: usize, got: usize },
    #[error("vector store write failed: {0}")]
    VectorStore(String),
    #[error("relational log write failed (vector entries rolled back): {0}")]
    AuditLog(String),
    #[error("relational log write failed ({log}) and rollback of {count} vector entries also failed ({rollback})")]
    Diverged {
        log: String,
        rollback: String,
        count: usize,
    },
}

/// Failure of a retrieval call. Never accompanied by partial results.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("retrieval failed: {context}")]
    Backend { context: String },
    #[error("retrieval timed out after {0}s")]
    Timeout(u64),
}

impl RetrievalError {
    /// Wrap an error chain as a backend failure, keeping every cause.
    pub fn backend(err: &anyhow::Error) -> Self {
        RetrievalError::Backend {
            context: format!("{:#}", err),
        }
    }
}

/// Anything that can make one file's ingestion fail.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Chunking(#[from] ChunkingError),
    #[error(transparent)]
    Upsert(#[from] UpsertError),
    #[error("ingestion timed out after {0}s")]
    Timeout(u64),
    #[error("worker task failed: {0}")]
    Worker(String),
}
