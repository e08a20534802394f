//! Storage abstraction for the pipeline.
//!
//! Two collaborators, each a trait so backends can be swapped:
//!
//! | Trait | Holds | Used by |
//! |-------|-------|---------|
//! | [`VectorStore`] | embedded chunks, searchable by cosine similarity within a course | upserter, retriever |
//! | [`AuditLog`] | append-only `{content, metadata}` rows and the query monitor | upserter, retriever |
//!
//! [`sqlite::SqliteStore`] implements both over one database;
//! [`memory`] provides in-process versions for tests and embedding.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, ChunkMetadata, CourseFile, QueryRecord};

/// A chunk and its embedding, ready to be written.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub vector: Vec<f32>,
}

/// A search hit with its cosine similarity to the query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

/// Hard constraints applied inside the store query.
#[derive(Debug, Clone)]
pub struct SearchFilter {
    pub course_name: String,
}

impl SearchFilter {
    pub fn course(course_name: &str) -> Self {
        Self {
            course_name: course_name.to_string(),
        }
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert records, replacing any with the same id.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()>;

    /// Up to `k` chunks matching `filter`, by decreasing similarity.
    async fn search(
        &self,
        query_vec: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>>;

    /// Remove chunks by id. Returns how many were removed.
    async fn delete_chunks(&self, ids: &[String]) -> Result<u64>;

    /// Remove every chunk of one file in one course.
    async fn delete_document(&self, course_name: &str, s3_path: &str) -> Result<u64>;

    /// Distinct files with at least one chunk in the course.
    async fn list_files(&self, course_name: &str) -> Result<Vec<CourseFile>>;
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append one `{content, metadata}` row per chunk.
    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<u64>;

    /// Record a served query.
    async fn log_query(&self, record: &QueryRecord) -> Result<()>;

    /// Remove the log rows of one file in one course.
    async fn delete_document(&self, course_name: &str, s3_path: &str) -> Result<u64>;

    /// Number of monitored queries for a course.
    async fn query_count(&self, course_name: &str) -> Result<u64>;
}

/// Sort by decreasing score and keep the best `k`.
pub(crate) fn rank(mut hits: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(k);
    hits
}
