//! In-memory [`VectorStore`] and [`AuditLog`] for tests and embedding.
//!
//! State lives behind `std::sync::RwLock`. Vector search is brute-force
//! cosine similarity over the records of the requested course.

use std::collections::BTreeSet;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{rank, AuditLog, ScoredChunk, SearchFilter, VectorRecord, VectorStore};
use crate::embedding::cosine_similarity;
use crate::models::{Chunk, ContextRecord, CourseFile, QueryRecord};

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[derive(Default)]
pub struct MemoryVectorStore {
    records: RwLock<Vec<VectorRecord>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records across all courses.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored record, in insertion order.
    pub fn records(&self) -> Vec<VectorRecord> {
        self.records.read().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let mut stored = self.records.write().map_err(poisoned)?;
        for record in records {
            stored.retain(|r| r.id != record.id);
            stored.push(record.clone());
        }
        Ok(())
    }

    async fn search(
        &self,
        query_vec: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>> {
        let stored = self.records.read().map_err(poisoned)?;
        let hits = stored
            .iter()
            .filter(|r| r.metadata.course_name == filter.course_name)
            .map(|r| ScoredChunk {
                id: r.id.clone(),
                text: r.text.clone(),
                metadata: r.metadata.clone(),
                score: cosine_similarity(query_vec, &r.vector),
            })
            .collect();
        Ok(rank(hits, k))
    }

    async fn delete_chunks(&self, ids: &[String]) -> Result<u64> {
        let mut stored = self.records.write().map_err(poisoned)?;
        let before = stored.len();
        stored.retain(|r| !ids.contains(&r.id));
        Ok((before - stored.len()) as u64)
    }

    async fn delete_document(&self, course_name: &str, s3_path: &str) -> Result<u64> {
        let mut stored = self.records.write().map_err(poisoned)?;
        let before = stored.len();
        stored.retain(|r| !(r.metadata.course_name == course_name && r.metadata.s3_path == s3_path));
        Ok((before - stored.len()) as u64)
    }

    async fn list_files(&self, course_name: &str) -> Result<Vec<CourseFile>> {
        let stored = self.records.read().map_err(poisoned)?;
        let distinct: BTreeSet<(String, String)> = stored
            .iter()
            .filter(|r| r.metadata.course_name == course_name)
            .map(|r| {
                (
                    r.metadata.s3_path.clone(),
                    r.metadata.readable_filename.clone(),
                )
            })
            .collect();
        Ok(distinct
            .into_iter()
            .map(|(s3_path, readable_filename)| CourseFile {
                course_name: course_name.to_string(),
                s3_path,
                readable_filename,
            })
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryAuditLog {
    rows: RwLock<Vec<ContextRecord>>,
    queries: RwLock<Vec<QueryRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<ContextRecord> {
        self.rows.read().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn queries(&self) -> Vec<QueryRecord> {
        self.queries.read().map(|q| q.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<u64> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        rows.extend(chunks.iter().map(|c| ContextRecord {
            content: c.text.clone(),
            metadata: c.metadata.clone(),
        }));
        Ok(chunks.len() as u64)
    }

    async fn log_query(&self, record: &QueryRecord) -> Result<()> {
        self.queries.write().map_err(poisoned)?.push(record.clone());
        Ok(())
    }

    async fn delete_document(&self, course_name: &str, s3_path: &str) -> Result<u64> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        let before = rows.len();
        rows.retain(|r| !(r.metadata.course_name == course_name && r.metadata.s3_path == s3_path));
        Ok((before - rows.len()) as u64)
    }

    async fn query_count(&self, course_name: &str) -> Result<u64> {
        let queries = self.queries.read().map_err(poisoned)?;
        Ok(queries.iter().filter(|q| q.course_name == course_name).count() as u64)
    }
}
