//! Vector upsert with a mirrored relational log.
//!
//! [`Upserter::upload`] embeds chunk texts in batches, writes the vectors,
//! then appends the same chunks to the [`AuditLog`]. The two stores are
//! kept consistent with a compensating delete: if the log write fails, the
//! chunk ids just written to the vector store are removed again and the
//! upload fails. If that removal also fails, the stores have diverged; the
//! error says so and it is logged at `error` level.
//!
//! Callers that may cancel an upload mid-flight pass a [`PendingWrites`]
//! ledger. Ids are recorded before the vector write and cleared once the
//! log mirror has landed, so whatever is left after a cancellation is
//! exactly what must be removed from the vector store.
//!
//! There is no content deduplication. Uploading the same text twice
//! stores it twice under different ids.

use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::embedding::EmbeddingProvider;
use crate::error::UpsertError;
use crate::models::Chunk;
use crate::store::{AuditLog, VectorRecord, VectorStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSummary {
    pub chunks: usize,
}

/// Vector ids written without a matching log row yet.
#[derive(Debug, Clone, Default)]
pub struct PendingWrites(Arc<Mutex<Vec<String>>>);

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, ids: &[String]) {
        if let Ok(mut pending) = self.0.lock() {
            pending.extend_from_slice(ids);
        }
    }

    fn clear(&self) {
        if let Ok(mut pending) = self.0.lock() {
            pending.clear();
        }
    }

    /// Drain the ids still awaiting their log rows.
    pub fn take(&self) -> Vec<String> {
        match self.0.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => Vec::new(),
        }
    }
}

pub struct Upserter {
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStore>,
    log: Arc<dyn AuditLog>,
    batch_size: usize,
}

impl Upserter {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        log: Arc<dyn AuditLog>,
        batch_size: usize,
    ) -> Self {
        Self {
            embedder,
            vectors,
            log,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn upload(&self, chunks: &[Chunk]) -> Result<UploadSummary, UpsertError> {
        self.upload_tracked(chunks, &PendingWrites::new()).await
    }

    /// As [`Upserter::upload`], recording in-flight vector ids in `pending`.
    pub async fn upload_tracked(
        &self,
        chunks: &[Chunk],
        pending: &PendingWrites,
    ) -> Result<UploadSummary, UpsertError> {
        if chunks.is_empty() {
            return Ok(UploadSummary { chunks: 0 });
        }

        let mut records = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self
                .embedder
                .embed(&texts)
                .await
                .map_err(|e| UpsertError::Embedding(format!("{:#}", e)))?;
            if vectors.len() != batch.len() {
                return Err(UpsertError::VectorCount {
                    expected: batch.len(),
                    got: vectors.len(),
                });
            }
            records.extend(batch.iter().zip(vectors).map(|(chunk, vector)| VectorRecord {
                id: chunk.id.clone(),
                text: chunk.text.clone(),
                metadata: chunk.metadata.clone(),
                vector,
            }));
        }
        debug!(chunks = records.len(), model = self.embedder.model_name(), "embedded chunks");

        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        pending.record(&ids);

        if let Err(e) = self.vectors.upsert(&records).await {
            pending.clear();
            return Err(UpsertError::VectorStore(format!("{:#}", e)));
        }

        if let Err(log_err) = self.log.insert_chunks(chunks).await {
            let log_msg = format!("{:#}", log_err);
            let outcome = self.vectors.delete_chunks(&ids).await;
            pending.clear();
            return Err(match outcome {
                Ok(removed) => {
                    warn!(error = %log_msg, removed, "relational log write failed; vector entries rolled back");
                    UpsertError::AuditLog(log_msg)
                }
                Err(rollback_err) => {
                    let rollback = format!("{:#}", rollback_err);
                    error!(
                        error = %log_msg,
                        rollback_error = %rollback,
                        count = ids.len(),
                        "vector store and relational log have diverged"
                    );
                    UpsertError::Diverged {
                        log: log_msg,
                        rollback,
                        count: ids.len(),
                    }
                }
            });
        }

        pending.clear();
        Ok(UploadSummary {
            chunks: chunks.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use crate::models::{ChunkMetadata, CourseFile, PageOrTimestamp, QueryRecord};
    use crate::store::memory::{MemoryAuditLog, MemoryVectorStore};
    use crate::store::{ScoredChunk, SearchFilter};
    use anyhow::{bail, Result};
    use async_trait::async_trait;

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            metadata: ChunkMetadata {
                course_name: "cs225".into(),
                s3_path: "l.pdf".into(),
                readable_filename: "l".into(),
                pagenumber_or_timestamp: PageOrTimestamp::Page(1),
            },
            hash: String::new(),
        }
    }

    struct BrokenLog;

    #[async_trait]
    impl AuditLog for BrokenLog {
        async fn insert_chunks(&self, _chunks: &[Chunk]) -> Result<u64> {
            bail!("relation \"documents\" does not exist")
        }
        async fn log_query(&self, _record: &QueryRecord) -> Result<()> {
            Ok(())
        }
        async fn delete_document(&self, _c: &str, _p: &str) -> Result<u64> {
            Ok(0)
        }
        async fn query_count(&self, _c: &str) -> Result<u64> {
            Ok(0)
        }
    }

    /// Accepts writes but cannot delete.
    struct StickyVectors(MemoryVectorStore);

    #[async_trait]
    impl VectorStore for StickyVectors {
        async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
            self.0.upsert(records).await
        }
        async fn search(&self, q: &[f32], k: usize, f: &SearchFilter) -> Result<Vec<ScoredChunk>> {
            self.0.search(q, k, f).await
        }
        async fn delete_chunks(&self, _ids: &[String]) -> Result<u64> {
            bail!("connection reset")
        }
        async fn delete_document(&self, c: &str, p: &str) -> Result<u64> {
            self.0.delete_document(c, p).await
        }
        async fn list_files(&self, c: &str) -> Result<Vec<CourseFile>> {
            self.0.list_files(c).await
        }
    }

    #[tokio::test]
    async fn writes_both_stores_in_small_batches() {
        let vectors = Arc::new(MemoryVectorStore::new());
        let log = Arc::new(MemoryAuditLog::new());
        let upserter = Upserter::new(Arc::new(HashProvider::new(32)), vectors.clone(), log.clone(), 2);

        let chunks: Vec<Chunk> = (0..5).map(|i| chunk(&format!("c{}", i), "some text")).collect();
        let summary = upserter.upload(&chunks).await.unwrap();
        assert_eq!(summary.chunks, 5);
        assert_eq!(vectors.len(), 5);
        assert_eq!(log.rows().len(), 5);
        assert_eq!(log.rows()[0].content, "some text");
    }

    #[tokio::test]
    async fn log_failure_rolls_back_vectors() {
        let vectors = Arc::new(MemoryVectorStore::new());
        let upserter = Upserter::new(
            Arc::new(HashProvider::new(8)),
            vectors.clone(),
            Arc::new(BrokenLog),
            64,
        );
        let err = upserter.upload(&[chunk("a", "text")]).await.unwrap_err();
        assert!(matches!(err, UpsertError::AuditLog(_)));
        assert!(vectors.is_empty());
    }

    #[tokio::test]
    async fn failed_rollback_reports_divergence() {
        let upserter = Upserter::new(
            Arc::new(HashProvider::new(8)),
            Arc::new(StickyVectors(MemoryVectorStore::new())),
            Arc::new(BrokenLog),
            64,
        );
        let err = upserter.upload(&[chunk("a", "text")]).await.unwrap_err();
        match err {
            UpsertError::Diverged { count, .. } => assert_eq!(count, 1),
            other => panic!("expected divergence, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn disabled_embeddings_fail_before_any_write() {
        let vectors = Arc::new(MemoryVectorStore::new());
        let log = Arc::new(MemoryAuditLog::new());
        let upserter = Upserter::new(
            Arc::new(crate::embedding::DisabledProvider),
            vectors.clone(),
            log.clone(),
            64,
        );
        let err = upserter.upload(&[chunk("a", "text")]).await.unwrap_err();
        assert!(matches!(err, UpsertError::Embedding(_)));
        assert!(vectors.is_empty());
        assert!(log.rows().is_empty());
    }

    #[tokio::test]
    async fn pending_ids_clear_once_both_stores_are_written() {
        let upserter = Upserter::new(
            Arc::new(HashProvider::new(8)),
            Arc::new(MemoryVectorStore::new()),
            Arc::new(MemoryAuditLog::new()),
            64,
        );
        let pending = PendingWrites::new();
        upserter
            .upload_tracked(&[chunk("a", "text"), chunk("b", "more")], &pending)
            .await
            .unwrap();
        assert!(pending.take().is_empty());
    }
}
