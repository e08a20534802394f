//! Course material management: listing, deleting and usage counts.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{error, info};

use crate::context::AppContext;
use crate::models::CourseFile;

/// Rows removed from each store by [`CourseMaterials::delete_document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteSummary {
    pub vector_entries: u64,
    pub log_rows: u64,
}

pub struct CourseMaterials {
    ctx: Arc<AppContext>,
}

impl CourseMaterials {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// Distinct files ingested into `course_name`.
    pub async fn list_files(&self, course_name: &str) -> Result<Vec<CourseFile>> {
        require("course_name", course_name)?;
        self.ctx
            .vectors
            .list_files(course_name)
            .await
            .with_context(|| format!("Failed to list files for course '{}'", course_name))
    }

    /// Remove every chunk of `s3_path` in `course_name` from the vector store
    /// and the relational log. The source object itself is left in place.
    pub async fn delete_document(&self, course_name: &str, s3_path: &str) -> Result<DeleteSummary> {
        require("course_name", course_name)?;
        require("s3_path", s3_path)?;

        let vector_entries = self
            .ctx
            .vectors
            .delete_document(course_name, s3_path)
            .await
            .with_context(|| format!("Failed to delete '{}' from the vector store", s3_path))?;
        let log_rows = match self.ctx.log.delete_document(course_name, s3_path).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(
                    course = course_name,
                    s3_path,
                    vector_entries,
                    error = %format!("{:#}", e),
                    "vector entries deleted but log rows remain; stores have diverged"
                );
                return Err(e.context(format!(
                    "Removed {} vector entries for '{}' but failed to delete its document log rows",
                    vector_entries, s3_path
                )));
            }
        };

        info!(course = course_name, s3_path, vector_entries, log_rows, "deleted document");
        Ok(DeleteSummary {
            vector_entries,
            log_rows,
        })
    }

    /// Number of monitored queries for `course_name`.
    pub async fn query_count(&self, course_name: &str) -> Result<u64> {
        require("course_name", course_name)?;
        self.ctx.log.query_count(course_name).await
    }
}

fn require(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{} must not be empty", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::embedding::HashProvider;
    use crate::models::{Chunk, ChunkMetadata, PageOrTimestamp, QueryRecord};
    use crate::object_store::MemoryObjectStore;
    use crate::store::memory::{MemoryAuditLog, MemoryVectorStore};
    use crate::store::{AuditLog, VectorRecord, VectorStore};
    use async_trait::async_trait;

    struct ReadOnlyLog;

    #[async_trait]
    impl AuditLog for ReadOnlyLog {
        async fn insert_chunks(&self, _chunks: &[Chunk]) -> Result<u64> {
            bail!("attempt to write a readonly database")
        }
        async fn log_query(&self, _record: &QueryRecord) -> Result<()> {
            bail!("attempt to write a readonly database")
        }
        async fn delete_document(&self, _c: &str, _p: &str) -> Result<u64> {
            bail!("attempt to write a readonly database")
        }
        async fn query_count(&self, _c: &str) -> Result<u64> {
            Ok(0)
        }
    }

    fn meta(course: &str, path: &str) -> ChunkMetadata {
        ChunkMetadata {
            course_name: course.to_string(),
            s3_path: path.to_string(),
            readable_filename: path.trim_end_matches(".pdf").to_string(),
            pagenumber_or_timestamp: PageOrTimestamp::Page(1),
        }
    }

    async fn setup() -> (Arc<MemoryVectorStore>, Arc<MemoryAuditLog>, CourseMaterials) {
        let vectors = Arc::new(MemoryVectorStore::new());
        let log = Arc::new(MemoryAuditLog::new());
        let rows = [
            ("1", "cs225", "heaps.pdf"),
            ("2", "cs225", "heaps.pdf"),
            ("3", "cs225", "graphs.pdf"),
            ("4", "ece120", "heaps.pdf"),
        ];
        for (id, course, path) in rows {
            vectors
                .upsert(&[VectorRecord {
                    id: id.to_string(),
                    text: "text".to_string(),
                    metadata: meta(course, path),
                    vector: vec![1.0],
                }])
                .await
                .unwrap();
            log.insert_chunks(&[Chunk {
                id: id.to_string(),
                text: "text".to_string(),
                metadata: meta(course, path),
                hash: String::new(),
            }])
            .await
            .unwrap();
        }
        let config = parse_config("[db]\npath = \"x\"\n[storage]\nbackend = \"s3\"\nbucket = \"b\"\n").unwrap();
        let ctx = AppContext::new(
            config,
            Arc::new(MemoryObjectStore::new()),
            vectors.clone(),
            log.clone(),
            Arc::new(HashProvider::new(8)),
        );
        (vectors, log, CourseMaterials::new(Arc::new(ctx)))
    }

    #[tokio::test]
    async fn test_list_files_is_per_course() {
        let (_v, _l, materials) = setup().await;
        let files = materials.list_files("cs225").await.unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.s3_path.as_str()).collect();
        assert_eq!(paths, vec!["graphs.pdf", "heaps.pdf"]);
        assert!(materials.list_files("").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_removes_from_both_stores_in_one_course() {
        let (vectors, log, materials) = setup().await;
        let summary = materials.delete_document("cs225", "heaps.pdf").await.unwrap();
        assert_eq!(
            summary,
            DeleteSummary {
                vector_entries: 2,
                log_rows: 2
            }
        );
        assert_eq!(vectors.len(), 2);
        assert_eq!(log.rows().len(), 2);
        assert_eq!(materials.list_files("ece120").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_requires_both_arguments() {
        let (vectors, _l, materials) = setup().await;
        assert!(materials.delete_document("cs225", "").await.is_err());
        assert!(materials.delete_document("", "heaps.pdf").await.is_err());
        assert_eq!(vectors.len(), 4);
    }

    #[tokio::test]
    async fn test_query_count() {
        let (_v, log, materials) = setup().await;
        log.log_query(&QueryRecord {
            prompt: "q".to_string(),
            contexts: vec![],
            course_name: "cs225".to_string(),
        })
        .await
        .unwrap();
        assert_eq!(materials.query_count("cs225").await.unwrap(), 1);
        assert_eq!(materials.query_count("ece120").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_partial_delete_names_what_was_removed() {
        let (vectors, _log, _materials) = setup().await;
        let config = parse_config("[db]\npath = \"x\"\n[storage]\nbackend = \"s3\"\nbucket = \"b\"\n").unwrap();
        let ctx = AppContext::new(
            config,
            Arc::new(MemoryObjectStore::new()),
            vectors.clone(),
            Arc::new(ReadOnlyLog),
            Arc::new(HashProvider::new(8)),
        );
        let materials = CourseMaterials::new(Arc::new(ctx));

        let err = materials.delete_document("cs225", "heaps.pdf").await.unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("Removed 2 vector entries for 'heaps.pdf'"), "{}", msg);
        assert!(msg.contains("readonly database"), "{}", msg);
        assert_eq!(vectors.len(), 2);
    }
}
