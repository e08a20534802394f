//! SQLite-backed [`VectorStore`] and [`AuditLog`].
//!
//! Tables (see [`crate::migrate`]):
//! - `chunk_vectors`: one row per chunk with its embedding BLOB. Search
//!   filters on `course_name` in SQL, then ranks by brute-force cosine
//!   similarity.
//! - `document_log`: append-only `{content, metadata}` mirror.
//! - `llm_monitor`: served queries.
//!
//! `pagenumber_or_timestamp` is stored as its JSON encoding so integer
//! pages and string timestamps survive the round trip.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::{rank, AuditLog, ScoredChunk, SearchFilter, VectorRecord, VectorStore};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{Chunk, ChunkMetadata, CourseFile, PageOrTimestamp, QueryRecord};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

fn encode_position(position: &PageOrTimestamp) -> Result<String> {
    Ok(serde_json::to_string(position)?)
}

fn decode_position(raw: &str) -> PageOrTimestamp {
    serde_json::from_str(raw).unwrap_or_else(|_| PageOrTimestamp::Label(raw.to_string()))
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let created_at = now_ts();

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (id, course_name, s3_path, readable_filename,
                                           pagenumber_or_timestamp, text, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    course_name = excluded.course_name,
                    s3_path = excluded.s3_path,
                    readable_filename = excluded.readable_filename,
                    pagenumber_or_timestamp = excluded.pagenumber_or_timestamp,
                    text = excluded.text,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&record.id)
            .bind(&record.metadata.course_name)
            .bind(&record.metadata.s3_path)
            .bind(&record.metadata.readable_filename)
            .bind(encode_position(&record.metadata.pagenumber_or_timestamp)?)
            .bind(&record.text)
            .bind(vec_to_blob(&record.vector))
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn search(
        &self,
        query_vec: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, course_name, s3_path, readable_filename,
                   pagenumber_or_timestamp, text, embedding
            FROM chunk_vectors
            WHERE course_name = ?
            ORDER BY rowid
            "#,
        )
        .bind(&filter.course_name)
        .fetch_all(&self.pool)
        .await
        .context("vector search query failed")?;

        let hits = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let position: String = row.get("pagenumber_or_timestamp");
                ScoredChunk {
                    id: row.get("id"),
                    text: row.get("text"),
                    metadata: ChunkMetadata {
                        course_name: row.get("course_name"),
                        s3_path: row.get("s3_path"),
                        readable_filename: row.get("readable_filename"),
                        pagenumber_or_timestamp: decode_position(&position),
                    },
                    score: cosine_similarity(query_vec, &blob_to_vec(&blob)),
                }
            })
            .collect();

        Ok(rank(hits, k))
    }

    async fn delete_chunks(&self, ids: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            removed += sqlx::query("DELETE FROM chunk_vectors WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn delete_document(&self, course_name: &str, s3_path: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunk_vectors WHERE course_name = ? AND s3_path = ?")
            .bind(course_name)
            .bind(s3_path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_files(&self, course_name: &str) -> Result<Vec<CourseFile>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT course_name, s3_path, readable_filename
            FROM chunk_vectors
            WHERE course_name = ?
            ORDER BY s3_path
            "#,
        )
        .bind(course_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(course_name, s3_path, readable_filename)| CourseFile {
                course_name,
                s3_path,
                readable_filename,
            })
            .collect())
    }
}

#[async_trait]
impl AuditLog for SqliteStore {
    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let created_at = now_ts();

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO document_log (chunk_id, course_name, s3_path, content,
                                          metadata_json, content_hash, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.metadata.course_name)
            .bind(&chunk.metadata.s3_path)
            .bind(&chunk.text)
            .bind(serde_json::to_string(&chunk.metadata)?)
            .bind(&chunk.hash)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(chunks.len() as u64)
    }

    async fn log_query(&self, record: &QueryRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO llm_monitor (prompt, contexts_json, course_name, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&record.prompt)
        .bind(serde_json::to_string(&record.contexts)?)
        .bind(&record.course_name)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_document(&self, course_name: &str, s3_path: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM document_log WHERE course_name = ? AND s3_path = ?")
            .bind(course_name)
            .bind(s3_path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn query_count(&self, course_name: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM llm_monitor WHERE course_name = ?")
            .bind(course_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContextRecord;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::db::connect_path(&tmp.path().join("t.sqlite"))
            .await
            .unwrap();
        crate::migrate::apply_schema(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn record(id: &str, course: &str, path: &str, page: PageOrTimestamp, v: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            text: format!("text of {}", id),
            metadata: ChunkMetadata {
                course_name: course.to_string(),
                s3_path: path.to_string(),
                readable_filename: "file".to_string(),
                pagenumber_or_timestamp: page,
            },
            vector: v,
        }
    }

    #[tokio::test]
    async fn search_filters_by_course_and_ranks() {
        let (_tmp, store) = store().await;
        store
            .upsert(&[
                record("a", "cs225", "x.pdf", PageOrTimestamp::Page(2), vec![1.0, 0.0]),
                record("b", "cs225", "x.pdf", PageOrTimestamp::Page(3), vec![0.6, 0.8]),
                record("c", "ece120", "y.pdf", PageOrTimestamp::Page(1), vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = store
            .search(&[1.0, 0.0], 10, &SearchFilter::course("cs225"))
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(hits[0].metadata.pagenumber_or_timestamp, PageOrTimestamp::Page(2));
        assert!(hits[0].score > hits[1].score);

        let top1 = store
            .search(&[1.0, 0.0], 1, &SearchFilter::course("cs225"))
            .await
            .unwrap();
        assert_eq!(top1.len(), 1);
    }

    #[tokio::test]
    async fn timestamp_positions_round_trip() {
        let (_tmp, store) = store().await;
        store
            .upsert(&[record(
                "s",
                "c",
                "cap.srt",
                PageOrTimestamp::Label("00:01:05".into()),
                vec![1.0],
            )])
            .await
            .unwrap();
        let hits = store.search(&[1.0], 4, &SearchFilter::course("c")).await.unwrap();
        assert_eq!(
            hits[0].metadata.pagenumber_or_timestamp,
            PageOrTimestamp::Label("00:01:05".into())
        );
    }

    #[tokio::test]
    async fn delete_and_list_files() {
        let (_tmp, store) = store().await;
        store
            .upsert(&[
                record("a", "c", "x.pdf", PageOrTimestamp::Page(1), vec![1.0]),
                record("b", "c", "x.pdf", PageOrTimestamp::Page(2), vec![1.0]),
                record("d", "c", "z.docx", PageOrTimestamp::blank(), vec![1.0]),
            ])
            .await
            .unwrap();

        let files = store.list_files("c").await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].s3_path, "x.pdf");

        assert_eq!(store.delete_chunks(&["d".to_string()]).await.unwrap(), 1);
        assert_eq!(VectorStore::delete_document(&store, "c", "x.pdf").await.unwrap(), 2);
        assert!(store.list_files("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn audit_log_counts_queries_per_course() {
        let (_tmp, store) = store().await;
        let q = |course: &str| QueryRecord {
            prompt: "what is a heap".to_string(),
            contexts: vec![ContextRecord {
                content: "A heap is a tree".to_string(),
                metadata: ChunkMetadata {
                    course_name: course.to_string(),
                    s3_path: "h.pdf".to_string(),
                    readable_filename: "h".to_string(),
                    pagenumber_or_timestamp: PageOrTimestamp::Page(1),
                },
            }],
            course_name: course.to_string(),
        };
        store.log_query(&q("cs225")).await.unwrap();
        store.log_query(&q("cs225")).await.unwrap();
        store.log_query(&q("ece120")).await.unwrap();
        assert_eq!(store.query_count("cs225").await.unwrap(), 2);
        assert_eq!(store.query_count("cs101").await.unwrap(), 0);
    }
}
