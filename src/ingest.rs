//! Bulk ingestion of course files.
//!
//! For each object key: download to a temporary file, extract segments by
//! format, upload the PDF thumbnail, chunk, embed and upsert. Files run in
//! parallel on a bounded worker pool (`ingest.workers`), each under its own
//! timeout (`ingest.file_timeout_secs`). A failure, timeout or panic in one
//! file is recorded in the report and never affects the others.
//!
//! The report lists keys in input order. Only an empty `course_name` or a
//! failure of the pool itself produce the synthetic
//! `MAJOR ERROR IN bulk_ingest` entry.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::chunk::Chunker;
use crate::context::AppContext;
use crate::error::{ExtractError, IngestError, UpsertError};
use crate::extract::{self, Format, MIME_PNG};
use crate::models::{ChunkMetadata, IngestOutcome, IngestReport};
use crate::upload::{PendingWrites, Upserter};

pub struct Ingestor {
    pipeline: Arc<Pipeline>,
    workers: usize,
    file_timeout: Duration,
}

struct Pipeline {
    ctx: Arc<AppContext>,
    chunker: Chunker,
    upserter: Upserter,
}

impl Ingestor {
    /// Fails only when the configured tokenizer cannot be loaded.
    pub fn new(ctx: Arc<AppContext>) -> anyhow::Result<Self> {
        let chunker = Chunker::new(&ctx.config.chunking)?;
        let upserter = Upserter::new(
            ctx.embedder.clone(),
            ctx.vectors.clone(),
            ctx.log.clone(),
            ctx.config.embedding.batch_size,
        );
        let workers = ctx.config.ingest.workers.max(1);
        let file_timeout = Duration::from_secs(ctx.config.ingest.file_timeout_secs);
        Ok(Self {
            pipeline: Arc::new(Pipeline {
                ctx,
                chunker,
                upserter,
            }),
            workers,
            file_timeout,
        })
    }

    /// Ingest every key in `paths` into `course_name`.
    pub async fn bulk_ingest(&self, paths: &[String], course_name: &str) -> IngestReport {
        if course_name.trim().is_empty() {
            warn!("bulk ingest called without a course name");
            return IngestReport::major_error("course_name must not be empty");
        }

        info!(files = paths.len(), course = course_name, "starting bulk ingest");

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for (index, key) in paths.iter().enumerate() {
            let pipeline = self.pipeline.clone();
            let semaphore = semaphore.clone();
            let key = key.clone();
            let course = course_name.to_string();
            let file_timeout = self.file_timeout;

            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        let err = IngestError::Worker(e.to_string());
                        return (index, IngestOutcome::failure(&key, err.to_string()));
                    }
                };
                let result = run_isolated(pipeline, key.clone(), course, file_timeout).await;
                (index, outcome_for(&key, result))
            });
        }

        let mut slots: Vec<Option<IngestOutcome>> = vec![None; paths.len()];
        let mut pool_errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => pool_errors.push(e.to_string()),
            }
        }

        let mut report = IngestReport::from_outcomes(slots.into_iter().flatten().collect());
        for message in pool_errors {
            warn!(error = %message, "ingest worker failed outside a file task");
            report.push(IngestOutcome::major_error(&message));
        }

        info!(
            course = course_name,
            succeeded = report.success_ingest.len(),
            failed = report.failure_ingest.len(),
            "bulk ingest finished"
        );
        report
    }

    /// Ingest a single key, returning the number of chunks stored.
    pub async fn ingest_file(&self, key: &str, course_name: &str) -> Result<usize, IngestError> {
        self.pipeline
            .ingest_file(key, course_name, &PendingWrites::new())
            .await
    }
}

/// Run one file on its own task so a panic surfaces as a `JoinError`, and
/// abort it if it outlives `limit`. Vector entries written by an
/// interrupted task before its log rows landed are removed again.
async fn run_isolated(
    pipeline: Arc<Pipeline>,
    key: String,
    course: String,
    limit: Duration,
) -> Result<usize, IngestError> {
    let vectors = pipeline.ctx.vectors.clone();
    let pending = PendingWrites::new();
    let tracked = pending.clone();
    let task_key = key.clone();
    let mut handle =
        tokio::spawn(async move { pipeline.ingest_file(&task_key, &course, &tracked).await });

    let failure = match timeout(limit, &mut handle).await {
        Ok(Ok(result)) => return result,
        Ok(Err(join_err)) => IngestError::Worker(join_err.to_string()),
        Err(_) => {
            handle.abort();
            // Wait until the task has actually stopped before cleaning up.
            let _ = handle.await;
            IngestError::Timeout(limit.as_secs())
        }
    };

    let orphans = pending.take();
    if orphans.is_empty() {
        return Err(failure);
    }
    match vectors.delete_chunks(&orphans).await {
        Ok(removed) => {
            warn!(key = %key, removed, "removed vector entries of interrupted ingest");
            Err(failure)
        }
        Err(e) => {
            let rollback = format!("{:#}", e);
            error!(
                key = %key,
                error = %failure,
                rollback_error = %rollback,
                count = orphans.len(),
                "vector store and relational log have diverged"
            );
            Err(IngestError::Upsert(UpsertError::Diverged {
                log: failure.to_string(),
                rollback,
                count: orphans.len(),
            }))
        }
    }
}

fn outcome_for(key: &str, result: Result<usize, IngestError>) -> IngestOutcome {
    match result {
        Ok(chunks) => {
            info!(key, chunks, "ingested file");
            IngestOutcome::success(key, format!("{} chunks", chunks))
        }
        Err(e) => {
            warn!(key, error = %e, "failed to ingest file");
            IngestOutcome::failure(key, e.to_string())
        }
    }
}

impl Pipeline {
    async fn ingest_file(
        &self,
        key: &str,
        course_name: &str,
        pending: &PendingWrites,
    ) -> Result<usize, IngestError> {
        let format = Format::from_path(key).ok_or_else(|| {
            let ext = Path::new(key)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| format!(".{}", e))
                .unwrap_or_else(|| key.to_string());
            ExtractError::UnsupportedFormat(ext)
        })?;

        // The temp file is removed when it drops at the end of extraction.
        let mut spool = tempfile::NamedTempFile::new().map_err(ExtractError::from)?;
        self.ctx
            .objects
            .download_to(key, spool.as_file_mut())
            .await
            .map_err(|e| ExtractError::Download {
                key: key.to_string(),
                message: format!("{:#}", e),
            })?;

        let owned_key = key.to_string();
        let extraction = tokio::task::spawn_blocking(move || {
            let bytes = std::fs::read(spool.path()).map_err(ExtractError::from)?;
            extract::extract(format, &owned_key, &bytes)
        })
        .await
        .map_err(|e| IngestError::Worker(e.to_string()))??;

        if let Some(thumb) = extraction.thumbnail {
            self.ctx
                .objects
                .upload(&thumb.key, thumb.png, MIME_PNG)
                .await
                .map_err(|e| ExtractError::Thumbnail(format!("upload of '{}' failed: {:#}", thumb.key, e)))?;
        }

        let (texts, metadatas): (Vec<String>, Vec<ChunkMetadata>) = extraction
            .segments
            .iter()
            .map(|segment| {
                (
                    segment.text.clone(),
                    ChunkMetadata::for_segment(course_name, key, segment),
                )
            })
            .unzip();

        let chunks = self.chunker.chunk(&texts, &metadatas)?;
        let summary = self.upserter.upload_tracked(&chunks, pending).await?;
        Ok(summary.chunks)
    }
}
