//! Course-scoped similarity search.
//!
//! A query is embedded with the configured provider and matched against the
//! vector store under a hard `course_name` filter. Every successful search
//! is recorded in the query monitor; that write runs on a spawned task by
//! default (`retrieval.defer_monitoring`) and its failure is logged, never
//! returned.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::AppContext;
use crate::error::RetrievalError;
use crate::format::format_hits;
use crate::models::{ContextRecord, QueryRecord, RetrievalHit};
use crate::store::{AuditLog, ScoredChunk, SearchFilter};

const MONITOR_RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct Retriever {
    ctx: Arc<AppContext>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl Retriever {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Wait for deferred monitor writes to finish. Short-lived callers such
    /// as the CLI call this before exiting.
    pub async fn flush_monitor(&self) {
        let handles = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return,
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "query monitor task failed");
            }
        }
    }

    /// Return up to `top_k` (default `retrieval.default_top_k`) chunks of
    /// `course_name` most similar to `query`, best first.
    pub async fn search(
        &self,
        query: &str,
        course_name: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<RetrievalHit>, RetrievalError> {
        if course_name.trim().is_empty() {
            return Err(RetrievalError::InvalidRequest(
                "course_name must not be empty".to_string(),
            ));
        }
        if query.trim().is_empty() {
            return Err(RetrievalError::InvalidRequest(
                "query must not be empty".to_string(),
            ));
        }
        let k = top_k.unwrap_or(self.ctx.config.retrieval.default_top_k);
        if k == 0 {
            return Err(RetrievalError::InvalidRequest(
                "top_k must be at least 1".to_string(),
            ));
        }

        let limit_secs = self.ctx.config.retrieval.timeout_secs;
        let hits = tokio::time::timeout(
            Duration::from_secs(limit_secs),
            self.nearest(query, course_name, k),
        )
        .await
        .map_err(|_| RetrievalError::Timeout(limit_secs))?
        .map_err(|e| RetrievalError::backend(&e))?;

        debug!(course = course_name, k, hits = hits.len(), "search complete");

        let record = QueryRecord {
            prompt: query.to_string(),
            contexts: hits
                .iter()
                .map(|h| ContextRecord {
                    content: h.text.clone(),
                    metadata: h.metadata.clone(),
                })
                .collect(),
            course_name: course_name.to_string(),
        };
        if self.ctx.config.retrieval.defer_monitoring {
            let log = self.ctx.log.clone();
            let handle = tokio::spawn(async move { record_query(log.as_ref(), &record).await });
            if let Ok(mut pending) = self.pending.lock() {
                pending.retain(|h| !h.is_finished());
                pending.push(handle);
            }
        } else {
            record_query(self.ctx.log.as_ref(), &record).await;
        }

        Ok(format_hits(&hits))
    }

    async fn nearest(
        &self,
        query: &str,
        course_name: &str,
        k: usize,
    ) -> anyhow::Result<Vec<ScoredChunk>> {
        let query_vec = self
            .ctx
            .embedder
            .embed_query(query)
            .await
            .context("Failed to embed query")?;
        self.ctx
            .vectors
            .search(&query_vec, k, &SearchFilter::course(course_name))
            .await
            .with_context(|| format!("Vector search failed for course '{}'", course_name))
    }
}

/// Write a monitor record, retrying once after a short delay.
async fn record_query(log: &dyn AuditLog, record: &QueryRecord) {
    if let Err(first) = log.log_query(record).await {
        warn!(error = %format!("{:#}", first), "query monitor write failed, retrying");
        tokio::time::sleep(MONITOR_RETRY_DELAY).await;
        if let Err(second) = log.log_query(record).await {
            warn!(
                error = %format!("{:#}", second),
                course = %record.course_name,
                "query monitor write failed, record dropped"
            );
        }
    }
}
