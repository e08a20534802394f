//! Core data models used throughout course-context.
//!
//! These types represent the segments, chunks, ingest outcomes, and
//! retrieval hits that flow through the ingestion and query pipelines.
//! The JSON shapes of [`ChunkMetadata`], [`IngestReport`] and
//! [`RetrievalHit`] are stable: both storage layers and API consumers
//! read them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a segment came from inside its source file.
///
/// PDF pages serialize as integers (1-indexed); everything else is a
/// string, which is empty for formats without a meaningful position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageOrTimestamp {
    Page(u32),
    Label(String),
}

impl PageOrTimestamp {
    pub fn blank() -> Self {
        PageOrTimestamp::Label(String::new())
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, PageOrTimestamp::Label(s) if s.is_empty())
    }
}

impl Default for PageOrTimestamp {
    fn default() -> Self {
        Self::blank()
    }
}

impl fmt::Display for PageOrTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageOrTimestamp::Page(n) => write!(f, "{}", n),
            PageOrTimestamp::Label(s) => f.write_str(s),
        }
    }
}

/// Metadata attached to every chunk. Identifies the source file and the
/// position within it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub course_name: String,
    pub s3_path: String,
    pub readable_filename: String,
    pub pagenumber_or_timestamp: PageOrTimestamp,
}

impl ChunkMetadata {
    /// Metadata for a segment of `s3_path` ingested into `course_name`.
    pub fn for_segment(course_name: &str, s3_path: &str, segment: &ExtractedSegment) -> Self {
        Self {
            course_name: course_name.to_string(),
            s3_path: s3_path.to_string(),
            readable_filename: segment.readable_filename.clone(),
            pagenumber_or_timestamp: segment.position.clone(),
        }
    }
}

/// Text produced by a format extractor, before chunking. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedSegment {
    pub text: String,
    pub position: PageOrTimestamp,
    pub readable_filename: String,
}

/// A chunk of extracted text, the unit stored in and retrieved from the
/// vector index.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    /// SHA-256 of `text`, hex-encoded.
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Success,
    Failure,
}

/// Result of ingesting a single source file.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub path: String,
    pub status: IngestStatus,
    pub detail: String,
}

impl IngestOutcome {
    pub fn success(path: &str, detail: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            status: IngestStatus::Success,
            detail: detail.into(),
        }
    }

    pub fn failure(path: &str, detail: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            status: IngestStatus::Failure,
            detail: detail.into(),
        }
    }

    /// Synthetic failure entry for an error that is not tied to one file.
    pub fn major_error(message: &str) -> Self {
        Self::failure(&format!("MAJOR ERROR IN bulk_ingest: Error: {}", message), message)
    }
}

/// Batch report returned by bulk ingestion.
///
/// Serializes as `{"success_ingest": [...], "failure_ingest": [...]}`.
/// The per-file outcomes (with failure details) are kept alongside for
/// logging and tests but are not part of the wire shape.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub success_ingest: Vec<String>,
    pub failure_ingest: Vec<String>,
    #[serde(skip)]
    pub outcomes: Vec<IngestOutcome>,
}

impl IngestReport {
    pub fn from_outcomes(outcomes: Vec<IngestOutcome>) -> Self {
        let mut report = IngestReport::default();
        for outcome in outcomes {
            report.push(outcome);
        }
        report
    }

    pub fn push(&mut self, outcome: IngestOutcome) {
        match outcome.status {
            IngestStatus::Success => self.success_ingest.push(outcome.path.clone()),
            IngestStatus::Failure => self.failure_ingest.push(outcome.path.clone()),
        }
        self.outcomes.push(outcome);
    }

    /// A report carrying a single synthetic failure entry, used when the
    /// whole batch could not run.
    pub fn major_error(message: &str) -> Self {
        let mut report = IngestReport::default();
        report.push(IngestOutcome::major_error(message));
        report
    }
}

/// A retrieved context in its public response shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub text: String,
    pub readable_filename: String,
    pub course_name: String,
    pub s3_path: String,
    pub pagenumber_or_timestamp: PageOrTimestamp,
}

/// A distinct file ingested into a course.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CourseFile {
    pub course_name: String,
    pub s3_path: String,
    pub readable_filename: String,
}

/// A `{content, metadata}` pair, the row shape of both the relational
/// chunk log and the monitor's context list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRecord {
    pub content: String,
    pub metadata: ChunkMetadata,
}

/// One monitored query: the prompt, what was returned, and the course.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRecord {
    pub prompt: String,
    pub contexts: Vec<ContextRecord>,
    pub course_name: String,
}
