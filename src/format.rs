//! Response shaping for retrieval results.

use crate::models::RetrievalHit;
use crate::store::ScoredChunk;

/// Map store hits to the public response shape, preserving order.
pub fn format_hits(hits: &[ScoredChunk]) -> Vec<RetrievalHit> {
    hits.iter()
        .map(|hit| RetrievalHit {
            text: hit.text.clone(),
            readable_filename: hit.metadata.readable_filename.clone(),
            course_name: hit.metadata.course_name.clone(),
            s3_path: hit.metadata.s3_path.clone(),
            pagenumber_or_timestamp: hit.metadata.pagenumber_or_timestamp.clone(),
        })
        .collect()
}
