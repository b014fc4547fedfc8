//! Retrieval adapter for the external search service
//!
//! The index itself lives elsewhere; this module only knows how to ask it
//! for ranked chunks and how to trim what comes back.

mod http;

pub use http::HttpRetrievalClient;

use crate::errors::RetrievalError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Chunk returned by the search service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedChunk {
    /// Source document ID
    pub document_id: String,

    /// Chunk ID, unique across the index
    pub chunk_id: String,

    /// Chunk content
    pub text: String,

    /// Relevance score (0.0 - 1.0)
    pub relevance_score: f32,

    /// Title, link, source type and similar
    #[serde(default)]
    pub source_metadata: BTreeMap<String, String>,
}

impl RetrievedChunk {
    /// Display title, falling back to the document ID
    pub fn title(&self) -> &str {
        self.source_metadata
            .get("title")
            .map(String::as_str)
            .unwrap_or(&self.document_id)
    }
}

/// Filters forwarded verbatim to the search service
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_types: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ids: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    /// Only documents updated after this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_cutoff: Option<DateTime<Utc>>,
}

/// Common trait for search backends
#[async_trait]
pub trait RetrievalAdapter: Send + Sync {
    /// Ranked chunks for a query, best first
    async fn search(
        &self,
        query_text: &str,
        filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError>;
}

/// Drop weak chunks, optionally keep one chunk per document, order by score.
///
/// Ties keep their retrieval order.
pub fn filter_and_rerank(
    chunks: Vec<RetrievedChunk>,
    relevance_floor: f32,
    dedupe_by_document: bool,
    limit: usize,
) -> Vec<RetrievedChunk> {
    let mut kept: Vec<RetrievedChunk> = chunks
        .into_iter()
        .filter(|c| c.relevance_score >= relevance_floor)
        .collect();

    kept.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    if dedupe_by_document {
        let mut seen_documents = HashSet::new();
        kept.retain(|c| seen_documents.insert(c.document_id.clone()));
    }

    let mut seen_chunks = HashSet::new();
    kept.retain(|c| seen_chunks.insert(c.chunk_id.clone()));

    kept.truncate(limit);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc: &str, id: &str, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            document_id: doc.to_string(),
            chunk_id: id.to_string(),
            text: format!("text of {}", id),
            relevance_score: score,
            source_metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_floor_and_order() {
        let chunks = vec![chunk("d1", "c1", 0.2), chunk("d2", "c2", 0.05), chunk("d3", "c3", 0.9)];
        let kept = filter_and_rerank(chunks, 0.1, true, 10);
        let ids: Vec<_> = kept.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c3", "c1"]);
    }

    #[test]
    fn test_dedupe_keeps_best_chunk_per_document() {
        let chunks = vec![chunk("d1", "c1", 0.4), chunk("d1", "c2", 0.8), chunk("d2", "c3", 0.5)];
        let kept = filter_and_rerank(chunks.clone(), 0.0, true, 10);
        let ids: Vec<_> = kept.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c3"]);

        let all = filter_and_rerank(chunks, 0.0, false, 10);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_limit_and_duplicate_chunk_ids() {
        let chunks = vec![chunk("d1", "c1", 0.9), chunk("d2", "c1", 0.8), chunk("d3", "c3", 0.7)];
        let kept = filter_and_rerank(chunks, 0.0, false, 1);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].chunk_id, "c1");
    }

    #[test]
    fn test_title_fallback() {
        let mut c = chunk("doc-7", "c1", 0.5);
        assert_eq!(c.title(), "doc-7");
        c.source_metadata.insert("title".to_string(), "Refund Policy".to_string());
        assert_eq!(c.title(), "Refund Policy");
    }
}
