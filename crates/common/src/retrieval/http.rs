//! HTTP client for the search service's `/v2/search` endpoint

use super::{RetrievalAdapter, RetrievedChunk, SearchFilters};
use crate::config::RetrievalConfig;
use crate::errors::{AppError, Result, RetrievalError};
use crate::metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    filters: &'a SearchFilters,
    top_k: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    results: Vec<RetrievedChunk>,
}

/// Search service client
pub struct HttpRetrievalClient {
    client: reqwest::Client,
    config: RetrievalConfig,
}

impl HttpRetrievalClient {
    /// Create a new client
    pub fn new(config: RetrievalConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!("{}/v2/search", self.config.base_url.trim_end_matches('/'))
    }

    async fn make_request(
        &self,
        query_text: &str,
        filters: &SearchFilters,
        top_k: usize,
    ) -> std::result::Result<Vec<RetrievedChunk>, RetrievalError> {
        let request = SearchRequest { query: query_text, filters, top_k };

        let mut builder = self.client.post(self.url()).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RetrievalError::Timeout {
                    timeout_ms: self.config.timeout_secs * 1000,
                }
            } else {
                RetrievalError::Unavailable {
                    message: format!("Request failed: {}", e),
                    retryable: true,
                }
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Unavailable {
                message: format!("Search API error {}: {}", status, body),
                retryable: status.as_u16() == 429 || status.is_server_error(),
            });
        }

        let result: SearchResponse = response.json().await.map_err(|e| RetrievalError::Unavailable {
            message: format!("Failed to parse response: {}", e),
            retryable: false,
        })?;

        let mut chunks = result.results;
        chunks.truncate(top_k);
        Ok(chunks)
    }
}

#[async_trait]
impl RetrievalAdapter for HttpRetrievalClient {
    async fn search(
        &self,
        query_text: &str,
        filters: &SearchFilters,
        top_k: usize,
    ) -> std::result::Result<Vec<RetrievedChunk>, RetrievalError> {
        let start = Instant::now();
        let result = self.make_request(query_text, filters, top_k).await;

        metrics::record_retrieval(
            start.elapsed().as_secs_f64(),
            result.as_ref().map(Vec::len).unwrap_or(0),
            result.is_ok(),
        );

        if let Err(e) = &result {
            tracing::warn!(error = %e, top_k, "Search request failed");
        }
        result
    }
}
