//! Scripted backends for unit tests

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::errors::{LlmError, RetrievalError};
use crate::llm::{LlmAdapter, LlmRequest, LlmResponse, TokenUsage};
use crate::retrieval::{RetrievalAdapter, RetrievedChunk, SearchFilters};

type LlmHandler = Box<dyn Fn(&LlmRequest) -> Result<String, LlmError> + Send + Sync>;
type SearchHandler = Box<dyn Fn(&str, usize) -> Result<Vec<RetrievedChunk>, RetrievalError> + Send + Sync>;

pub fn chunk(document_id: &str, chunk_id: &str, relevance_score: f32) -> RetrievedChunk {
    RetrievedChunk {
        document_id: document_id.to_string(),
        chunk_id: chunk_id.to_string(),
        text: format!("Content of {} from {}", chunk_id, document_id),
        relevance_score,
        source_metadata: BTreeMap::new(),
    }
}

/// LLM whose replies come from a closure over the request
pub struct ScriptedLlm {
    handler: LlmHandler,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn replying<F>(handler: F) -> Self
    where
        F: Fn(&LlmRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before every reply
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    async fn reply(&self, request: &LlmRequest) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(request)
    }
}

#[async_trait]
impl LlmAdapter for ScriptedLlm {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let text = self.reply(request).await?;
        Ok(LlmResponse { usage: TokenUsage::estimated(request, &text), text })
    }

    async fn stream(&self, request: &LlmRequest, deltas: mpsc::Sender<String>) -> Result<LlmResponse, LlmError> {
        let text = self.reply(request).await?;
        for word in text.split_inclusive(' ') {
            let _ = deltas.send(word.to_string()).await;
        }
        Ok(LlmResponse { usage: TokenUsage::estimated(request, &text), text })
    }
}

/// Search backend whose results come from a closure over query and top-k
pub struct ScriptedRetrieval {
    handler: SearchHandler,
    delay: Option<Duration>,
    calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl ScriptedRetrieval {
    pub fn returning<F>(handler: F) -> Self
    where
        F: Fn(&str, usize) -> Result<Vec<RetrievedChunk>, RetrievalError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            delay: None,
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl RetrievalAdapter for ScriptedRetrieval {
    async fn search(
        &self,
        query_text: &str,
        _filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query_text.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut chunks = (self.handler)(query_text, top_k)?;
        chunks.truncate(top_k);
        Ok(chunks)
    }
}
