//! Answer handlers

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use validator::Validate;

use crate::AppState;
use answerforge_common::{
    config::RunConfig,
    errors::{AppError, Result},
    orchestration::{ChatTurn, Query, RunEvent, RunResult},
};

/// Answer request
#[derive(Debug, Deserialize, Validate)]
pub struct AnswerRequest {
    #[validate(length(min = 1, max = 4000))]
    pub query: String,

    /// Prior conversation, oldest first
    #[serde(default)]
    pub history: Vec<ChatTurn>,

    #[serde(default)]
    pub persona: Option<String>,

    /// Run option overrides, e.g. `{"max_steps": 8}`
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl AnswerRequest {
    fn into_run(self, defaults: &RunConfig) -> Result<(Query, RunConfig)> {
        self.validate()?;
        if self.query.trim().is_empty() {
            return Err(AppError::Validation {
                message: "Query must not be blank".to_string(),
                field: Some("query".to_string()),
            });
        }

        let config = defaults.with_overrides(&self.options)?;
        let mut query = Query::new(self.query).with_history(self.history);
        if let Some(persona) = self.persona {
            query = query.with_persona(persona);
        }
        Ok((query, config))
    }
}

/// Answer response
#[derive(Serialize)]
pub struct AnswerResponse {
    #[serde(flatten)]
    pub result: RunResult,
    pub processing_time_ms: u64,
}

/// Answer a query and return the finished run
pub async fn answer(
    State(state): State<AppState>,
    Json(request): Json<AnswerRequest>,
) -> Result<Json<AnswerResponse>> {
    let start = Instant::now();
    let (query, config) = request.into_run(&state.run_defaults)?;
    let query_id = query.id;

    let result = state.engine.run(query, config).await;
    let processing_time_ms = start.elapsed().as_millis() as u64;

    tracing::info!(
        query_id = %query_id,
        run_id = %result.run_id,
        degraded = result.degraded,
        citations = result.citations.len(),
        latency_ms = processing_time_ms,
        "Answer completed"
    );

    Ok(Json(AnswerResponse { result, processing_time_ms }))
}

/// Answer a query as a server-sent event stream.
///
/// Emits `progress` events while the run is in flight and one final
/// `result` event carrying the run result.
pub async fn answer_stream(
    State(state): State<AppState>,
    Json(request): Json<AnswerRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>>> {
    let (query, config) = request.into_run(&state.run_defaults)?;
    tracing::info!(query_id = %query.id, "Streaming answer started");

    let events = state.engine.execute(query, config).map(|event| match event {
        RunEvent::Progress(progress) => Event::default().event("progress").json_data(progress),
        RunEvent::Finished(result) => Event::default().event("result").json_data(*result),
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_router;
    use answerforge_common::{
        errors::{LlmError, RetrievalError},
        llm::{LlmAdapter, LlmRequest, LlmResponse, TokenUsage},
        retrieval::{RetrievalAdapter, RetrievedChunk, SearchFilters},
        AnswerEngine,
    };
    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        Router,
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    const ANSWER: &str = "Cancellations within 14 days are refunded in full [1].";

    struct StubLlm;

    #[async_trait]
    impl LlmAdapter for StubLlm {
        async fn generate(&self, request: &LlmRequest) -> std::result::Result<LlmResponse, LlmError> {
            Ok(LlmResponse { text: ANSWER.to_string(), usage: TokenUsage::estimated(request, ANSWER) })
        }

        async fn stream(
            &self,
            request: &LlmRequest,
            deltas: mpsc::Sender<String>,
        ) -> std::result::Result<LlmResponse, LlmError> {
            let _ = deltas.send(ANSWER.to_string()).await;
            self.generate(request).await
        }
    }

    struct StubRetrieval;

    #[async_trait]
    impl RetrievalAdapter for StubRetrieval {
        async fn search(
            &self,
            _query_text: &str,
            _filters: &SearchFilters,
            _top_k: usize,
        ) -> std::result::Result<Vec<RetrievedChunk>, RetrievalError> {
            Ok(vec![RetrievedChunk {
                document_id: "refund-policy".to_string(),
                chunk_id: "refund-policy#0".to_string(),
                text: "Orders cancelled within 14 days receive a full refund.".to_string(),
                relevance_score: 0.92,
                source_metadata: BTreeMap::new(),
            }])
        }
    }

    fn app() -> Router {
        create_router(AppState {
            engine: AnswerEngine::new(Arc::new(StubLlm), Arc::new(StubRetrieval)),
            run_defaults: Arc::new(RunConfig::default()),
        })
    }

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_answer_returns_cited_result() {
        let request = post(
            "/v1/answer",
            serde_json::json!({
                "query": "What is our refund policy for cancellations?",
                "options": { "enable_decomposition": false }
            }),
        );

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));

        let body = body_json(response).await;
        assert_eq!(body["final_text"], ANSWER);
        assert_eq!(body["degraded"], false);
        assert_eq!(body["citations"][0]["chunk_id"], "refund-policy#0");
        assert_eq!(body["citations"][0]["document_id"], "refund-policy");
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let response = app().oneshot(post("/v1/answer", serde_json::json!({ "query": "" }))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app().oneshot(post("/v1/answer", serde_json::json!({ "query": "   " }))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let request = post(
            "/v1/answer",
            serde_json::json!({ "query": "refunds?", "options": { "max_steps": "many" } }),
        );
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["field"], "options");
    }

    #[tokio::test]
    async fn test_stream_ends_with_result() {
        let request = post(
            "/v1/answer/stream",
            serde_json::json!({
                "query": "What is our refund policy for cancellations?",
                "options": { "enable_decomposition": false }
            }),
        );

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.contains("event: progress"));
        assert_eq!(body.matches("event: result").count(), 1);

        let last = body.rfind("event: progress").unwrap();
        assert!(body.rfind("event: result").unwrap() > last);
    }
}
