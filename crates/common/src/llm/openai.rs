//! OpenAI-compatible chat completions client

use super::{LlmAdapter, LlmRequest, LlmResponse, ModelClass, TokenUsage};
use crate::config::LlmConfig;
use crate::errors::{AppError, LlmError, Result};
use crate::metrics;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Splits a byte stream into SSE lines. Bytes are held until a line is
/// complete, so a character split across network chunks decodes intact.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(end) = self.bytes.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.bytes.drain(..=end).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }

    /// Whatever trails the last newline
    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.bytes);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

fn parse_data_line(line: &str) -> Option<StreamChunk> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str(data) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparseable stream line");
            None
        }
    }
}

/// Client for any endpoint speaking the chat completions protocol
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl OpenAiCompatibleClient {
    /// Create a new client
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    fn model_for(&self, class: ModelClass) -> &str {
        match class {
            ModelClass::Primary => &self.config.primary_model,
            ModelClass::Fast => &self.config.fast_model,
        }
    }

    fn body<'a>(&'a self, request: &'a LlmRequest, stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: self.model_for(request.model_class),
            messages: vec![
                ChatMessage { role: "system", content: &request.system },
                ChatMessage { role: "user", content: &request.prompt },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature.unwrap_or(self.config.temperature),
            stream,
        }
    }

    async fn send(&self, request: &LlmRequest, stream: bool) -> std::result::Result<reqwest::Response, LlmError> {
        let mut builder = self.client.post(&self.config.endpoint).json(&self.body(request, stream));
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| self.map_transport(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(LlmError::RateLimited { message: body });
            }
            return Err(LlmError::Provider {
                message: format!("LLM API error {}: {}", status, body),
                retryable: status.is_server_error(),
            });
        }

        Ok(response)
    }

    fn map_transport(&self, err: reqwest::Error) -> LlmError {
        if err.is_timeout() {
            LlmError::Timeout {
                timeout_ms: self.config.timeout_secs * 1000,
            }
        } else {
            LlmError::Provider {
                message: format!("LLM API request failed: {}", err),
                retryable: err.is_connect() || err.is_request(),
            }
        }
    }

    async fn generate_inner(&self, request: &LlmRequest) -> std::result::Result<LlmResponse, LlmError> {
        let response = self.send(request, false).await?;

        let chat: ChatResponse = response.json().await.map_err(|e| LlmError::Provider {
            message: format!("Failed to parse LLM response: {}", e),
            retryable: false,
        })?;

        let text = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Provider {
                message: "Empty response from LLM".to_string(),
                retryable: true,
            })?;

        let usage = chat
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_else(|| TokenUsage::estimated(request, &text));

        Ok(LlmResponse { text, usage })
    }

    async fn stream_inner(
        &self,
        request: &LlmRequest,
        deltas: mpsc::Sender<String>,
    ) -> std::result::Result<LlmResponse, LlmError> {
        let response = self.send(request, true).await?;

        let mut stream = response.bytes_stream();
        let mut text = String::new();
        let mut usage = None;
        let mut lines = LineBuffer::default();

        loop {
            let (batch, done) = match stream.next().await {
                Some(chunk) => (lines.push(&chunk.map_err(|e| self.map_transport(e))?), false),
                None => (lines.finish().into_iter().collect::<Vec<_>>(), true),
            };

            for parsed in batch.iter().filter_map(|line| parse_data_line(line)) {
                if let Some(delta) = parsed.choices.first().and_then(|c| c.delta.content.clone()) {
                    text.push_str(&delta);
                    // Receiver may be gone; generation still completes
                    let _ = deltas.send(delta).await;
                }
                if let Some(u) = parsed.usage {
                    usage = Some(TokenUsage {
                        prompt_tokens: u.prompt_tokens,
                        completion_tokens: u.completion_tokens,
                    });
                }
            }

            if done {
                break;
            }
        }

        let usage = usage.unwrap_or_else(|| TokenUsage::estimated(request, &text));
        Ok(LlmResponse { text, usage })
    }
}

#[async_trait]
impl LlmAdapter for OpenAiCompatibleClient {
    async fn generate(&self, request: &LlmRequest) -> std::result::Result<LlmResponse, LlmError> {
        let start = Instant::now();
        let result = self.generate_inner(request).await;
        metrics::record_llm_call(
            start.elapsed().as_secs_f64(),
            request.model_class.as_str(),
            result.is_ok(),
        );
        result
    }

    async fn stream(
        &self,
        request: &LlmRequest,
        deltas: mpsc::Sender<String>,
    ) -> std::result::Result<LlmResponse, LlmError> {
        let start = Instant::now();
        let result = self.stream_inner(request, deltas).await;
        metrics::record_llm_call(
            start.elapsed().as_secs_f64(),
            request.model_class.as_str(),
            result.is_ok(),
        );
        result
    }
}
