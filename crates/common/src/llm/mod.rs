//! LLM backend abstraction
//!
//! Provides a unified interface over language-model providers with two
//! model classes:
//! - Primary (high quality, used for final answers and decomposition)
//! - Fast (low latency, used for classification and sub-answers)

mod openai;

pub use openai::OpenAiCompatibleClient;

use crate::errors::LlmError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Model tier selected per step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelClass {
    Primary,
    Fast,
}

impl ModelClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelClass::Primary => "primary",
            ModelClass::Fast => "fast",
        }
    }
}

impl std::fmt::Display for ModelClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single generation request
#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    /// System instruction
    pub system: String,

    /// User prompt
    pub prompt: String,

    pub model_class: ModelClass,

    /// Maximum output tokens
    pub max_tokens: u32,

    pub temperature: Option<f32>,
}

impl LlmRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>, model_class: ModelClass, max_tokens: u32) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            model_class,
            max_tokens,
            temperature: None,
        }
    }

    /// Estimated prompt size, used when asking the budget governor
    pub fn estimated_prompt_tokens(&self) -> u64 {
        estimate_tokens(&self.system) + estimate_tokens(&self.prompt)
    }
}

/// Token accounting reported by the provider (or estimated)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Usage estimated from text when the provider reports none
    pub fn estimated(request: &LlmRequest, completion: &str) -> Self {
        Self {
            prompt_tokens: request.estimated_prompt_tokens(),
            completion_tokens: estimate_tokens(completion),
        }
    }
}

/// Completed generation
#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Trait for language-model backends
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Generate a full completion
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Generate incrementally, sending text deltas as they arrive.
    ///
    /// Returns the complete response once the stream ends. A closed delta
    /// channel does not abort generation.
    async fn stream(&self, request: &LlmRequest, deltas: mpsc::Sender<String>) -> Result<LlmResponse, LlmError>;
}

/// Rough token estimate: four characters per token
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
