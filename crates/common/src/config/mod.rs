//! Configuration management for AnswerForge services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values
//!
//! Run budgets live in [`RunConfig`], which is passed explicitly into every
//! run rather than read from process state.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

use crate::errors::{AppError, Result};
use crate::llm::ModelClass;
use crate::retrieval::SearchFilters;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// LLM backend configuration
    pub llm: LlmConfig,

    /// External search service configuration
    pub retrieval: RetrievalConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,

    /// Default run configuration, overridable per request
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Chat completions endpoint (OpenAI-compatible)
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    /// API key
    pub api_key: Option<String>,

    /// Model used for the primary (high quality) class
    #[serde(default = "default_primary_model")]
    pub primary_model: String,

    /// Model used for the fast (low latency) class
    #[serde(default = "default_fast_model")]
    pub fast_model: String,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Base URL of the search service
    #[serde(default = "default_retrieval_url")]
    pub base_url: String,

    /// API key sent as bearer token
    pub api_key: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// How the search-need classifier decides
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierMode {
    /// Deterministic keyword heuristic, no backend call
    Heuristic,
    /// One fast-model call
    Llm,
}

/// Budgets and knobs for a single query run
#[derive(Debug, Clone, Deserialize, Serialize, Validate, PartialEq)]
pub struct RunConfig {
    /// Upper bound on sub-questions produced by decomposition
    #[serde(default = "default_max_sub_questions")]
    #[validate(range(min = 1, max = 5))]
    pub max_sub_questions: usize,

    #[serde(default = "default_run_wall_clock")]
    #[validate(range(min = 1))]
    pub max_wall_clock_per_run_ms: u64,

    #[serde(default = "default_step_wall_clock")]
    #[validate(range(min = 1))]
    pub max_wall_clock_per_step_ms: u64,

    /// Aggregate ceiling for one retrieve+generate branch
    #[serde(default = "default_branch_wall_clock")]
    #[validate(range(min = 1))]
    pub max_wall_clock_per_branch_ms: u64,

    #[serde(default = "default_max_tokens_per_run")]
    #[validate(range(min = 1))]
    pub max_tokens_per_run: u64,

    /// Ceiling on backend calls (retrieval or LLM) per run
    #[serde(default = "default_max_steps")]
    #[validate(range(min = 1))]
    pub max_steps: u32,

    /// false forces the simple (single retrieval) path
    #[serde(default = "default_true")]
    pub enable_decomposition: bool,

    #[serde(default = "default_decomposition_model")]
    pub model_for_decomposition: ModelClass,

    #[serde(default = "default_classifier_mode")]
    pub classifier: ClassifierMode,

    #[serde(default = "default_classifier_timeout")]
    #[validate(range(min = 1))]
    pub classifier_timeout_ms: u64,

    /// Chunks retrieved per answering step
    #[serde(default = "default_top_k")]
    #[validate(range(min = 1, max = 100))]
    pub top_k: usize,

    /// Chunks retrieved to ground decomposition
    #[serde(default = "default_exploratory_top_k")]
    #[validate(range(min = 1, max = 20))]
    pub exploratory_top_k: usize,

    /// Chunks scoring below this are dropped before generation
    #[serde(default = "default_relevance_floor")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub relevance_floor: f32,

    /// Keep only the best chunk per source document
    #[serde(default = "default_true")]
    pub dedupe_by_document: bool,

    #[serde(default = "default_max_context_chunks")]
    #[validate(range(min = 1, max = 50))]
    pub max_context_chunks: usize,

    #[serde(default = "default_max_answer_tokens")]
    #[validate(range(min = 1))]
    pub max_answer_tokens: u32,

    #[serde(default = "default_max_sub_answer_tokens")]
    #[validate(range(min = 1))]
    pub max_sub_answer_tokens: u32,

    #[serde(default = "default_max_decomposition_tokens")]
    #[validate(range(min = 1))]
    pub max_decomposition_tokens: u32,

    /// Initial delay before the single retry of a retryable failure
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Filters forwarded to every retrieval call
    #[serde(default)]
    pub filters: SearchFilters,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_llm_endpoint() -> String { "https://api.openai.com/v1/chat/completions".to_string() }
fn default_primary_model() -> String { "gpt-4o".to_string() }
fn default_fast_model() -> String { "gpt-4o-mini".to_string() }
fn default_llm_timeout() -> u64 { 60 }
fn default_temperature() -> f32 { 0.0 }
fn default_retrieval_url() -> String { "http://localhost:8081".to_string() }
fn default_retrieval_timeout() -> u64 { 10 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_max_sub_questions() -> usize { 3 }
fn default_run_wall_clock() -> u64 { 60_000 }
fn default_step_wall_clock() -> u64 { 20_000 }
fn default_branch_wall_clock() -> u64 { 30_000 }
fn default_max_tokens_per_run() -> u64 { 50_000 }
fn default_max_steps() -> u32 { 24 }
fn default_true() -> bool { true }
fn default_decomposition_model() -> ModelClass { ModelClass::Primary }
fn default_classifier_mode() -> ClassifierMode { ClassifierMode::Heuristic }
fn default_classifier_timeout() -> u64 { 3_000 }
fn default_top_k() -> usize { 5 }
fn default_exploratory_top_k() -> usize { 3 }
fn default_relevance_floor() -> f32 { 0.1 }
fn default_max_context_chunks() -> usize { 5 }
fn default_max_answer_tokens() -> u32 { 1024 }
fn default_max_sub_answer_tokens() -> u32 { 512 }
fn default_max_decomposition_tokens() -> u32 { 256 }
fn default_retry_backoff() -> u64 { 250 }

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_sub_questions: default_max_sub_questions(),
            max_wall_clock_per_run_ms: default_run_wall_clock(),
            max_wall_clock_per_step_ms: default_step_wall_clock(),
            max_wall_clock_per_branch_ms: default_branch_wall_clock(),
            max_tokens_per_run: default_max_tokens_per_run(),
            max_steps: default_max_steps(),
            enable_decomposition: true,
            model_for_decomposition: default_decomposition_model(),
            classifier: default_classifier_mode(),
            classifier_timeout_ms: default_classifier_timeout(),
            top_k: default_top_k(),
            exploratory_top_k: default_exploratory_top_k(),
            relevance_floor: default_relevance_floor(),
            dedupe_by_document: true,
            max_context_chunks: default_max_context_chunks(),
            max_answer_tokens: default_max_answer_tokens(),
            max_sub_answer_tokens: default_max_sub_answer_tokens(),
            max_decomposition_tokens: default_max_decomposition_tokens(),
            retry_backoff_ms: default_retry_backoff(),
            filters: SearchFilters::default(),
        }
    }
}

impl RunConfig {
    /// Validate ranges, mapping failures to a configuration error
    pub fn validated(self) -> Result<Self> {
        self.validate().map_err(|e| AppError::Configuration {
            message: format!("Invalid run configuration: {}", e),
        })?;
        Ok(self)
    }

    /// Overlay a partial JSON object of options on top of this configuration.
    ///
    /// Keys that are not run options are ignored; values of the wrong type or
    /// out of range are rejected.
    pub fn with_overrides(&self, overrides: &serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let mut base = match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => map,
            _ => {
                return Err(AppError::Internal {
                    message: "Run configuration did not serialize to an object".to_string(),
                })
            }
        };

        for (key, value) in overrides {
            base.insert(key.clone(), value.clone());
        }

        let merged: RunConfig = serde_json::from_value(serde_json::Value::Object(base))
            .map_err(|e| AppError::Validation {
                message: format!("Invalid run options: {}", e),
                field: Some("options".to_string()),
            })?;

        merged.validate()?;
        Ok(merged)
    }

    pub fn run_wall_clock(&self) -> Duration {
        Duration::from_millis(self.max_wall_clock_per_run_ms)
    }

    pub fn branch_wall_clock(&self) -> Duration {
        Duration::from_millis(self.max_wall_clock_per_branch_ms)
    }

    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_millis(self.classifier_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("llm.endpoint", default_llm_endpoint())?
            .set_default("retrieval.base_url", default_retrieval_url())?
            .set_default("observability.log_level", default_log_level())?

            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__RUN__MAX_STEPS=12
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        config.try_deserialize()
    }

    /// Grace period for in-flight requests after a shutdown signal
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
                shutdown_timeout_secs: default_shutdown_timeout(),
            },
            llm: LlmConfig {
                endpoint: default_llm_endpoint(),
                api_key: None,
                primary_model: default_primary_model(),
                fast_model: default_fast_model(),
                timeout_secs: default_llm_timeout(),
                temperature: default_temperature(),
            },
            retrieval: RetrievalConfig {
                base_url: default_retrieval_url(),
                api_key: None,
                timeout_secs: default_retrieval_timeout(),
            },
            observability: ObservabilityConfig {
                log_level: default_log_level(),
                json_logging: default_json_logging(),
                metrics_port: default_metrics_port(),
            },
            run: RunConfig::default(),
        }
    }
}
