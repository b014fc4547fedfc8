//! AnswerForge Common Library
//!
//! Core of the AnswerForge answering service including:
//! - Query orchestration (classification, decomposition, sub-answers, synthesis)
//! - Budget governance for every backend step
//! - LLM and retrieval adapter abstractions
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod config;
pub mod errors;
pub mod llm;
pub mod metrics;
pub mod orchestration;
pub mod retrieval;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use errors::{AppError, Result};
pub use config::{AppConfig, RunConfig};
pub use llm::LlmAdapter;
pub use orchestration::{AnswerEngine, Query, RunEvent, RunResult};
pub use retrieval::RetrievalAdapter;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
