//! Sub-answer worker: retrieve, filter, generate one grounded partial answer

use std::sync::Arc;
use tokio::sync::mpsc;

use super::citations::rewrite_markers;
use super::gate::{governed_llm, governed_search, StepGate, StreamUpdate};
use super::model::{PartialAnswer, StepKind, SubQuestion};
use super::prompts;
use crate::config::RunConfig;
use crate::errors::{LlmError, StageError};
use crate::llm::{LlmAdapter, LlmRequest, ModelClass};
use crate::retrieval::{filter_and_rerank, RetrievalAdapter, RetrievedChunk};

/// Confidence floor for an answer with text but no citations
const MIN_CONFIDENCE: f32 = 0.05;

pub const NO_DOCUMENTS_TEXT: &str = "No relevant documents were found for this question.";
pub const LLM_TIMEOUT_TEXT: &str =
    "The language model took too long to respond, so this question could not be answered.";
pub const LLM_RATE_LIMIT_TEXT: &str =
    "The language model is receiving too many requests right now, so this question could not be answered.";

/// Read-only view of the run handed to each worker
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub query_text: Arc<str>,
    pub persona: Option<Arc<str>>,
    pub config: Arc<RunConfig>,
}

/// What a finished branch hands back to the executor
#[derive(Debug, Clone)]
pub struct BranchOutput {
    pub answer: PartialAnswer,
    /// Context chunks the answer was generated from
    pub chunks: Vec<RetrievedChunk>,
    /// Recovered failure that produced a zero-confidence answer
    pub failure: Option<StageError>,
}

impl BranchOutput {
    pub fn failed(sub_question_id: usize, failure: StageError) -> Self {
        Self {
            answer: PartialAnswer::failed(sub_question_id),
            chunks: Vec::new(),
            failure: Some(failure),
        }
    }
}

/// Map the context numbers the model cited onto `supporting_chunk_ids`.
///
/// Returns the rewritten text, where `[i]` refers to the i-th supporting
/// chunk, and the supporting ids in order of first citation. Numbers outside
/// the context are removed.
pub fn attach_citations(text: &str, chunks: &[RetrievedChunk]) -> (String, Vec<String>) {
    let mut supporting: Vec<String> = Vec::new();
    let (rewritten, _) = rewrite_markers(text, |n| {
        let chunk = chunks.get(n.checked_sub(1)?)?;
        let position = match supporting.iter().position(|id| id == &chunk.chunk_id) {
            Some(position) => position,
            None => {
                supporting.push(chunk.chunk_id.clone());
                supporting.len() - 1
            }
        };
        Some(position + 1)
    });
    (rewritten, supporting)
}

/// Citation coverage, mean relevance and answer length, weighted 0.4/0.4/0.2
pub fn answer_confidence(text: &str, chunks: &[RetrievedChunk], supporting: &[String]) -> f32 {
    if text.trim().is_empty() || chunks.is_empty() {
        return 0.0;
    }

    let coverage = supporting.len() as f32 / chunks.len() as f32;
    let avg_relevance = chunks.iter().map(|c| c.relevance_score).sum::<f32>() / chunks.len() as f32;
    let length_factor = (text.len() as f32 / 500.0).min(1.0);

    (coverage * 0.4 + avg_relevance * 0.4 + length_factor * 0.2).clamp(MIN_CONFIDENCE, 1.0)
}

pub struct SubAnswerWorker {
    llm: Arc<dyn LlmAdapter>,
    retrieval: Arc<dyn RetrievalAdapter>,
    snapshot: RunSnapshot,
}

impl SubAnswerWorker {
    pub fn new(llm: Arc<dyn LlmAdapter>, retrieval: Arc<dyn RetrievalAdapter>, snapshot: RunSnapshot) -> Self {
        Self { llm, retrieval, snapshot }
    }

    /// Answer one branch of a decomposed query on the fast model
    pub async fn answer<G: StepGate + ?Sized>(
        &self,
        sub_question: &SubQuestion,
        gate: &mut G,
    ) -> Result<BranchOutput, StageError> {
        let max_tokens = self.snapshot.config.max_sub_answer_tokens;
        self.run(sub_question, gate, ModelClass::Fast, max_tokens, None, true).await
    }

    /// Answer the whole query on the primary model, streaming deltas
    pub async fn answer_streaming<G: StepGate + ?Sized>(
        &self,
        sub_question: &SubQuestion,
        gate: &mut G,
        deltas: mpsc::Sender<StreamUpdate>,
    ) -> Result<BranchOutput, StageError> {
        let max_tokens = self.snapshot.config.max_answer_tokens;
        self.run(sub_question, gate, ModelClass::Primary, max_tokens, Some(deltas), false)
            .await
    }

    /// Only budget denials and cancellation escape; every other failure
    /// becomes a zero-confidence answer.
    async fn run<G: StepGate + ?Sized>(
        &self,
        sub_question: &SubQuestion,
        gate: &mut G,
        model_class: ModelClass,
        max_tokens: u32,
        deltas: Option<mpsc::Sender<StreamUpdate>>,
        branch: bool,
    ) -> Result<BranchOutput, StageError> {
        let config = &self.snapshot.config;
        let branch_id = branch.then_some(sub_question.id);

        let retrieved = match governed_search(
            gate,
            self.retrieval.as_ref(),
            &sub_question.text,
            &config.filters,
            config.top_k,
            StepKind::Retrieval,
            branch_id,
            config.retry_backoff(),
        )
        .await
        {
            Ok(chunks) => chunks,
            Err(err) => return recover(sub_question.id, err),
        };

        let chunks = filter_and_rerank(
            retrieved,
            config.relevance_floor,
            config.dedupe_by_document,
            config.max_context_chunks,
        );

        if chunks.is_empty() {
            tracing::debug!(sub_question_id = sub_question.id, "No relevant chunks retrieved");
            return Ok(BranchOutput {
                answer: PartialAnswer::unanswered(sub_question.id, NO_DOCUMENTS_TEXT),
                chunks,
                failure: None,
            });
        }

        let request = LlmRequest::new(
            prompts::SUB_ANSWER_SYSTEM,
            prompts::sub_answer_prompt(
                &sub_question.text,
                branch.then_some(&*self.snapshot.query_text),
                &chunks,
                self.snapshot.persona.as_deref(),
            ),
            model_class,
            max_tokens,
        );

        let response = match governed_llm(
            gate,
            self.llm.as_ref(),
            &request,
            StepKind::Generation,
            branch_id,
            None,
            config.retry_backoff(),
            deltas,
        )
        .await
        {
            Ok(response) => response,
            Err(err) => return recover(sub_question.id, err),
        };

        let (text, supporting_chunk_ids) = attach_citations(response.text.trim(), &chunks);
        let confidence = answer_confidence(&text, &chunks, &supporting_chunk_ids);

        tracing::debug!(
            sub_question_id = sub_question.id,
            cited = supporting_chunk_ids.len(),
            confidence,
            "Sub-answer generated"
        );

        Ok(BranchOutput {
            answer: PartialAnswer {
                sub_question_id: sub_question.id,
                text,
                supporting_chunk_ids,
                confidence,
            },
            chunks,
            failure: None,
        })
    }
}

fn recover(sub_question_id: usize, err: StageError) -> Result<BranchOutput, StageError> {
    match err {
        StageError::BudgetExhausted(_) | StageError::Cancelled => Err(err),
        err => {
            tracing::warn!(sub_question_id, error = %err, "Sub-answer failed");
            let mut output = BranchOutput::failed(sub_question_id, err);
            if let Some(explanation) = output.failure.as_ref().and_then(failure_text) {
                output.answer = PartialAnswer::unanswered(sub_question_id, explanation);
            }
            Ok(output)
        }
    }
}

/// Reader-facing explanation for model failures worth naming
fn failure_text(err: &StageError) -> Option<&'static str> {
    match err {
        StageError::Provider(LlmError::Timeout { .. }) => Some(LLM_TIMEOUT_TEXT),
        StageError::Provider(LlmError::RateLimited { .. }) => Some(LLM_RATE_LIMIT_TEXT),
        _ => None,
    }
}
