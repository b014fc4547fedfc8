//! Answer synthesis and citation mapping
//!
//! Every supporting chunk of the usable partial answers gets one global
//! number. Partial answers are rewritten onto those numbers before they are
//! merged, and the merged text is resolved back to chunks. Numbers that are
//! not in the table are dropped, so no citation can point outside the
//! partial answers that were consumed.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::budget::BudgetDenial;
use super::citations::rewrite_markers;
use super::decomposer::normalize_question;
use super::gate::{governed_llm, StepGate, StreamUpdate};
use super::model::{Citation, PartialAnswer, Query, StepKind, SubQuestion};
use super::prompts;
use crate::config::RunConfig;
use crate::errors::StageError;
use crate::llm::{LlmAdapter, LlmRequest, ModelClass};

/// Final text when nothing usable was produced
pub const NO_ANSWER_TEXT: &str =
    "I was unable to fully answer this question: no relevant information could be found within the available budget.";

/// Global numbering of supporting chunks, starting at 1
#[derive(Debug, Clone, Default)]
pub struct SourceTable {
    entries: Vec<(String, String)>,
    numbers: HashMap<String, usize>,
}

impl SourceTable {
    /// Number the supporting chunks of `partials` in order of appearance.
    /// `documents` maps chunk ids to document ids.
    pub fn build(partials: &[&PartialAnswer], documents: &HashMap<String, String>) -> Self {
        let mut table = Self::default();
        for chunk_id in partials.iter().flat_map(|p| p.supporting_chunk_ids.iter()) {
            if table.numbers.contains_key(chunk_id) {
                continue;
            }
            let document_id = documents.get(chunk_id).cloned().unwrap_or_default();
            table.entries.push((chunk_id.clone(), document_id));
            table.numbers.insert(chunk_id.clone(), table.entries.len());
        }
        table
    }

    pub fn number_of(&self, chunk_id: &str) -> Option<usize> {
        self.numbers.get(chunk_id).copied()
    }

    /// Chunk and document id behind a global number
    pub fn get(&self, number: usize) -> Option<(&str, &str)> {
        let (chunk_id, document_id) = self.entries.get(number.checked_sub(1)?)?;
        Some((chunk_id.as_str(), document_id.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Rewrite a partial answer's local markers onto global numbers
pub fn globalize(partial: &PartialAnswer, table: &SourceTable) -> String {
    let (text, _) = rewrite_markers(&partial.text, |local| {
        let chunk_id = partial.supporting_chunk_ids.get(local.checked_sub(1)?)?;
        table.number_of(chunk_id)
    });
    text
}

/// Turn markers in `text` into citations, removing unknown numbers
pub fn resolve_citations(text: &str, table: &SourceTable) -> (String, Vec<Citation>) {
    let (resolved, written) = rewrite_markers(text, |n| table.get(n).map(|_| n));
    let citations = written
        .into_iter()
        .filter_map(|(offset, number)| {
            let (chunk_id, document_id) = table.get(number)?;
            Some(Citation {
                answer_span_offset: offset,
                chunk_id: chunk_id.to_string(),
                document_id: document_id.to_string(),
                citation_num: number,
            })
        })
        .collect();
    (resolved, citations)
}

/// Sub-answers concatenated under their sub-questions
pub fn fallback_text(partials: &[&PartialAnswer], sub_questions: &[SubQuestion], table: &SourceTable) -> String {
    if partials.is_empty() {
        return NO_ANSWER_TEXT.to_string();
    }
    partials
        .iter()
        .map(|partial| {
            let sub_question = sub_questions.iter().find(|sq| sq.id == partial.sub_question_id);
            prompts::fallback_section(sub_question, partial, &globalize(partial, table))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub text: String,
    pub citations: Vec<Citation>,
    /// Text is a concatenation or the no-answer message
    pub fell_back: bool,
    /// The merge step was denied by the governor
    pub denied: Option<BudgetDenial>,
    pub recovered: Option<StageError>,
}

impl Synthesis {
    fn resolved(text: &str, table: &SourceTable, fell_back: bool) -> Self {
        let (text, citations) = resolve_citations(text, table);
        Self { text, citations, fell_back, denied: None, recovered: None }
    }
}

pub struct AnswerSynthesizer {
    llm: Arc<dyn LlmAdapter>,
    config: Arc<RunConfig>,
}

impl AnswerSynthesizer {
    pub fn new(llm: Arc<dyn LlmAdapter>, config: Arc<RunConfig>) -> Self {
        Self { llm, config }
    }

    /// Pass-through applies when one partial answer already answers the
    /// whole query.
    fn is_pass_through(query: &Query, sub_questions: &[SubQuestion], usable: &[&PartialAnswer]) -> bool {
        usable.len() == 1
            && match sub_questions {
                [] => true,
                [only] => normalize_question(&only.text) == normalize_question(&query.raw_text),
                _ => false,
            }
    }

    /// Degraded result from whatever partial answers exist, without a
    /// backend call
    pub fn salvage(
        &self,
        sub_questions: &[SubQuestion],
        partials: &[PartialAnswer],
        documents: &HashMap<String, String>,
    ) -> Synthesis {
        let usable: Vec<&PartialAnswer> = partials.iter().filter(|p| p.is_usable()).collect();
        let table = SourceTable::build(&usable, documents);
        Synthesis::resolved(&fallback_text(&usable, sub_questions, &table), &table, true)
    }

    /// Merge the usable partial answers into the final text. Only
    /// cancellation is an error; a denied or failed merge falls back to
    /// concatenation.
    pub async fn synthesize<G: StepGate + ?Sized>(
        &self,
        query: &Query,
        sub_questions: &[SubQuestion],
        partials: &[PartialAnswer],
        documents: &HashMap<String, String>,
        gate: &mut G,
        deltas: Option<mpsc::Sender<StreamUpdate>>,
    ) -> Result<Synthesis, StageError> {
        let usable: Vec<&PartialAnswer> = partials.iter().filter(|p| p.is_usable()).collect();
        let table = SourceTable::build(&usable, documents);

        if usable.is_empty() {
            return Ok(Synthesis::resolved(NO_ANSWER_TEXT, &table, true));
        }

        if Self::is_pass_through(query, sub_questions, &usable) {
            return Ok(Synthesis::resolved(&globalize(usable[0], &table), &table, false));
        }

        let answers: Vec<(&SubQuestion, String)> = usable
            .iter()
            .filter_map(|partial| {
                let sub_question = sub_questions.iter().find(|sq| sq.id == partial.sub_question_id)?;
                Some((sub_question, globalize(partial, &table)))
            })
            .collect();

        let request = LlmRequest::new(
            prompts::SYNTHESIS_SYSTEM,
            prompts::synthesis_prompt(&query.raw_text, &answers, query.persona.as_deref()),
            ModelClass::Primary,
            self.config.max_answer_tokens,
        );

        let result = governed_llm(
            gate,
            self.llm.as_ref(),
            &request,
            StepKind::Synthesis,
            None,
            None,
            self.config.retry_backoff(),
            deltas,
        )
        .await;

        let fallback = || fallback_text(&usable, sub_questions, &table);
        match result {
            Ok(response) if !response.text.trim().is_empty() => {
                Ok(Synthesis::resolved(response.text.trim(), &table, false))
            }
            Ok(_) => {
                tracing::warn!("Synthesis returned no text, concatenating sub-answers");
                Ok(Synthesis::resolved(&fallback(), &table, true))
            }
            Err(StageError::Cancelled) => Err(StageError::Cancelled),
            Err(StageError::BudgetExhausted(denial)) => {
                tracing::warn!(reason = denial.as_str(), "Synthesis denied, concatenating sub-answers");
                Ok(Synthesis { denied: Some(denial), ..Synthesis::resolved(&fallback(), &table, true) })
            }
            Err(err) => {
                tracing::warn!(error = %err, "Synthesis failed, concatenating sub-answers");
                Ok(Synthesis { recovered: Some(err), ..Synthesis::resolved(&fallback(), &table, true) })
            }
        }
    }
}
