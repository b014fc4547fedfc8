//! Question decomposer
//!
//! One exploratory search grounds the split in what is actually indexed,
//! then one LLM call proposes sub-questions with their entities. The result
//! is never empty: the whole query is the fallback.

use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use super::gate::{governed_llm, governed_search, StepGate};
use super::model::{Query, StepKind, SubQuestion};
use super::prompts;
use crate::config::RunConfig;
use crate::errors::StageError;
use crate::llm::{LlmAdapter, LlmRequest};
use crate::retrieval::{RetrievalAdapter, RetrievedChunk};

#[derive(Debug, Deserialize)]
struct ProposedQuestion {
    question: String,
    #[serde(default)]
    entities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub sub_questions: Vec<SubQuestion>,
    /// Failures recovered on the way (exploratory search, decomposition call)
    pub recovered: Vec<StageError>,
}

/// Lowercase alphanumerics with single spaces, for duplicate detection
pub fn normalize_question(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Take the JSON array out of a reply that may wrap it in prose or a fence
fn json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_lines(text: &str) -> Vec<ProposedQuestion> {
    text.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '-' | '*' | '.' | ')' | '•'))
                .trim()
        })
        .filter(|line| !line.is_empty() && !line.starts_with("```"))
        .map(|line| match line.split_once('|') {
            Some((question, entities)) => ProposedQuestion {
                question: question.trim().to_string(),
                entities: entities
                    .split(',')
                    .map(|e| e.trim().to_string())
                    .filter(|e| !e.is_empty())
                    .collect(),
            },
            None => ProposedQuestion { question: line.to_string(), entities: Vec::new() },
        })
        .collect()
}

/// Parse the decomposer's reply into at most `max` distinct sub-questions.
///
/// Accepts a JSON array of `{question, entities}` or of plain strings, or one
/// question per line (`question | entity, entity`). Falls back to the whole
/// query when nothing usable remains.
pub fn parse_sub_questions(text: &str, query: &Query, max: usize) -> Vec<SubQuestion> {
    let proposed = match json_array(text) {
        Some(array) => serde_json::from_str::<Vec<ProposedQuestion>>(array)
            .or_else(|_| {
                serde_json::from_str::<Vec<String>>(array).map(|questions| {
                    questions
                        .into_iter()
                        .map(|question| ProposedQuestion { question, entities: Vec::new() })
                        .collect()
                })
            })
            .unwrap_or_else(|_| parse_lines(text)),
        None => parse_lines(text),
    };

    let mut seen = HashSet::new();
    let mut sub_questions = Vec::new();
    for candidate in proposed {
        let normalized = normalize_question(&candidate.question);
        if normalized.is_empty() || !seen.insert(normalized) {
            continue;
        }
        if sub_questions.len() == max {
            break;
        }
        sub_questions.push(SubQuestion {
            id: sub_questions.len(),
            text: candidate.question.trim().to_string(),
            extracted_entities: candidate
                .entities
                .into_iter()
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect::<BTreeSet<_>>(),
            parent_query_id: query.id,
        });
    }

    if sub_questions.is_empty() {
        return vec![SubQuestion::whole(query)];
    }
    sub_questions
}

pub struct QuestionDecomposer {
    llm: Arc<dyn LlmAdapter>,
    retrieval: Arc<dyn RetrievalAdapter>,
    config: Arc<RunConfig>,
}

impl QuestionDecomposer {
    pub fn new(llm: Arc<dyn LlmAdapter>, retrieval: Arc<dyn RetrievalAdapter>, config: Arc<RunConfig>) -> Self {
        Self { llm, retrieval, config }
    }

    /// Small top-k search to show the decomposer what the index holds
    pub async fn exploratory_search<G: StepGate + ?Sized>(
        &self,
        query: &Query,
        gate: &mut G,
    ) -> Result<(Vec<RetrievedChunk>, Option<StageError>), StageError> {
        let result = governed_search(
            gate,
            self.retrieval.as_ref(),
            &query.raw_text,
            &self.config.filters,
            self.config.exploratory_top_k,
            StepKind::ExploratoryRetrieval,
            None,
            self.config.retry_backoff(),
        )
        .await;

        match result {
            Ok(chunks) => Ok((chunks, None)),
            Err(err @ (StageError::BudgetExhausted(_) | StageError::Cancelled)) => Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "Exploratory search failed, decomposing without context");
                Ok((Vec::new(), Some(err)))
            }
        }
    }

    /// Split the query. Only a budget denial or cancellation is an error.
    pub async fn decompose<G: StepGate + ?Sized>(
        &self,
        query: &Query,
        exploratory: &[RetrievedChunk],
        gate: &mut G,
    ) -> Result<Decomposition, StageError> {
        let request = LlmRequest::new(
            prompts::DECOMPOSITION_SYSTEM,
            prompts::decomposition_prompt(&query.raw_text, exploratory, self.config.max_sub_questions),
            self.config.model_for_decomposition,
            self.config.max_decomposition_tokens,
        );

        let result = governed_llm(
            gate,
            self.llm.as_ref(),
            &request,
            StepKind::Decomposition,
            None,
            None,
            self.config.retry_backoff(),
            None,
        )
        .await;

        match result {
            Ok(response) => {
                let sub_questions = parse_sub_questions(&response.text, query, self.config.max_sub_questions);
                tracing::debug!(count = sub_questions.len(), "Query decomposed");
                Ok(Decomposition { sub_questions, recovered: Vec::new() })
            }
            Err(err @ (StageError::BudgetExhausted(_) | StageError::Cancelled)) => Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "Decomposition failed, answering the whole query");
                Ok(Decomposition {
                    sub_questions: vec![SubQuestion::whole(query)],
                    recovered: vec![StageError::DecompositionFailure { message: err.to_string() }],
                })
            }
        }
    }

    /// Exploratory search followed by decomposition
    pub async fn run<G: StepGate + ?Sized>(&self, query: &Query, gate: &mut G) -> Result<Decomposition, StageError> {
        let (exploratory, search_failure) = self.exploratory_search(query, gate).await?;
        let mut decomposition = self.decompose(query, &exploratory, gate).await?;
        if let Some(err) = search_failure {
            decomposition.recovered.insert(0, err);
        }
        Ok(decomposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{LlmError, RetrievalError};
    use crate::orchestration::gate::{Admission, Settlement, StepRequest};
    use crate::testing::{chunk, ScriptedLlm, ScriptedRetrieval};
    use async_trait::async_trait;
    use std::time::Duration;

    struct OpenGate(Vec<StepKind>);

    #[async_trait]
    impl StepGate for OpenGate {
        async fn admit(&mut self, request: StepRequest) -> Result<Admission, StageError> {
            self.0.push(request.kind);
            Ok(Admission { index: self.0.len() as u32, timeout: Duration::from_secs(5) })
        }

        async fn settle(&mut self, _admission: &Admission, _settlement: Settlement) {}
    }

    fn query() -> Query {
        Query::new("Compare Q1 and Q2 revenue and list open support tickets")
    }

    #[test]
    fn test_empty_list_falls_back_to_query() {
        let q = query();
        let subs = parse_sub_questions("[]", &q, 3);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].text, q.raw_text);
        assert_eq!(subs[0].id, 0);
        assert_eq!(subs[0].parent_query_id, q.id);
    }

    #[test]
    fn test_json_with_entities_and_dedupe() {
        let q = query();
        let reply = r#"Here you go:
```json
[
  {"question": "What was Q1 revenue?", "entities": ["Q1", "revenue"]},
  {"question": "what was q1 revenue", "entities": []},
  {"question": "What was Q2 revenue?", "entities": ["Q2"]},
  {"question": "Which support tickets are open?", "entities": ["support tickets"]}
]
```"#;
        let subs = parse_sub_questions(reply, &q, 3);
        let texts: Vec<_> = subs.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["What was Q1 revenue?", "What was Q2 revenue?", "Which support tickets are open?"]);
        assert!(subs[0].extracted_entities.contains("revenue"));
        assert_eq!(subs.iter().map(|s| s.id).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_bounded_by_max() {
        let q = query();
        let subs = parse_sub_questions(r#"["a?", "b?", "c?", "d?"]"#, &q, 2);
        assert_eq!(subs.len(), 2);
    }

    #[test]
    fn test_line_fallback() {
        let q = query();
        let reply = "1. What was Q1 revenue? | Q1, revenue\n2. What was Q2 revenue? | Q2\n- Which tickets are open?";
        let subs = parse_sub_questions(reply, &q, 5);
        assert_eq!(subs.len(), 3);
        assert_eq!(subs[0].text, "What was Q1 revenue?");
        assert_eq!(subs[1].extracted_entities.iter().collect::<Vec<_>>(), vec!["Q2"]);
        assert_eq!(subs[2].text, "Which tickets are open?");
    }

    #[test]
    fn test_normalize_question() {
        assert_eq!(normalize_question("  What's  Q1 revenue?? "), "what s q1 revenue");
    }

    #[tokio::test]
    async fn test_llm_empty_list_yields_query() {
        let llm = Arc::new(ScriptedLlm::replying(|_| Ok("[]".into())));
        let retrieval = Arc::new(ScriptedRetrieval::returning(|_, _| Ok(vec![chunk("d1", "c1", 0.9)])));
        let decomposer = QuestionDecomposer::new(llm, retrieval, Arc::new(RunConfig::default()));
        let q = query();
        let mut gate = OpenGate(Vec::new());

        let result = decomposer.run(&q, &mut gate).await.unwrap();
        assert_eq!(result.sub_questions, vec![SubQuestion::whole(&q)]);
        assert!(result.recovered.is_empty());
        assert_eq!(gate.0, vec![StepKind::ExploratoryRetrieval, StepKind::Decomposition]);
    }

    #[tokio::test]
    async fn test_failures_recovered() {
        let llm = Arc::new(ScriptedLlm::replying(|_| {
            Err(LlmError::Provider { message: "invalid".into(), retryable: false })
        }));
        let retrieval = Arc::new(ScriptedRetrieval::returning(|_, _| {
            Err(RetrievalError::Unavailable { message: "down".into(), retryable: false })
        }));
        let decomposer = QuestionDecomposer::new(llm, retrieval, Arc::new(RunConfig::default()));
        let q = query();
        let mut gate = OpenGate(Vec::new());

        let result = decomposer.run(&q, &mut gate).await.unwrap();
        assert_eq!(result.sub_questions.len(), 1);
        assert_eq!(result.recovered.len(), 2);
        assert!(matches!(result.recovered[1], StageError::DecompositionFailure { .. }));
    }
}
