//! Search-need classifier
//!
//! Decides whether a query needs retrieval at all. Both modes fail open:
//! anything other than a clear "no search" answer means search.

use std::sync::Arc;

use super::gate::{governed_llm, StepGate};
use super::model::{ChatTurn, Query, StepKind};
use super::prompts;
use crate::config::{ClassifierMode, RunConfig};
use crate::errors::{LlmError, StageError};
use crate::llm::{LlmAdapter, LlmRequest, ModelClass};

/// Output budget for the SEARCH / SKIP SEARCH reply
const CLASSIFIER_MAX_TOKENS: u32 = 8;

/// Messages longer than this are never treated as small talk
const SMALL_TALK_MAX_WORDS: usize = 6;

const SMALL_TALK: &[&str] = &[
    "thanks", "thank you", "thx", "ty", "cheers", "great", "perfect", "awesome", "ok", "okay",
    "cool", "got it", "hi", "hello", "hey", "good morning", "good afternoon", "bye", "goodbye",
];

const REFORMAT_VERBS: &[&str] = &[
    "rephrase", "reword", "rewrite", "summarize", "summarise", "shorten", "shorter", "simplify",
    "translate", "reformat", "format", "bullet", "bullets", "expand", "elaborate", "tldr",
];

const PREVIOUS_ANSWER_REFS: &[&str] = &[
    "that", "this", "it", "above", "previous", "last", "your",
];

const PREVIOUS_ANSWER_NOUNS: &[&str] = &["answer", "response", "reply", "message", "one"];

/// Politeness and auxiliaries around a reformat request
const FOLLOW_UP_FILLER: &[&str] = &[
    "please", "can", "could", "would", "you", "me", "for", "just", "now", "again", "the", "a", "pls",
];

/// Words that may trail the back-reference without naming a new subject
const FORMAT_WORDS: &[&str] = &[
    "more", "less", "simply", "simpler", "shorter", "briefly", "concisely", "clearly", "please",
    "bullet", "bullets", "points", "list", "table",
];

/// Prepositions that introduce a target format or language
const FORMAT_TARGETS: &[&str] = &["in", "into", "as", "to"];

/// Longest format target accepted after a preposition
const FORMAT_TARGET_MAX_WORDS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub needs_search: bool,
    /// Failure that was recovered by defaulting to search
    pub recovered: Option<StageError>,
}

impl Classification {
    fn decided(needs_search: bool) -> Self {
        Self { needs_search, recovered: None }
    }

    fn fail_open(err: StageError) -> Self {
        Self { needs_search: true, recovered: Some(err) }
    }
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'' && c != ';')
        .filter(|w| !w.is_empty())
        .map(|w| w.replace(';', ""))
        .collect()
}

/// Deterministic check: only conversational follow-ups skip search
pub fn heuristic_needs_search(query: &str, history: &[ChatTurn]) -> bool {
    if history.is_empty() {
        return true;
    }

    let words = words(query);
    if words.is_empty() {
        return true;
    }

    let joined = words.join(" ");
    if words.len() <= SMALL_TALK_MAX_WORDS
        && SMALL_TALK.iter().any(|p| joined == *p || joined.starts_with(&format!("{} ", p)))
        && !words.iter().any(|w| w == "what" || w == "how" || w == "why" || w == "when" || w == "where" || w == "who")
    {
        return false;
    }

    !is_reformat_request(&words)
}

fn is_in(set: &[&str], word: &str) -> bool {
    set.iter().any(|w| *w == word)
}

/// True for "summarize that", "can you rephrase your last answer in bullet
/// points" and the like: a reformat verb whose object is the previous answer
/// and nothing else.
fn is_reformat_request(words: &[String]) -> bool {
    let mut rest = words.iter().skip_while(|w| is_in(FOLLOW_UP_FILLER, w));
    match rest.next() {
        Some(verb) if is_in(REFORMAT_VERBS, verb) => {}
        _ => return false,
    }

    let rest: Vec<&String> = rest.skip_while(|w| is_in(FOLLOW_UP_FILLER, w)).collect();
    let Some(first) = rest.first() else {
        return true;
    };
    if !is_in(PREVIOUS_ANSWER_REFS, first) {
        return false;
    }

    let tail: Vec<&String> = rest
        .iter()
        .copied()
        .skip_while(|w| is_in(PREVIOUS_ANSWER_REFS, w) || is_in(PREVIOUS_ANSWER_NOUNS, w))
        .collect();
    match tail.first() {
        None => true,
        Some(w) if is_in(FORMAT_TARGETS, w) => tail.len() <= FORMAT_TARGET_MAX_WORDS,
        Some(_) => tail.iter().all(|w| is_in(FORMAT_WORDS, w)),
    }
}

/// Read the fast model's verdict; anything mentioning "skip" means no search
pub fn parse_decision(text: &str) -> bool {
    !text.to_lowercase().contains("skip")
}

pub struct SearchNeedClassifier {
    llm: Arc<dyn LlmAdapter>,
    config: Arc<RunConfig>,
}

impl SearchNeedClassifier {
    pub fn new(llm: Arc<dyn LlmAdapter>, config: Arc<RunConfig>) -> Self {
        Self { llm, config }
    }

    /// Classify the latest query. Only a budget denial or cancellation is
    /// returned as an error.
    pub async fn classify<G: StepGate + ?Sized>(
        &self,
        query: &Query,
        gate: &mut G,
    ) -> Result<Classification, StageError> {
        if query.history.is_empty() {
            return Ok(Classification::decided(true));
        }

        match self.config.classifier {
            ClassifierMode::Heuristic => Ok(Classification::decided(heuristic_needs_search(
                &query.raw_text,
                &query.history,
            ))),
            ClassifierMode::Llm => self.classify_with_llm(query, gate).await,
        }
    }

    async fn classify_with_llm<G: StepGate + ?Sized>(
        &self,
        query: &Query,
        gate: &mut G,
    ) -> Result<Classification, StageError> {
        let request = LlmRequest::new(
            prompts::CLASSIFIER_SYSTEM,
            prompts::classifier_prompt(&query.raw_text, &query.history),
            ModelClass::Fast,
            CLASSIFIER_MAX_TOKENS,
        );

        let result = governed_llm(
            gate,
            self.llm.as_ref(),
            &request,
            StepKind::Classification,
            None,
            Some(self.config.classifier_timeout()),
            self.config.retry_backoff(),
            None,
        )
        .await;

        match result {
            Ok(response) => Ok(Classification::decided(parse_decision(&response.text))),
            Err(err @ (StageError::BudgetExhausted(_) | StageError::Cancelled)) => Err(err),
            Err(StageError::Provider(LlmError::Timeout { timeout_ms })) => {
                tracing::warn!(timeout_ms, "Search classification timed out, defaulting to search");
                Ok(Classification::fail_open(StageError::ClassificationTimeout { timeout_ms }))
            }
            Err(err) => {
                tracing::warn!(error = %err, "Search classification failed, defaulting to search");
                Ok(Classification::fail_open(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::budget::BudgetDenial;
    use crate::orchestration::gate::{Admission, Settlement, StepRequest};
    use crate::testing::ScriptedLlm;
    use async_trait::async_trait;
    use std::time::Duration;

    struct OpenGate {
        steps: u32,
        deny: bool,
    }

    #[async_trait]
    impl StepGate for OpenGate {
        async fn admit(&mut self, _request: StepRequest) -> Result<Admission, StageError> {
            if self.deny {
                return Err(BudgetDenial::Steps.into());
            }
            self.steps += 1;
            Ok(Admission { index: self.steps, timeout: Duration::from_secs(5) })
        }

        async fn settle(&mut self, _admission: &Admission, _settlement: Settlement) {}
    }

    fn follow_up(text: &str) -> Query {
        Query::new(text).with_history(vec![
            ChatTurn::user("What is our refund policy?"),
            ChatTurn::assistant("Refunds are issued within 30 days [1]."),
        ])
    }

    fn llm_config(timeout_ms: u64) -> Arc<RunConfig> {
        Arc::new(RunConfig {
            classifier: ClassifierMode::Llm,
            classifier_timeout_ms: timeout_ms,
            retry_backoff_ms: 1,
            ..RunConfig::default()
        })
    }

    #[test]
    fn test_heuristic_follow_ups() {
        let history = vec![ChatTurn::user("q"), ChatTurn::assistant("a")];
        assert!(!heuristic_needs_search("Thanks!", &history));
        assert!(!heuristic_needs_search("ok, got it", &history));
        assert!(!heuristic_needs_search("Can you summarize that in bullet points?", &history));
        assert!(!heuristic_needs_search("Translate it to French", &history));
        assert!(!heuristic_needs_search("Please rephrase your last answer more simply", &history));
        assert!(!heuristic_needs_search("tldr", &history));

        assert!(heuristic_needs_search("Summarize our travel policy", &history));
        assert!(heuristic_needs_search("Thanks, and what about exchanges?", &history));
        assert!(heuristic_needs_search("What were Q2 sales?", &history));
        assert!(heuristic_needs_search("Summarize this quarter's revenue report", &history));
        assert!(heuristic_needs_search("Summarize the incident report, it was filed last week", &history));
        assert!(heuristic_needs_search("Translate this contract clause into plain language for the legal team", &history));
    }

    #[test]
    fn test_first_turn_always_searches() {
        assert!(heuristic_needs_search("Thanks!", &[]));
    }

    #[test]
    fn test_parse_decision() {
        assert!(parse_decision("SEARCH"));
        assert!(!parse_decision("SKIP SEARCH"));
        assert!(!parse_decision("skip"));
    }

    #[tokio::test]
    async fn test_no_history_skips_backend() {
        let llm = Arc::new(ScriptedLlm::replying(|_| Ok("SKIP SEARCH".into())));
        let classifier = SearchNeedClassifier::new(llm.clone(), llm_config(1_000));
        let mut gate = OpenGate { steps: 0, deny: false };

        let result = classifier.classify(&Query::new("Hello"), &mut gate).await.unwrap();
        assert!(result.needs_search);
        assert_eq!(llm.calls(), 0);
        assert_eq!(gate.steps, 0);
    }

    #[tokio::test]
    async fn test_llm_mode_skip() {
        let llm = Arc::new(ScriptedLlm::replying(|_| Ok("SKIP SEARCH".into())));
        let classifier = SearchNeedClassifier::new(llm.clone(), llm_config(1_000));
        let mut gate = OpenGate { steps: 0, deny: false };

        let result = classifier.classify(&follow_up("Shorter please"), &mut gate).await.unwrap();
        assert!(!result.needs_search);
        assert_eq!(gate.steps, 1);
    }

    #[tokio::test]
    async fn test_timeout_fails_open() {
        let llm = Arc::new(
            ScriptedLlm::replying(|_| Ok("SKIP SEARCH".into())).with_delay(Duration::from_millis(500)),
        );
        let classifier = SearchNeedClassifier::new(llm, llm_config(20));
        let mut gate = OpenGate { steps: 0, deny: false };

        let result = classifier.classify(&follow_up("Shorter please"), &mut gate).await.unwrap();
        assert!(result.needs_search);
        assert_eq!(result.recovered, Some(StageError::ClassificationTimeout { timeout_ms: 20 }));
    }

    #[tokio::test]
    async fn test_provider_error_fails_open() {
        let llm = Arc::new(ScriptedLlm::replying(|_| {
            Err(LlmError::Provider { message: "bad request".into(), retryable: false })
        }));
        let classifier = SearchNeedClassifier::new(llm, llm_config(1_000));
        let mut gate = OpenGate { steps: 0, deny: false };

        let result = classifier.classify(&follow_up("Shorter please"), &mut gate).await.unwrap();
        assert!(result.needs_search);
        assert!(matches!(result.recovered, Some(StageError::Provider(_))));
    }

    #[tokio::test]
    async fn test_budget_denial_propagates() {
        let llm = Arc::new(ScriptedLlm::replying(|_| Ok("SEARCH".into())));
        let classifier = SearchNeedClassifier::new(llm, llm_config(1_000));
        let mut gate = OpenGate { steps: 0, deny: true };

        let err = classifier.classify(&follow_up("Shorter please"), &mut gate).await.unwrap_err();
        assert_eq!(err, StageError::BudgetExhausted(BudgetDenial::Steps));
    }
}
