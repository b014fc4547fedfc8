//! Records flowing through a run: the query, sub-questions, partial answers,
//! citations, the step trace and the terminal result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::budget::{BudgetDenial, BudgetLedger};

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One prior message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// User query, immutable once a run starts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Query {
    pub id: Uuid,
    pub raw_text: String,
    pub history: Vec<ChatTurn>,
    /// Persona instructions prepended to answer prompts
    pub persona: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl Query {
    pub fn new(raw_text: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            raw_text: raw_text.into(),
            history: Vec::new(),
            persona: None,
            issued_at: Utc::now(),
        }
    }

    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }
}

/// Narrower question produced by decomposition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubQuestion {
    /// Position in the decomposition, 0-based
    pub id: usize,
    pub text: String,
    pub extracted_entities: BTreeSet<String>,
    pub parent_query_id: Uuid,
}

impl SubQuestion {
    /// The whole query treated as its only sub-question
    pub fn whole(query: &Query) -> Self {
        Self {
            id: 0,
            text: query.raw_text.clone(),
            extracted_entities: BTreeSet::new(),
            parent_query_id: query.id,
        }
    }
}

/// Answer to one sub-question.
///
/// Citation markers `[i]` in `text` refer to `supporting_chunk_ids[i - 1]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartialAnswer {
    pub sub_question_id: usize,
    pub text: String,
    pub supporting_chunk_ids: Vec<String>,
    /// 0.0 means the branch produced nothing usable
    pub confidence: f32,
}

impl PartialAnswer {
    pub fn failed(sub_question_id: usize) -> Self {
        Self {
            sub_question_id,
            text: String::new(),
            supporting_chunk_ids: Vec::new(),
            confidence: 0.0,
        }
    }

    /// Zero-confidence answer that tells the reader why nothing was found
    pub fn unanswered(sub_question_id: usize, explanation: &str) -> Self {
        Self { text: explanation.to_string(), ..Self::failed(sub_question_id) }
    }

    pub fn is_usable(&self) -> bool {
        self.confidence > 0.0 && !self.text.trim().is_empty()
    }
}

/// Link from a span of the final answer to a source chunk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    /// Byte offset of the citation marker in `RunResult::final_text`
    pub answer_span_offset: usize,
    pub chunk_id: String,
    pub document_id: String,
    /// Number displayed in the marker, 1-based
    pub citation_num: usize,
}

/// States of the run state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Start,
    Classifying,
    SimpleAnswer,
    Decomposing,
    /// Sub-answer branches retrieving and generating
    Answering,
    Synthesizing,
    Done,
    Aborted,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Aborted)
    }

    /// Legal edges of the state machine
    pub fn can_transition_to(&self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (Done | Aborted, _) => false,
            (_, Aborted) => true,
            (Start, Classifying) => true,
            (Classifying, SimpleAnswer | Decomposing) => true,
            (Decomposing, Answering) => true,
            (SimpleAnswer | Answering, Synthesizing) => true,
            (Synthesizing, Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunPhase::Start => "start",
            RunPhase::Classifying => "classifying",
            RunPhase::SimpleAnswer => "simple_answer",
            RunPhase::Decomposing => "decomposing",
            RunPhase::Answering => "answering",
            RunPhase::Synthesizing => "synthesizing",
            RunPhase::Done => "done",
            RunPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// What a backend step did
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Classification,
    ExploratoryRetrieval,
    Decomposition,
    Retrieval,
    Generation,
    Synthesis,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Classification => "classification",
            StepKind::ExploratoryRetrieval => "exploratory_retrieval",
            StepKind::Decomposition => "decomposition",
            StepKind::Retrieval => "retrieval",
            StepKind::Generation => "generation",
            StepKind::Synthesis => "synthesis",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Pending => "pending",
            StepOutcome::Succeeded => "succeeded",
            StepOutcome::Failed => "failed",
            StepOutcome::Cancelled => "cancelled",
        }
    }
}

/// One authorized step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    /// 1-based authorization order
    pub index: u32,
    pub kind: StepKind,
    pub phase: RunPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_question_id: Option<usize>,
    pub tokens: u64,
    pub outcome: StepOutcome,
    /// Run clock when the step was authorized
    pub started_ms: u64,
    /// Run clock when the step settled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_ms: Option<u64>,
}

/// Terminal output of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResult {
    pub run_id: Uuid,
    pub final_text: String,
    pub citations: Vec<Citation>,
    /// Best-effort answer after a budget or partial-failure limit
    pub degraded: bool,
    pub step_trace: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<BudgetDenial>,
    pub sub_questions: Vec<SubQuestion>,
    pub partial_answers: Vec<PartialAnswer>,
    pub ledger: BudgetLedger,
}

impl RunResult {
    /// Steps the governor authorized
    pub fn authorized_steps(&self) -> usize {
        self.step_trace.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_edges() {
        assert!(RunPhase::Start.can_transition_to(RunPhase::Classifying));
        assert!(RunPhase::Classifying.can_transition_to(RunPhase::SimpleAnswer));
        assert!(RunPhase::Classifying.can_transition_to(RunPhase::Decomposing));
        assert!(RunPhase::Answering.can_transition_to(RunPhase::Synthesizing));
        assert!(!RunPhase::Start.can_transition_to(RunPhase::Synthesizing));
        assert!(!RunPhase::SimpleAnswer.can_transition_to(RunPhase::Answering));
        assert!(!RunPhase::Decomposing.can_transition_to(RunPhase::Synthesizing));
    }

    #[test]
    fn test_aborted_reachable_from_non_terminal_only() {
        for phase in [
            RunPhase::Start,
            RunPhase::Classifying,
            RunPhase::SimpleAnswer,
            RunPhase::Decomposing,
            RunPhase::Answering,
            RunPhase::Synthesizing,
        ] {
            assert!(phase.can_transition_to(RunPhase::Aborted), "{phase}");
        }
        assert!(!RunPhase::Done.can_transition_to(RunPhase::Aborted));
        assert!(!RunPhase::Aborted.can_transition_to(RunPhase::Done));
    }

    #[test]
    fn test_failed_partial_is_not_usable() {
        let failed = PartialAnswer::failed(2);
        assert_eq!(failed.confidence, 0.0);
        assert!(!failed.is_usable());

        let whitespace = PartialAnswer { text: "  ".into(), confidence: 0.9, ..PartialAnswer::failed(0) };
        assert!(!whitespace.is_usable());
    }

    #[test]
    fn test_whole_query_sub_question() {
        let query = Query::new("What is our refund policy?");
        let sq = SubQuestion::whole(&query);
        assert_eq!(sq.text, query.raw_text);
        assert_eq!(sq.parent_query_id, query.id);
        assert!(sq.extracted_entities.is_empty());
    }
}
