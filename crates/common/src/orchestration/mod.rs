//! Query-answering orchestration
//!
//! Provides:
//! - The run state machine and its executor
//! - The budget governor every backend step passes through
//! - Search-need classification and question decomposition
//! - Parallel sub-answer workers and cited answer synthesis
//! - Progress events streamed while a run is in flight

pub mod budget;
pub mod citations;
pub mod classifier;
pub mod decomposer;
pub mod events;
pub mod executor;
pub mod gate;
pub mod model;
pub mod prompts;
pub mod state;
pub mod synthesizer;
pub mod worker;

pub use budget::{authorize, decide, record, BudgetDenial, BudgetLedger, Decision, StepCost};
pub use classifier::{Classification, SearchNeedClassifier};
pub use decomposer::{Decomposition, QuestionDecomposer};
pub use events::{EventPayload, EventSink, EventType, ProgressEvent, RunEvent};
pub use executor::AnswerEngine;
pub use gate::StreamUpdate;
pub use model::{
    ChatRole, ChatTurn, Citation, PartialAnswer, Query, RunPhase, RunResult, StepKind, StepOutcome,
    StepRecord, SubQuestion,
};
pub use synthesizer::{AnswerSynthesizer, Synthesis, NO_ANSWER_TEXT};
pub use worker::{BranchOutput, RunSnapshot, SubAnswerWorker, NO_DOCUMENTS_TEXT};
