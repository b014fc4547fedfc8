//! Mutable state of one run, owned by the executor.
//!
//! `RunState` is the only writer of the ledger and the step trace. Branch
//! tasks reach it through the executor's channel, never directly.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

use super::budget::{self, BudgetDenial, BudgetLedger, Decision, StepCost};
use super::events::{EventSink, ProgressEvent};
use super::gate::{Admission, Settlement, StepGate, StepRequest};
use super::model::{Citation, PartialAnswer, Query, RunPhase, RunResult, StepOutcome, StepRecord, SubQuestion};
use super::worker::{BranchOutput, RunSnapshot};
use crate::config::RunConfig;
use crate::errors::StageError;
use crate::metrics;

pub struct RunState {
    run_id: Uuid,
    query: Arc<Query>,
    config: Arc<RunConfig>,
    phase: RunPhase,
    ledger: BudgetLedger,
    trace: Vec<StepRecord>,
    started: Instant,
    sink: EventSink,
    aborted: Option<BudgetDenial>,
    sub_questions: Vec<SubQuestion>,
    partial_answers: Vec<PartialAnswer>,
    /// Chunk id to document id for every chunk any answer was grounded on
    documents: HashMap<String, String>,
}

impl RunState {
    pub fn new(query: Arc<Query>, config: Arc<RunConfig>, sink: EventSink) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            ledger: BudgetLedger::new(&config),
            query,
            config,
            phase: RunPhase::Start,
            trace: Vec::new(),
            started: Instant::now(),
            sink,
            aborted: None,
            sub_questions: Vec::new(),
            partial_answers: Vec::new(),
            documents: HashMap::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn sub_questions(&self) -> &[SubQuestion] {
        &self.sub_questions
    }

    pub fn partial_answers(&self) -> &[PartialAnswer] {
        &self.partial_answers
    }

    pub fn documents(&self) -> &HashMap<String, String> {
        &self.documents
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            query_text: Arc::from(self.query.raw_text.as_str()),
            persona: self.query.persona.as_deref().map(Arc::from),
            config: self.config.clone(),
        }
    }

    pub fn set_sub_questions(&mut self, sub_questions: Vec<SubQuestion>) {
        self.sub_questions = sub_questions;
    }

    /// Fold a finished branch into the run
    pub fn merge_branch(&mut self, output: BranchOutput) {
        for chunk in &output.chunks {
            self.documents
                .entry(chunk.chunk_id.clone())
                .or_insert_with(|| chunk.document_id.clone());
        }
        self.partial_answers.push(output.answer);
    }

    pub async fn emit(&self, event: ProgressEvent) {
        self.sink.emit(event).await;
    }

    /// Move to `next`, asking the governor first unless `next` is terminal.
    ///
    /// An edge missing from the state machine or a denial leaves the phase
    /// unchanged and is returned; a denial means the caller must abort.
    pub async fn transition(&mut self, next: RunPhase) -> Result<(), StageError> {
        if !self.phase.can_transition_to(next) {
            tracing::error!(from = %self.phase, to = %next, "Illegal run transition");
            return Err(StageError::IllegalTransition { from: self.phase, to: next });
        }

        if !next.is_terminal() {
            let probe = StepCost::probe(self.elapsed_ms());
            if let Decision::Denied(reason) = budget::decide(&self.ledger, &probe) {
                return Err(StageError::BudgetExhausted(reason));
            }
            self.ledger = budget::record(&self.ledger, &probe);
        }

        let from = self.phase;
        self.phase = next;
        tracing::debug!(run_id = %self.run_id, from = %from, to = %next, "Run transition");
        self.emit(ProgressEvent::transition(from, next, self.ledger.spent_steps)).await;
        Ok(())
    }

    /// Stop the run on a budget denial. The first reason is kept.
    pub async fn abort(&mut self, reason: BudgetDenial) {
        if self.phase.is_terminal() {
            return;
        }
        let reason = *self.aborted.get_or_insert(reason);
        self.ledger = self.ledger.clone().exhaust(reason);

        tracing::warn!(run_id = %self.run_id, reason = reason.as_str(), phase = %self.phase, "Run aborted");
        self.emit(ProgressEvent::error(&StageError::BudgetExhausted(reason), None)).await;
        let _ = self.transition(RunPhase::Aborted).await;
    }

    /// Close the run. Steps still pending were cut off and count as cancelled.
    pub fn finish(&mut self, final_text: String, citations: Vec<Citation>, degraded: bool) -> RunResult {
        let now = self.elapsed_ms();
        self.ledger = budget::record(&self.ledger, &StepCost::probe(now));
        for step in self.trace.iter_mut().filter(|s| s.outcome == StepOutcome::Pending) {
            step.outcome = StepOutcome::Cancelled;
            step.settled_ms = Some(now);
            metrics::record_step(step.kind.as_str(), StepOutcome::Cancelled.as_str());
        }

        RunResult {
            run_id: self.run_id,
            final_text,
            citations,
            degraded,
            step_trace: std::mem::take(&mut self.trace),
            aborted: self.aborted,
            sub_questions: std::mem::take(&mut self.sub_questions),
            partial_answers: std::mem::take(&mut self.partial_answers),
            ledger: self.ledger.clone(),
        }
    }
}

#[async_trait]
impl StepGate for RunState {
    async fn admit(&mut self, request: StepRequest) -> Result<Admission, StageError> {
        let now = self.elapsed_ms();
        let proposed = StepCost::step(request.estimated_tokens, now);

        match budget::decide(&self.ledger, &proposed) {
            Decision::Denied(reason) => {
                metrics::record_budget_denial(reason.as_str());
                tracing::info!(
                    run_id = %self.run_id,
                    step = request.kind.as_str(),
                    reason = reason.as_str(),
                    "Step denied"
                );
                self.ledger = self.ledger.clone().exhaust(reason);
                Err(StageError::BudgetExhausted(reason))
            }
            Decision::Authorized { timeout } => {
                // Reserve the step now; tokens are charged when it settles
                self.ledger = budget::record(&self.ledger, &StepCost::step(0, now));
                let index = self.ledger.spent_steps;
                self.trace.push(StepRecord {
                    index,
                    kind: request.kind,
                    phase: self.phase,
                    sub_question_id: request.sub_question_id,
                    tokens: 0,
                    outcome: StepOutcome::Pending,
                    started_ms: now,
                    settled_ms: None,
                });
                Ok(Admission { index, timeout })
            }
        }
    }

    async fn settle(&mut self, admission: &Admission, settlement: Settlement) {
        let now = self.elapsed_ms();
        self.ledger = budget::record(
            &self.ledger,
            &StepCost { steps: 0, tokens: settlement.tokens, wall_clock_ms: now },
        );

        let Some(step) = self.trace.iter_mut().find(|s| s.index == admission.index) else {
            return;
        };
        if step.outcome != StepOutcome::Pending {
            return;
        }
        step.tokens = settlement.tokens;
        step.outcome = settlement.outcome;
        step.settled_ms = Some(now);
        metrics::record_step(step.kind.as_str(), settlement.outcome.as_str());
    }
}
