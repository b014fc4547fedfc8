//! Workflow executor
//!
//! Drives one run through the state machine:
//!
//! ```text
//! START -> CLASSIFYING -> SIMPLE_ANSWER ---------------> SYNTHESIZING -> DONE
//!                      \-> DECOMPOSING -> ANSWERING --/
//! ```
//!
//! with `ABORTED` reachable from every non-terminal state when the governor
//! denies a step or a transition. Branches of `ANSWERING` run as spawned
//! tasks; the executor stays the single writer of the run state and serves
//! their step admissions over a channel.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::budget::{BudgetDenial, BudgetLedger};
use super::classifier::SearchNeedClassifier;
use super::decomposer::QuestionDecomposer;
use super::events::{EventSink, ProgressEvent, RunEvent};
use super::gate::{governed_llm, BranchMessage, ChannelGate, StepGate, StreamUpdate};
use super::model::{PartialAnswer, Query, RunPhase, RunResult, StepKind, SubQuestion};
use super::prompts;
use super::state::RunState;
use super::synthesizer::{AnswerSynthesizer, NO_ANSWER_TEXT};
use super::worker::{BranchOutput, SubAnswerWorker};
use crate::config::RunConfig;
use crate::errors::StageError;
use crate::llm::{LlmAdapter, LlmRequest, ModelClass};
use crate::metrics;
use crate::retrieval::RetrievalAdapter;

/// Progress events buffered between the run and its consumer
const EVENT_BUFFER: usize = 256;

/// Messages buffered from branch tasks to the executor
const BRANCH_BUFFER: usize = 64;

const DELTA_BUFFER: usize = 64;

/// Confidence of an answer generated from the conversation alone
const CONVERSATION_CONFIDENCE: f32 = 0.5;

/// Query-answering engine
///
/// Cheap to clone; every run gets its own state.
#[derive(Clone)]
pub struct AnswerEngine {
    llm: Arc<dyn LlmAdapter>,
    retrieval: Arc<dyn RetrievalAdapter>,
}

impl AnswerEngine {
    pub fn new(llm: Arc<dyn LlmAdapter>, retrieval: Arc<dyn RetrievalAdapter>) -> Self {
        Self { llm, retrieval }
    }

    /// Start a run. The stream yields progress events and ends with exactly
    /// one `RunEvent::Finished`.
    pub fn execute(&self, query: Query, config: RunConfig) -> ReceiverStream<RunEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let sink = EventSink::new(tx);
        let run = Run {
            llm: self.llm.clone(),
            retrieval: self.retrieval.clone(),
            query: Arc::new(query),
            config: Arc::new(config),
        };

        tokio::spawn(async move {
            let result = run.drive(sink.clone()).await;
            sink.finish(result).await;
        });

        ReceiverStream::new(rx)
    }

    /// Run to completion, discarding progress events
    pub async fn run(&self, query: Query, config: RunConfig) -> RunResult {
        let ledger = BudgetLedger::new(&config);
        let sub_questions = vec![SubQuestion::whole(&query)];
        let mut events = self.execute(query, config);

        while let Some(event) = events.next().await {
            if let RunEvent::Finished(result) = event {
                return *result;
            }
        }

        tracing::error!("Run ended without a result");
        RunResult {
            run_id: uuid::Uuid::now_v7(),
            final_text: NO_ANSWER_TEXT.to_string(),
            citations: Vec::new(),
            degraded: true,
            step_trace: Vec::new(),
            aborted: None,
            sub_questions,
            partial_answers: Vec::new(),
            ledger,
        }
    }
}

/// Inputs of one run
struct Run {
    llm: Arc<dyn LlmAdapter>,
    retrieval: Arc<dyn RetrievalAdapter>,
    query: Arc<Query>,
    config: Arc<RunConfig>,
}

impl Run {
    async fn drive(&self, sink: EventSink) -> RunResult {
        let consumer = sink.clone();
        let mut state = RunState::new(self.query.clone(), self.config.clone(), sink);
        tracing::info!(run_id = %state.run_id(), query_id = %self.query.id, "Run started");

        // Nobody can see the answer once the consumer is gone
        let answered = tokio::select! {
            result = self.answer(&mut state) => Some(result),
            _ = consumer.closed() => None,
        };

        let result = match answered {
            Some(Ok(result)) => result,
            Some(Err(StageError::BudgetExhausted(reason))) => self.abort(&mut state, reason).await,
            Some(Err(err)) => {
                tracing::error!(run_id = %state.run_id(), error = %err, "Run stopped unexpectedly");
                self.salvage(&mut state)
            }
            None => {
                tracing::info!(run_id = %state.run_id(), phase = %state.phase(), "Event consumer dropped, run cancelled");
                self.salvage(&mut state)
            }
        };

        let outcome = if consumer.is_closed() { "cancelled" } else { run_outcome(&result) };
        metrics::record_run(
            outcome,
            state.started().elapsed().as_secs_f64(),
            result.ledger.spent_steps,
        );
        tracing::info!(
            run_id = %result.run_id,
            outcome,
            steps = result.ledger.spent_steps,
            tokens = result.ledger.spent_tokens,
            citations = result.citations.len(),
            "Run finished"
        );
        result
    }

    /// Degraded result from the partial answers gathered so far, without a
    /// backend call
    fn salvage(&self, state: &mut RunState) -> RunResult {
        let synthesis = self
            .synthesizer()
            .salvage(state.sub_questions(), state.partial_answers(), state.documents());
        state.finish(synthesis.text, synthesis.citations, true)
    }

    fn synthesizer(&self) -> AnswerSynthesizer {
        AnswerSynthesizer::new(self.llm.clone(), self.config.clone())
    }

    async fn enter(&self, state: &mut RunState, next: RunPhase) -> Result<(), StageError> {
        state.transition(next).await
    }

    async fn answer(&self, state: &mut RunState) -> Result<RunResult, StageError> {
        self.enter(state, RunPhase::Classifying).await?;
        let classification = SearchNeedClassifier::new(self.llm.clone(), self.config.clone())
            .classify(&self.query, state)
            .await?;
        if let Some(err) = &classification.recovered {
            state.emit(ProgressEvent::error(err, None)).await;
        }

        if !classification.needs_search {
            self.enter(state, RunPhase::SimpleAnswer).await?;
            self.conversation_answer(state).await?;
            return self.synthesize(state).await;
        }

        if !self.config.enable_decomposition {
            self.enter(state, RunPhase::SimpleAnswer).await?;
            self.simple_answer(state).await?;
            return self.synthesize(state).await;
        }

        self.enter(state, RunPhase::Decomposing).await?;
        let decomposition = QuestionDecomposer::new(self.llm.clone(), self.retrieval.clone(), self.config.clone())
            .run(&self.query, state)
            .await?;
        for err in &decomposition.recovered {
            state.emit(ProgressEvent::error(err, None)).await;
        }
        state
            .emit(ProgressEvent::sub_questions(
                decomposition.sub_questions.iter().map(|sq| sq.text.clone()).collect(),
            ))
            .await;
        state.set_sub_questions(decomposition.sub_questions);

        self.enter(state, RunPhase::Answering).await?;
        self.fan_out(state).await?;
        self.synthesize(state).await
    }

    /// Answer from the conversation alone; no retrieval, no citations
    async fn conversation_answer(&self, state: &mut RunState) -> Result<(), StageError> {
        let request = LlmRequest::new(
            prompts::CONVERSATION_SYSTEM,
            prompts::conversation_prompt(&self.query.raw_text, &self.query.history, self.query.persona.as_deref()),
            ModelClass::Primary,
            self.config.max_answer_tokens,
        );

        let sink = state.sink();
        let (tx, rx) = mpsc::channel(DELTA_BUFFER);
        let (result, ()) = tokio::join!(
            governed_llm(
                state,
                self.llm.as_ref(),
                &request,
                StepKind::Generation,
                None,
                None,
                self.config.retry_backoff(),
                Some(tx),
            ),
            forward_deltas(&sink, rx),
        );

        let answer = match result {
            Ok(response) => {
                let text = response.text.trim().to_string();
                let confidence = if text.is_empty() { 0.0 } else { CONVERSATION_CONFIDENCE };
                PartialAnswer { sub_question_id: 0, text, supporting_chunk_ids: Vec::new(), confidence }
            }
            Err(err @ (StageError::BudgetExhausted(_) | StageError::Cancelled)) => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "Conversation answer failed");
                state.emit(ProgressEvent::error(&err, None)).await;
                PartialAnswer::failed(0)
            }
        };

        state.merge_branch(BranchOutput { answer, chunks: Vec::new(), failure: None });
        Ok(())
    }

    /// One retrieval and one streamed generation for the whole query
    async fn simple_answer(&self, state: &mut RunState) -> Result<(), StageError> {
        let sub_question = SubQuestion::whole(&self.query);
        state.set_sub_questions(vec![sub_question.clone()]);

        let worker = SubAnswerWorker::new(self.llm.clone(), self.retrieval.clone(), state.snapshot());
        let sink = state.sink();
        let (tx, rx) = mpsc::channel(DELTA_BUFFER);
        let (output, ()) = tokio::join!(
            worker.answer_streaming(&sub_question, state, tx),
            forward_deltas(&sink, rx),
        );

        let output = output?;
        if let Some(err) = &output.failure {
            state.emit(ProgressEvent::error(err, None)).await;
        }
        state.merge_branch(output);
        Ok(())
    }

    /// Answer every sub-question in its own task and collect the results.
    ///
    /// Returns after all branches have settled. A denial cancels the branches
    /// still running and is returned once they are gone.
    async fn fan_out(&self, state: &mut RunState) -> Result<(), StageError> {
        let sub_questions = state.sub_questions().to_vec();
        let snapshot = state.snapshot();
        let branch_timeout = self.config.branch_wall_clock().min(state.ledger().remaining_wall_clock());
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(BRANCH_BUFFER);
        let mut tasks = JoinSet::new();

        for (slot, sub_question) in sub_questions.iter().cloned().enumerate() {
            let worker = SubAnswerWorker::new(self.llm.clone(), self.retrieval.clone(), snapshot.clone());
            let mut gate = ChannelGate::new(tx.clone());
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let output = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = tokio::time::timeout(branch_timeout, worker.answer(&sub_question, &mut gate)) => {
                        match result {
                            Ok(Ok(output)) => Some(output),
                            Ok(Err(err)) => {
                                tracing::debug!(sub_question_id = sub_question.id, error = %err, "Branch stopped");
                                None
                            }
                            Err(_) => Some(BranchOutput::failed(
                                sub_question.id,
                                StageError::BranchFailure {
                                    sub_question_id: sub_question.id,
                                    message: format!("timed out after {}ms", branch_timeout.as_millis()),
                                },
                            )),
                        }
                    }
                };
                gate.finish(slot, output).await;
            });
        }
        drop(tx);

        let mut slots: Vec<Option<BranchOutput>> = vec![None; sub_questions.len()];
        let mut denial: Option<BudgetDenial> = None;
        let deadline = state.started() + self.config.run_wall_clock();

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    None => break,
                    Some(BranchMessage::Admit { request, reply }) => {
                        let decision = state.admit(request).await;
                        if let Err(StageError::BudgetExhausted(reason)) = &decision {
                            if denial.is_none() {
                                cancel.cancel();
                                denial = Some(*reason);
                            }
                        }
                        let _ = reply.send(decision);
                    }
                    Some(BranchMessage::Settle { admission, settlement }) => {
                        state.settle(&admission, settlement).await;
                    }
                    Some(BranchMessage::Finished { slot, output: Some(output) }) => {
                        if slots.get(slot).is_some_and(Option::is_none) {
                            emit_branch(state, &output).await;
                            slots[slot] = Some(output);
                        }
                    }
                    Some(BranchMessage::Finished { output: None, .. }) => {}
                },
                _ = tokio::time::sleep_until(deadline), if denial.is_none() => {
                    cancel.cancel();
                    denial = Some(BudgetDenial::RunWallClock);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Branch task failed");
            }
        }

        for output in slots.into_iter().flatten() {
            state.merge_branch(output);
        }

        match denial {
            Some(reason) => Err(StageError::BudgetExhausted(reason)),
            None => Ok(()),
        }
    }

    async fn synthesize(&self, state: &mut RunState) -> Result<RunResult, StageError> {
        self.enter(state, RunPhase::Synthesizing).await?;

        let sub_questions = state.sub_questions().to_vec();
        let partials = state.partial_answers().to_vec();
        let documents = state.documents().clone();
        let synthesizer = self.synthesizer();

        let sink = state.sink();
        let (tx, rx) = mpsc::channel(DELTA_BUFFER);
        let (synthesis, ()) = tokio::join!(
            synthesizer.synthesize(&self.query, &sub_questions, &partials, &documents, state, Some(tx)),
            forward_deltas(&sink, rx),
        );

        let synthesis = synthesis?;
        if let Some(err) = &synthesis.recovered {
            state.emit(ProgressEvent::error(err, None)).await;
        }

        if let Some(reason) = synthesis.denied {
            state.abort(reason).await;
            return Ok(state.finish(synthesis.text, synthesis.citations, true));
        }

        self.enter(state, RunPhase::Done).await?;
        Ok(state.finish(synthesis.text, synthesis.citations, synthesis.fell_back))
    }

    /// Degraded result from whatever partial answers exist
    async fn abort(&self, state: &mut RunState, reason: BudgetDenial) -> RunResult {
        state.abort(reason).await;
        self.salvage(state)
    }
}

fn run_outcome(result: &RunResult) -> &'static str {
    match (result.aborted, result.degraded) {
        (Some(_), _) => "aborted",
        (None, true) => "degraded",
        (None, false) => "completed",
    }
}

async fn emit_branch(state: &RunState, output: &BranchOutput) {
    let answer = &output.answer;
    if let Some(err) = &output.failure {
        state.emit(ProgressEvent::error(err, Some(answer.sub_question_id))).await;
    }
    state
        .emit(ProgressEvent::sub_answer(answer.sub_question_id, answer.confidence, answer.text.clone()))
        .await;
}

async fn forward_deltas(sink: &EventSink, mut rx: mpsc::Receiver<StreamUpdate>) {
    while let Some(update) = rx.recv().await {
        let event = match update {
            StreamUpdate::Delta(text) => ProgressEvent::answer_delta(text),
            StreamUpdate::Reset => ProgressEvent::answer_reset(),
        };
        sink.emit(event).await;
    }
}
