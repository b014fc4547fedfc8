//! Admission of backend steps
//!
//! Every retrieval or LLM call goes through a [`StepGate`]: the executor's
//! own `RunState` on the sequential path, or a [`ChannelGate`] inside a
//! sub-answer task, which forwards to the executor over a channel so that the
//! ledger keeps a single writer.

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::model::{StepKind, StepOutcome};
use super::worker::BranchOutput;
use crate::errors::{LlmError, RetrievalError, StageError};
use crate::llm::{LlmAdapter, LlmRequest, LlmResponse};
use crate::retrieval::{RetrievalAdapter, RetrievedChunk, SearchFilters};

/// Fragments of a streamed answer
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Delta(String),
    /// A retry starts the answer over; drop what was streamed so far
    Reset,
}

const RELAY_BUFFER: usize = 32;

/// A step asking to run
#[derive(Debug, Clone, PartialEq)]
pub struct StepRequest {
    pub kind: StepKind,
    pub sub_question_id: Option<usize>,
    /// Tokens the step is expected to consume before it has run
    pub estimated_tokens: u64,
    /// Tighter timeout than the governor's, if the caller has one
    pub timeout_cap: Option<Duration>,
}

impl StepRequest {
    pub fn new(kind: StepKind) -> Self {
        Self { kind, sub_question_id: None, estimated_tokens: 0, timeout_cap: None }
    }

    pub fn for_branch(mut self, sub_question_id: Option<usize>) -> Self {
        self.sub_question_id = sub_question_id;
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    pub fn with_timeout_cap(mut self, cap: Duration) -> Self {
        self.timeout_cap = Some(cap);
        self
    }
}

/// Authorization for one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Position in the step trace, 1-based
    pub index: u32,
    pub timeout: Duration,
}

/// Actual cost of a finished step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub tokens: u64,
    pub outcome: StepOutcome,
}

impl Settlement {
    pub fn succeeded(tokens: u64) -> Self {
        Self { tokens, outcome: StepOutcome::Succeeded }
    }

    pub fn failed(tokens: u64) -> Self {
        Self { tokens, outcome: StepOutcome::Failed }
    }
}

#[async_trait]
pub trait StepGate: Send {
    /// Ask the governor for a step. A denial is `StageError::BudgetExhausted`.
    async fn admit(&mut self, request: StepRequest) -> Result<Admission, StageError>;

    /// Report what an admitted step actually cost
    async fn settle(&mut self, admission: &Admission, settlement: Settlement);
}

/// Messages from sub-answer tasks to the executor
#[derive(Debug)]
pub enum BranchMessage {
    Admit {
        request: StepRequest,
        reply: oneshot::Sender<Result<Admission, StageError>>,
    },
    Settle {
        admission: Admission,
        settlement: Settlement,
    },
    /// Write-once result slot of a branch; `None` when the branch was cancelled
    Finished {
        slot: usize,
        output: Option<BranchOutput>,
    },
}

/// Gate used inside a spawned branch
#[derive(Debug, Clone)]
pub struct ChannelGate {
    tx: mpsc::Sender<BranchMessage>,
}

impl ChannelGate {
    pub fn new(tx: mpsc::Sender<BranchMessage>) -> Self {
        Self { tx }
    }

    /// Hand the branch result to the executor
    pub async fn finish(self, slot: usize, output: Option<BranchOutput>) {
        let _ = self.tx.send(BranchMessage::Finished { slot, output }).await;
    }
}

#[async_trait]
impl StepGate for ChannelGate {
    async fn admit(&mut self, request: StepRequest) -> Result<Admission, StageError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(BranchMessage::Admit { request, reply })
            .await
            .map_err(|_| StageError::Cancelled)?;
        response.await.map_err(|_| StageError::Cancelled)?
    }

    async fn settle(&mut self, admission: &Admission, settlement: Settlement) {
        let _ = self
            .tx
            .send(BranchMessage::Settle { admission: *admission, settlement })
            .await;
    }
}

/// Backend failures that can be retried and timed out
pub trait StepFailure: Into<StageError> + std::fmt::Display {
    fn is_retryable(&self) -> bool;
    fn timed_out(timeout_ms: u64) -> Self;
}

impl StepFailure for LlmError {
    fn is_retryable(&self) -> bool {
        LlmError::is_retryable(self)
    }

    fn timed_out(timeout_ms: u64) -> Self {
        LlmError::Timeout { timeout_ms }
    }
}

impl StepFailure for RetrievalError {
    fn is_retryable(&self) -> bool {
        RetrievalError::is_retryable(self)
    }

    fn timed_out(timeout_ms: u64) -> Self {
        RetrievalError::Timeout { timeout_ms }
    }
}

/// First delay of an exponential policy starting at `initial`, jittered
fn retry_delay(initial: Duration) -> Duration {
    let mut policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_max_elapsed_time(None)
        .build();
    policy.next_backoff().unwrap_or(initial)
}

/// Run one backend call as a governed step.
///
/// A retryable failure is retried once after a backoff delay; the retry is a
/// new step and needs its own admission.
pub async fn governed<G, T, E, F, Fut>(
    gate: &mut G,
    request: StepRequest,
    retry_backoff: Duration,
    mut call: F,
    tokens_used: impl Fn(&T) -> u64,
) -> Result<T, StageError>
where
    G: StepGate + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: StepFailure,
{
    let mut attempt = 1;
    loop {
        let admission = gate.admit(request.clone()).await?;
        let timeout = match request.timeout_cap {
            Some(cap) => admission.timeout.min(cap),
            None => admission.timeout,
        };

        let result = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(timeout.as_millis() as u64)),
        };

        match result {
            Ok(value) => {
                gate.settle(&admission, Settlement::succeeded(tokens_used(&value))).await;
                return Ok(value);
            }
            Err(err) => {
                gate.settle(&admission, Settlement::failed(request.estimated_tokens)).await;
                if attempt == 1 && err.is_retryable() {
                    let delay = retry_delay(retry_backoff);
                    tracing::warn!(
                        error = %err,
                        step = request.kind.as_str(),
                        delay_ms = delay.as_millis() as u64,
                        "Retryable step failure, retrying once"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(err.into());
            }
        }
    }
}

/// Governed LLM call; streams deltas when a sender is given.
///
/// A retried stream is preceded by [`StreamUpdate::Reset`].
#[allow(clippy::too_many_arguments)]
pub async fn governed_llm<G: StepGate + ?Sized>(
    gate: &mut G,
    llm: &dyn LlmAdapter,
    request: &LlmRequest,
    kind: StepKind,
    sub_question_id: Option<usize>,
    timeout_cap: Option<Duration>,
    retry_backoff: Duration,
    updates: Option<mpsc::Sender<StreamUpdate>>,
) -> Result<LlmResponse, StageError> {
    let mut step = StepRequest::new(kind)
        .for_branch(sub_question_id)
        .with_tokens(request.estimated_prompt_tokens());
    step.timeout_cap = timeout_cap;

    let mut attempts = 0u32;
    governed(
        gate,
        step,
        retry_backoff,
        || {
            attempts += 1;
            let retry = attempts > 1;
            let updates = updates.clone();
            async move {
                let Some(updates) = updates else {
                    return llm.generate(request).await;
                };
                if retry {
                    let _ = updates.send(StreamUpdate::Reset).await;
                }
                let (tx, mut rx) = mpsc::channel(RELAY_BUFFER);
                let relay = async {
                    while let Some(text) = rx.recv().await {
                        let _ = updates.send(StreamUpdate::Delta(text)).await;
                    }
                };
                let (result, ()) = tokio::join!(llm.stream(request, tx), relay);
                result
            }
        },
        |response: &LlmResponse| response.usage.total(),
    )
    .await
}

/// Governed search call
pub async fn governed_search<G: StepGate + ?Sized>(
    gate: &mut G,
    retrieval: &dyn RetrievalAdapter,
    query_text: &str,
    filters: &SearchFilters,
    top_k: usize,
    kind: StepKind,
    sub_question_id: Option<usize>,
    retry_backoff: Duration,
) -> Result<Vec<RetrievedChunk>, StageError> {
    governed(
        gate,
        StepRequest::new(kind).for_branch(sub_question_id),
        retry_backoff,
        || retrieval.search(query_text, filters, top_k),
        |_| 0,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ModelClass, TokenUsage};
    use crate::orchestration::budget::BudgetDenial;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Gate that admits up to `limit` steps and records settlements
    struct CountingGate {
        limit: u32,
        admitted: u32,
        settled: Vec<Settlement>,
    }

    impl CountingGate {
        fn new(limit: u32) -> Self {
            Self { limit, admitted: 0, settled: Vec::new() }
        }
    }

    #[async_trait]
    impl StepGate for CountingGate {
        async fn admit(&mut self, _request: StepRequest) -> Result<Admission, StageError> {
            if self.admitted >= self.limit {
                return Err(BudgetDenial::Steps.into());
            }
            self.admitted += 1;
            Ok(Admission { index: self.admitted, timeout: Duration::from_millis(200) })
        }

        async fn settle(&mut self, _admission: &Admission, settlement: Settlement) {
            self.settled.push(settlement);
        }
    }

    #[tokio::test]
    async fn test_retryable_failure_retried_once() {
        let mut gate = CountingGate::new(10);
        let calls = AtomicUsize::new(0);
        let result = governed(
            &mut gate,
            StepRequest::new(StepKind::Retrieval),
            Duration::from_millis(1),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(RetrievalError::Unavailable { message: "503".into(), retryable: true })
                    } else {
                        Ok(7u64)
                    }
                }
            },
            |_| 0,
        )
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(gate.admitted, 2);
        assert_eq!(gate.settled[0].outcome, StepOutcome::Failed);
        assert_eq!(gate.settled[1].outcome, StepOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_not_retried() {
        let mut gate = CountingGate::new(10);
        let calls = AtomicUsize::new(0);
        let result: Result<u64, _> = governed(
            &mut gate,
            StepRequest::new(StepKind::Generation),
            Duration::from_millis(1),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LlmError::Provider { message: "400".into(), retryable: false }) }
            },
            |_| 0,
        )
        .await;

        assert!(matches!(result, Err(StageError::Provider(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_needs_admission() {
        let mut gate = CountingGate::new(1);
        let result: Result<u64, _> = governed(
            &mut gate,
            StepRequest::new(StepKind::Retrieval),
            Duration::from_millis(1),
            || async { Err(RetrievalError::Unavailable { message: "503".into(), retryable: true }) },
            |_| 0,
        )
        .await;

        assert_eq!(result, Err(StageError::BudgetExhausted(BudgetDenial::Steps)));
    }

    #[tokio::test]
    async fn test_timeout_cap_applies() {
        let mut gate = CountingGate::new(1);
        let result: Result<u64, _> = governed(
            &mut gate,
            StepRequest::new(StepKind::Classification).with_timeout_cap(Duration::from_millis(10)),
            Duration::from_millis(1),
            || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<u64, LlmError>(1)
            },
            |_| 0,
        )
        .await;

        assert_eq!(result, Err(StageError::Provider(LlmError::Timeout { timeout_ms: 10 })));
        assert_eq!(gate.settled.len(), 1);
    }

    #[tokio::test]
    async fn test_channel_gate_cancelled_when_executor_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut gate = ChannelGate::new(tx);
        let err = gate.admit(StepRequest::new(StepKind::Retrieval)).await.unwrap_err();
        assert_eq!(err, StageError::Cancelled);
    }

    /// Streams half an answer, fails retryably once, then streams it whole
    struct DroppedStream {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmAdapter for DroppedStream {
        async fn generate(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            unreachable!("streamed calls only")
        }

        async fn stream(&self, request: &LlmRequest, deltas: mpsc::Sender<String>) -> Result<LlmResponse, LlmError> {
            let _ = deltas.send("Refunds are ".to_string()).await;
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(LlmError::Provider { message: "connection reset".into(), retryable: true });
            }
            let _ = deltas.send("issued in 14 days.".to_string()).await;
            let text = "Refunds are issued in 14 days.";
            Ok(LlmResponse { text: text.to_string(), usage: TokenUsage::estimated(request, text) })
        }
    }

    #[tokio::test]
    async fn test_retried_stream_resets_answer() {
        let mut gate = CountingGate::new(10);
        let llm = DroppedStream { calls: AtomicUsize::new(0) };
        let request = LlmRequest::new("system", "prompt", ModelClass::Primary, 64);
        let (tx, mut rx) = mpsc::channel(16);

        let response = governed_llm(
            &mut gate,
            &llm,
            &request,
            StepKind::Synthesis,
            None,
            None,
            Duration::from_millis(1),
            Some(tx),
        )
        .await
        .unwrap();

        let mut updates = Vec::new();
        while let Some(update) = rx.recv().await {
            updates.push(update);
        }
        assert_eq!(
            updates,
            vec![
                StreamUpdate::Delta("Refunds are ".into()),
                StreamUpdate::Reset,
                StreamUpdate::Delta("Refunds are ".into()),
                StreamUpdate::Delta("issued in 14 days.".into()),
            ]
        );

        // What a consumer rebuilds after the reset matches the final text
        let mut rebuilt = String::new();
        for update in updates {
            match update {
                StreamUpdate::Delta(text) => rebuilt.push_str(&text),
                StreamUpdate::Reset => rebuilt.clear(),
            }
        }
        assert_eq!(rebuilt, response.text);
    }

    #[tokio::test]
    async fn test_unstreamed_call_sends_no_updates() {
        let mut gate = CountingGate::new(10);
        let llm = crate::testing::ScriptedLlm::replying(|_| Ok("plain".into()));
        let request = LlmRequest::new("system", "prompt", ModelClass::Fast, 16);

        let response = governed_llm(
            &mut gate,
            &llm,
            &request,
            StepKind::Classification,
            None,
            None,
            Duration::from_millis(1),
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.text, "plain");
        assert_eq!(gate.settled.len(), 1);
    }

    #[test]
    fn test_retry_delay_near_initial() {
        let delay = retry_delay(Duration::from_millis(100));
        // Default randomization factor is 0.5
        assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(150));
    }
}
