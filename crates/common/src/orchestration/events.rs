//! Progress events emitted while a run is in flight

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::model::{RunPhase, RunResult};
use crate::errors::{ErrorKind, StageError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StateTransition,
    PartialResult,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Transition {
        from: RunPhase,
        to: RunPhase,
        /// Steps authorized so far
        steps: u32,
    },
    SubQuestions {
        questions: Vec<String>,
    },
    SubAnswer {
        sub_question_id: usize,
        confidence: f32,
        text: String,
    },
    /// Streamed fragment of the final answer
    AnswerDelta {
        text: String,
    },
    /// Streamed answer text so far is void; a retried call starts over
    AnswerReset,
    Error {
        error: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sub_question_id: Option<usize>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub event_type: EventType,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    fn now(event_type: EventType, payload: EventPayload) -> Self {
        Self { event_type, payload, timestamp: Utc::now() }
    }

    pub fn transition(from: RunPhase, to: RunPhase, steps: u32) -> Self {
        Self::now(EventType::StateTransition, EventPayload::Transition { from, to, steps })
    }

    pub fn sub_questions(questions: Vec<String>) -> Self {
        Self::now(EventType::PartialResult, EventPayload::SubQuestions { questions })
    }

    pub fn sub_answer(sub_question_id: usize, confidence: f32, text: String) -> Self {
        Self::now(
            EventType::PartialResult,
            EventPayload::SubAnswer { sub_question_id, confidence, text },
        )
    }

    pub fn answer_delta(text: String) -> Self {
        Self::now(EventType::PartialResult, EventPayload::AnswerDelta { text })
    }

    pub fn answer_reset() -> Self {
        Self::now(EventType::PartialResult, EventPayload::AnswerReset)
    }

    pub fn error(err: &StageError, sub_question_id: Option<usize>) -> Self {
        Self::now(
            EventType::Error,
            EventPayload::Error {
                error: err.kind(),
                message: err.to_string(),
                sub_question_id,
            },
        )
    }
}

/// Item of the stream returned by `AnswerEngine::execute`
#[derive(Debug, Clone)]
pub enum RunEvent {
    Progress(ProgressEvent),
    /// Always the last item
    Finished(Box<RunResult>),
}

/// Sending half of the event stream.
///
/// A dropped consumer never fails a send; events are discarded, and
/// [`EventSink::closed`] lets the run stop early.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<RunEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<RunEvent>) -> Self {
        Self { tx }
    }

    pub async fn emit(&self, event: ProgressEvent) {
        if self.tx.send(RunEvent::Progress(event)).await.is_err() {
            tracing::debug!("Progress consumer dropped");
        }
    }

    /// Resolves once the consumer has dropped its end of the stream
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn finish(&self, result: RunResult) {
        let _ = self.tx.send(RunEvent::Finished(Box::new(result))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LlmError;

    #[test]
    fn test_payload_serialization() {
        let event = ProgressEvent::transition(RunPhase::Start, RunPhase::Classifying, 0);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "state_transition");
        assert_eq!(json["payload"]["kind"], "transition");
        assert_eq!(json["payload"]["to"], "classifying");
    }

    #[test]
    fn test_error_event_carries_kind() {
        let err = StageError::Provider(LlmError::Timeout { timeout_ms: 20 });
        let event = ProgressEvent::error(&err, Some(1));
        assert_eq!(event.event_type, EventType::Error);
        match event.payload {
            EventPayload::Error { error, sub_question_id, .. } => {
                assert_eq!(error, ErrorKind::ProviderTimeout);
                assert_eq!(sub_question_id, Some(1));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sink_survives_dropped_consumer() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = EventSink::new(tx);
        sink.emit(ProgressEvent::answer_delta("x".into())).await;
        sink.closed().await;
    }
}
