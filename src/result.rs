//! Run results: the streaming handle and the final result snapshot.
//!
//! `RunResultStreaming` is returned immediately by the runner while the loop
//! executes on a background task. Events flow through an internal unbounded
//! queue terminated by a sentinel; the handle exposes them as a lazy stream
//! plus point-in-time accessors over shared state.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use crate::agent::Agent;
use crate::error::{AgentsError, Result};
use crate::guardrail::GuardrailRecord;
use crate::items::{ModelResponse, RunInput, RunItem};
use crate::model::ResponseEvent;

/// Events surfaced to stream consumers, in queue order.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A raw model event, re-emitted as it streams in.
    RawResponse(ResponseEvent),
    /// A semantic item generated by the current turn.
    RunItem(RunItem),
    /// The active agent changed: emitted once at run start and after every
    /// handoff.
    AgentUpdated { agent: Arc<Agent> },
}

/// Internal queue element. The sentinel marks end-of-run; the loop guarantees
/// at least one on every exit path, and the consumer tolerates duplicates.
#[derive(Debug)]
pub(crate) enum QueueItem {
    Event(StreamEvent),
    Sentinel,
}

/// State shared between the loop task and the handle. The loop is the single
/// writer; the handle takes snapshots.
pub(crate) struct StreamingState {
    pub(crate) input: Mutex<RunInput>,
    /// Items of the current turn only. Replaced each turn, not accumulated;
    /// the full history lives in the session when one is attached.
    pub(crate) new_items: Mutex<Vec<RunItem>>,
    pub(crate) raw_responses: Mutex<Vec<ModelResponse>>,
    pub(crate) current_agent: Mutex<Arc<Agent>>,
    pub(crate) current_turn: AtomicUsize,
    pub(crate) max_turns: usize,
    pub(crate) is_complete: AtomicBool,
    pub(crate) final_output: Mutex<Option<Value>>,
    pub(crate) input_guardrail_results: Mutex<Vec<GuardrailRecord>>,
    pub(crate) output_guardrail_results: Mutex<Vec<GuardrailRecord>>,
    pub(crate) error: Mutex<Option<AgentsError>>,
    pub(crate) cancelled: AtomicBool,
    pub(crate) usage_stats: Mutex<crate::usage::UsageStats>,
    pub(crate) tx: UnboundedSender<QueueItem>,
}

impl StreamingState {
    pub(crate) fn new(
        agent: Arc<Agent>,
        input: RunInput,
        max_turns: usize,
        tx: UnboundedSender<QueueItem>,
    ) -> Self {
        Self {
            input: Mutex::new(input),
            new_items: Mutex::new(Vec::new()),
            raw_responses: Mutex::new(Vec::new()),
            current_agent: Mutex::new(agent),
            current_turn: AtomicUsize::new(0),
            max_turns,
            is_complete: AtomicBool::new(false),
            final_output: Mutex::new(None),
            input_guardrail_results: Mutex::new(Vec::new()),
            output_guardrail_results: Mutex::new(Vec::new()),
            error: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            usage_stats: Mutex::new(crate::usage::UsageStats::new()),
            tx,
        }
    }

    pub(crate) fn emit(&self, event: StreamEvent) {
        let _ = self.tx.send(QueueItem::Event(event));
    }

    pub(crate) fn emit_sentinel(&self) {
        let _ = self.tx.send(QueueItem::Sentinel);
    }
}

/// Handle to a streaming run.
pub struct RunResultStreaming {
    state: Arc<StreamingState>,
    rx: Mutex<Option<UnboundedReceiver<QueueItem>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RunResultStreaming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunResultStreaming").finish_non_exhaustive()
    }
}

impl RunResultStreaming {
    pub(crate) fn new(
        state: Arc<StreamingState>,
        rx: UnboundedReceiver<QueueItem>,
        handle: JoinHandle<()>,
    ) -> Self {
        Self {
            state,
            rx: Mutex::new(Some(rx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Consume events as they arrive. Single-consumer: the first call takes
    /// the queue; later calls observe an already-ended stream. The stream
    /// ends at the terminal sentinel; if the run failed, the stored error is
    /// yielded as the last element.
    pub fn stream_events(&self) -> Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>> {
        let rx = self.rx.lock().unwrap().take();
        let state = self.state.clone();
        let Some(rx) = rx else {
            return Box::pin(futures::stream::empty());
        };

        Box::pin(
            futures::stream::unfold(
                (rx, state, false),
                |(mut rx, state, done)| async move {
                    if done {
                        return None;
                    }
                    match rx.recv().await {
                        Some(QueueItem::Event(event)) => Some((Ok(event), (rx, state, false))),
                        Some(QueueItem::Sentinel) | None => {
                            let stored = state.error.lock().unwrap().take();
                            stored.map(|e| (Err(e), (rx, state, true)))
                        }
                    }
                },
            )
            .fuse(),
        )
    }

    /// Request cancellation. The loop finishes the turn in flight and stops
    /// before starting another; an in-flight turn is never truncated.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete.load(Ordering::SeqCst)
    }

    /// Turns started so far (1-based once the first turn begins).
    pub fn current_turn(&self) -> usize {
        self.state.current_turn.load(Ordering::SeqCst)
    }

    pub fn max_turns(&self) -> usize {
        self.state.max_turns
    }

    pub fn current_agent(&self) -> Arc<Agent> {
        self.state.current_agent.lock().unwrap().clone()
    }

    pub fn input(&self) -> RunInput {
        self.state.input.lock().unwrap().clone()
    }

    /// Items generated by the most recent turn. This is a per-turn snapshot,
    /// not an accumulated history.
    pub fn new_items(&self) -> Vec<RunItem> {
        self.state.new_items.lock().unwrap().clone()
    }

    pub fn raw_responses(&self) -> Vec<ModelResponse> {
        self.state.raw_responses.lock().unwrap().clone()
    }

    pub fn final_output(&self) -> Option<Value> {
        self.state.final_output.lock().unwrap().clone()
    }

    pub fn input_guardrail_results(&self) -> Vec<GuardrailRecord> {
        self.state.input_guardrail_results.lock().unwrap().clone()
    }

    pub fn output_guardrail_results(&self) -> Vec<GuardrailRecord> {
        self.state.output_guardrail_results.lock().unwrap().clone()
    }

    /// Token usage broken down by model and by agent.
    pub fn usage_stats(&self) -> crate::usage::UsageStats {
        self.state.usage_stats.lock().unwrap().clone()
    }

    /// Take the stored run error, if any. Draining `stream_events` surfaces
    /// the error instead; use this when discarding the event stream.
    pub fn take_error(&self) -> Option<AgentsError> {
        self.state.error.lock().unwrap().take()
    }

    /// Drain the event stream, wait for the loop to finish, and return the
    /// final snapshot.
    pub async fn collect(&self) -> Result<RunResult> {
        let mut stream = self.stream_events();
        while let Some(event) = stream.next().await {
            event?;
        }
        drop(stream);

        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Some(err) = self.take_error() {
            return Err(err);
        }

        Ok(RunResult {
            input: self.input(),
            new_items: self.new_items(),
            raw_responses: self.raw_responses(),
            final_output: self.final_output(),
            last_agent: self.current_agent(),
            input_guardrail_results: self.input_guardrail_results(),
            output_guardrail_results: self.output_guardrail_results(),
        })
    }
}

/// Final snapshot of a completed run.
#[derive(Clone)]
pub struct RunResult {
    pub input: RunInput,
    pub new_items: Vec<RunItem>,
    pub raw_responses: Vec<ModelResponse>,
    pub final_output: Option<Value>,
    pub last_agent: Arc<Agent>,
    pub input_guardrail_results: Vec<GuardrailRecord>,
    pub output_guardrail_results: Vec<GuardrailRecord>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.final_output.is_some()
    }

    /// The final output as plain text, when it is a JSON string.
    pub fn text_output(&self) -> Option<String> {
        match &self.final_output {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        }
    }

    /// Deserialize structured final output into a concrete type.
    pub fn final_output_typed<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self
            .final_output
            .clone()
            .ok_or_else(|| AgentsError::Other("run produced no final output".to_string()))?;
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::Role;

    fn test_state() -> (Arc<StreamingState>, UnboundedReceiver<QueueItem>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let agent = Arc::new(Agent::simple("tester", "test"));
        let state = Arc::new(StreamingState::new(
            agent,
            RunInput::Text("hi".to_string()),
            5,
            tx,
        ));
        (state, rx)
    }

    #[tokio::test]
    async fn test_stream_ends_at_sentinel() {
        let (state, rx) = test_state();
        let handle = tokio::spawn(async {});
        let result = RunResultStreaming::new(state.clone(), rx, handle);

        state.emit(StreamEvent::RunItem(RunItem::message(Role::User, "hi")));
        state.emit_sentinel();
        // duplicate sentinel must be harmless
        state.emit_sentinel();

        let mut stream = result.stream_events();
        assert!(matches!(
            stream.next().await,
            Some(Ok(StreamEvent::RunItem(_)))
        ));
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_surfaces_stored_error_after_sentinel() {
        let (state, rx) = test_state();
        let handle = tokio::spawn(async {});
        let result = RunResultStreaming::new(state.clone(), rx, handle);

        *state.error.lock().unwrap() = Some(AgentsError::MaxTurnsExceeded { max_turns: 5 });
        state.emit_sentinel();

        let mut stream = result.stream_events();
        match stream.next().await {
            Some(Err(AgentsError::MaxTurnsExceeded { max_turns })) => assert_eq!(max_turns, 5),
            other => panic!("expected max turns error, got {:?}", other.map(|r| r.is_ok())),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_second_stream_is_empty() {
        let (state, rx) = test_state();
        let handle = tokio::spawn(async {});
        let result = RunResultStreaming::new(state, rx, handle);

        let _first = result.stream_events();
        let mut second = result.stream_events();
        assert!(second.next().await.is_none());
    }

    #[tokio::test]
    async fn test_collect_returns_snapshot() {
        let (state, rx) = test_state();
        let handle = tokio::spawn(async {});
        let result = RunResultStreaming::new(state.clone(), rx, handle);

        *state.final_output.lock().unwrap() = Some(Value::String("done".to_string()));
        state.is_complete.store(true, Ordering::SeqCst);
        state.emit_sentinel();

        let run_result = result.collect().await.unwrap();
        assert!(run_result.is_success());
        assert_eq!(run_result.text_output(), Some("done".to_string()));
    }

    #[test]
    fn test_typed_final_output() {
        #[derive(serde::Deserialize)]
        struct Out {
            city: String,
        }

        let run_result = RunResult {
            input: RunInput::Text("hi".to_string()),
            new_items: vec![],
            raw_responses: vec![],
            final_output: Some(serde_json::json!({"city": "Tokyo"})),
            last_agent: Arc::new(Agent::simple("tester", "test")),
            input_guardrail_results: vec![],
            output_guardrail_results: vec![],
        };

        let out: Out = run_result.final_output_typed().unwrap();
        assert_eq!(out.city, "Tokyo");
    }
}
