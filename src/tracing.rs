//! Structured tracing for agent runs.
//!
//! A trace covers one end-to-end run; spans cover units of work inside it:
//! one span per agent tenure, one per model generation, one per tool call.
//! Spans nest through the context's current-span pointer. The loop owns the
//! trace unless the caller supplies an ambient context through `RunConfig`,
//! in which case spans attach to the caller's trace and the loop never
//! finishes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::usage::Usage;

pub type TraceId = String;
pub type SpanId = String;

pub fn gen_trace_id() -> TraceId {
    Uuid::new_v4().to_string()
}

pub fn gen_span_id() -> SpanId {
    Uuid::new_v4().to_string()
}

/// The kinds of work recorded as spans.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SpanType {
    /// One agent tenure: from the agent taking over until handoff or final
    /// output. Carries the tool and handoff names visible to the model.
    Agent {
        agent_name: String,
        tools: Vec<String>,
        handoffs: Vec<String>,
        output_type: Option<String>,
    },
    /// One model call.
    Generation {
        model: String,
        prompt_tokens: usize,
        completion_tokens: usize,
    },
    /// One tool execution.
    Tool {
        tool_name: String,
        arguments: Value,
    },
    /// A handoff between agents.
    Handoff {
        from_agent: String,
        to_agent: String,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: SpanId,
    pub trace_id: TraceId,
    pub parent_id: Option<SpanId>,
    pub span_type: SpanType,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Structured data attached alongside an error annotation.
    pub metadata: Value,
}

impl Span {
    pub fn new(trace_id: TraceId, parent_id: Option<SpanId>, span_type: SpanType) -> Self {
        Self {
            id: gen_span_id(),
            trace_id,
            parent_id,
            span_type,
            start_time: Utc::now(),
            end_time: None,
            error: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn complete(&mut self) {
        self.end_time = Some(Utc::now());
    }

    pub fn fail(&mut self, error: String) {
        self.error = Some(error);
        self.complete();
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

/// Collects the spans of one trace and tracks the active span for nesting.
pub struct TracingContext {
    trace_id: TraceId,
    current_span_id: Option<SpanId>,
    spans: Vec<Span>,
    finished: bool,
}

impl TracingContext {
    pub fn new() -> Self {
        let trace_id = gen_trace_id();
        info!(trace_id = %trace_id, "starting trace");

        Self {
            trace_id,
            current_span_id: None,
            spans: Vec::new(),
            finished: false,
        }
    }

    /// Start a new span as a child of the current one and make it active.
    pub fn start_span(&mut self, span_type: SpanType) -> SpanId {
        let span_id = self.start_span_under(self.current_span_id.clone(), span_type);
        self.current_span_id = Some(span_id.clone());
        span_id
    }

    /// Start a span under an explicit parent without touching the active-span
    /// pointer. Spans that run concurrently and finish in arbitrary order
    /// (tool calls within one turn) use this so they end up as siblings.
    pub fn start_span_under(&mut self, parent_id: Option<SpanId>, span_type: SpanType) -> SpanId {
        let span = Span::new(self.trace_id.clone(), parent_id, span_type.clone());
        let span_id = span.id.clone();

        match &span_type {
            SpanType::Agent { agent_name, .. } => {
                info!(span_id = %span_id, agent = %agent_name, "starting agent span");
            }
            SpanType::Generation { model, .. } => {
                debug!(span_id = %span_id, model = %model, "starting generation span");
            }
            SpanType::Tool { tool_name, .. } => {
                debug!(span_id = %span_id, tool = %tool_name, "starting tool span");
            }
            SpanType::Handoff {
                from_agent,
                to_agent,
                ..
            } => {
                info!(span_id = %span_id, from = %from_agent, to = %to_agent, "starting handoff span");
            }
        }

        self.spans.push(span);
        span_id
    }

    /// Id of the currently active span, if any.
    pub fn current_span(&self) -> Option<SpanId> {
        self.current_span_id.clone()
    }

    pub fn end_span(&mut self, span_id: &str) {
        if let Some(span) = self.spans.iter_mut().find(|s| s.id == span_id) {
            span.complete();

            if let Some(duration) = span.duration_ms() {
                debug!(span_id = %span_id, duration_ms = duration, "span completed");
            }
            if self.current_span_id.as_deref() == Some(span_id) {
                self.current_span_id = span.parent_id.clone();
            }
        }
    }

    pub fn record_error(&mut self, span_id: &str, message: String) {
        self.record_error_with_data(span_id, message, serde_json::json!({}));
    }

    /// Annotate a span with an error plus structured data, end it, and pop it
    /// off the active chain.
    pub fn record_error_with_data(&mut self, span_id: &str, message: String, data: Value) {
        if let Some(span) = self.spans.iter_mut().find(|s| s.id == span_id) {
            error!(span_id = %span_id, error = %message, "span failed");
            span.metadata = data;
            span.fail(message);
            if self.current_span_id.as_deref() == Some(span_id) {
                self.current_span_id = span.parent_id.clone();
            }
        }
    }

    /// Finish the trace: complete any spans still open and mark the trace
    /// done. Idempotent.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        for span in self.spans.iter_mut().filter(|s| s.end_time.is_none()) {
            span.complete();
        }
        self.current_span_id = None;
        self.finished = true;
        info!(trace_id = %self.trace_id, spans = self.spans.len(), "trace finished");
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }
}

impl Default for TracingContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a tracing context, as threaded through the run.
pub type SharedTracingContext = Arc<Mutex<TracingContext>>;

/// RAII builder for agent-tenure spans.
pub struct AgentSpan {
    context: SharedTracingContext,
    span_id: SpanId,
}

impl AgentSpan {
    pub fn new(
        context: SharedTracingContext,
        agent_name: String,
        tools: Vec<String>,
        handoffs: Vec<String>,
        output_type: Option<String>,
    ) -> Self {
        let span_id = {
            let mut ctx = context.lock().unwrap();
            ctx.start_span(SpanType::Agent {
                agent_name,
                tools,
                handoffs,
                output_type,
            })
        };
        Self { context, span_id }
    }

    pub fn complete(self) {
        let mut ctx = self.context.lock().unwrap();
        ctx.end_span(&self.span_id);
    }

    pub fn error(self, message: String) {
        let mut ctx = self.context.lock().unwrap();
        ctx.record_error(&self.span_id, message);
    }

    /// Fail the span with structured data attached, e.g. the turn ceiling on
    /// a max-turns abort.
    pub fn error_with_data(self, message: String, data: Value) {
        let mut ctx = self.context.lock().unwrap();
        ctx.record_error_with_data(&self.span_id, message, data);
    }
}

/// RAII builder for tool spans.
pub struct ToolSpan {
    context: SharedTracingContext,
    span_id: SpanId,
}

impl ToolSpan {
    /// Open a tool span under `parent` rather than the active span, so that
    /// the spans of concurrent tool calls are siblings instead of a chain.
    pub fn new(
        context: SharedTracingContext,
        parent: Option<SpanId>,
        tool_name: String,
        arguments: Value,
    ) -> Self {
        let span_id = {
            let mut ctx = context.lock().unwrap();
            ctx.start_span_under(parent, SpanType::Tool {
                tool_name,
                arguments,
            })
        };
        Self { context, span_id }
    }

    pub fn success(self) {
        let mut ctx = self.context.lock().unwrap();
        ctx.end_span(&self.span_id);
    }

    pub fn error(self, message: String) {
        let mut ctx = self.context.lock().unwrap();
        ctx.record_error(&self.span_id, message);
    }
}

/// RAII builder for model generation spans.
pub struct GenerationSpan {
    context: SharedTracingContext,
    span_id: SpanId,
}

impl GenerationSpan {
    pub fn new(context: SharedTracingContext, model: String) -> Self {
        let span_id = {
            let mut ctx = context.lock().unwrap();
            ctx.start_span(SpanType::Generation {
                model,
                prompt_tokens: 0,
                completion_tokens: 0,
            })
        };
        Self { context, span_id }
    }

    /// Complete the span, recording final token usage.
    pub fn complete_with_usage(self, usage: Usage) {
        let mut ctx = self.context.lock().unwrap();
        if let Some(span) = ctx.spans.iter_mut().find(|s| s.id == self.span_id) {
            if let SpanType::Generation {
                prompt_tokens,
                completion_tokens,
                ..
            } = &mut span.span_type
            {
                *prompt_tokens = usage.prompt_tokens;
                *completion_tokens = usage.completion_tokens;
            }
        }
        ctx.end_span(&self.span_id);
    }

    pub fn error(self, message: String) {
        let mut ctx = self.context.lock().unwrap();
        ctx.record_error(&self.span_id, message);
    }
}
