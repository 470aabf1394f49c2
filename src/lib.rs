//! # Streaming ReAct agents for Rust
//!
//! A turn-based agent runtime on top of OpenAI chat models: each turn streams
//! a model response, executes the tools it requested through Tower service
//! stacks, and either loops, hands off to another agent, or produces the
//! final output. Consumers watch the whole run as a stream of events while
//! the loop executes on a background task.
//!
//! ## Core Concepts
//!
//! - **Agent**: instructions, tools, handoffs, and guardrails bundled under
//!   a name, with per-agent model settings
//! - **Runner**: spawns the run loop and returns a streaming handle
//!   immediately; the stream ends at a terminal sentinel on every exit path
//! - **Handoffs**: agents exposed to the model as `transfer_to_*` tools;
//!   calling one moves the conversation to the target agent
//! - **Sessions**: persistent conversation history (in-memory or SQLite),
//!   saved turn by turn so interruptions never lose completed work
//!
//! ## Getting Started
//!
//! Set your OpenAI API key in the `OPENAI_API_KEY` environment variable.
//!
//! ```rust,no_run
//! use react_agents_rs::{Agent, FunctionTool, ReactRunner, RunConfig, StreamEvent};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! # async fn example() -> react_agents_rs::Result<()> {
//! let weather = FunctionTool::simple(
//!     "get_weather",
//!     "Get the weather for a city",
//!     |city: String| format!("Sunny in {city}"),
//! );
//!
//! let agent = Arc::new(
//!     Agent::simple("assistant", "You are a helpful assistant.")
//!         .with_tool(Arc::new(weather)),
//! );
//!
//! let result = ReactRunner::run_streamed(agent, "What's the weather in Paris?", RunConfig::default())?;
//!
//! let mut events = result.stream_events();
//! while let Some(event) = events.next().await {
//!     match event? {
//!         StreamEvent::RunItem(item) => println!("item: {item:?}"),
//!         StreamEvent::AgentUpdated { agent } => println!("agent: {}", agent.name()),
//!         StreamEvent::RawResponse(_) => {}
//!     }
//! }
//! println!("final: {:?}", result.final_output());
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod context;
pub mod error;
pub mod guardrail;
pub mod handoff;
pub mod hooks;
pub mod items;
pub mod memory;
pub mod model;
pub mod result;
pub mod runner;
pub mod service;
pub mod sqlite_session;
pub mod tool;
pub mod tracing;
pub mod usage;

mod run_impl;

// Public re-exports for convenience
pub use agent::{Agent, AgentConfig, Instructions, InstructionsFn};
pub use context::RunContext;
pub use error::{AgentsError, Result};
pub use guardrail::{
    BlocklistGuardrail, GuardrailRecord, GuardrailResult, InputGuardrail, MaxLengthGuardrail,
    OutputGuardrail,
};
pub use handoff::{Handoff, HandoffResolver, HandoffSetup};
pub use hooks::{NoopHooks, RunHooks};
pub use items::{
    ItemHelpers, Message, ModelResponse, Role, RunInput, RunItem, ToolCall,
};
pub use memory::{InMemorySession, Session, SessionInputCallback};
pub use model::{
    Model, ModelProvider, ModelRequest, ModelSettings, OpenAIModel, OpenAIProvider, ResponseEvent,
    ScriptedModel, ToolChoice,
};
pub use result::{RunResult, RunResultStreaming, StreamEvent};
pub use run_impl::{ModelInputData, ModelInputFilter};
pub use runner::{MaxTurnsPolicy, ReactRunner, RunConfig, DEFAULT_MAX_TURNS};
pub use service::{
    boxed_retry_times, boxed_timeout_secs, BoxedRetryLayer, BoxedTimeoutLayer, Effect,
    ErasedToolLayer, InputSchemaLayer, ToolRequest, ToolResponse,
};
pub use sqlite_session::SqliteSession;
pub use tool::{FunctionTool, Tool, ToolResult};
pub use tracing::{SharedTracingContext, Span, SpanType, TracingContext};
pub use usage::{Usage, UsageStats};

// Re-export async-openai client types for custom providers
pub use async_openai::{config::OpenAIConfig, Client};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_imports() {
        let _ = std::mem::size_of::<AgentsError>();
    }
}
