//! Lifecycle hooks invoked at well-defined points of the run loop.
//!
//! Both a global hooks object (passed in [`RunConfig`](crate::runner::RunConfig))
//! and an optional per-agent hooks object are invoked together at each point.
//! The default implementations are no-ops, so the loop always dispatches
//! through the trait without branching at call sites.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::agent::Agent;
use crate::context::RunContext;
use crate::items::{Message, ModelResponse};

/// Async extension points for observing and steering a run.
#[async_trait]
pub trait RunHooks: Send + Sync {
    /// Called when an agent becomes current: at run start and after each handoff.
    async fn on_agent_start(&self, _ctx: &RunContext, _agent: &Agent) {}

    /// Called just before the model is invoked, with the filtered instructions
    /// and input that will be sent.
    async fn on_llm_start(
        &self,
        _ctx: &RunContext,
        _agent: &Agent,
        _instructions: Option<&str>,
        _input: &[Message],
    ) {
    }

    /// Called after the model stream produced a completed response.
    async fn on_llm_end(&self, _ctx: &RunContext, _agent: &Agent, _response: &ModelResponse) {}

    /// Called when the run terminates with a final output.
    async fn on_agent_end(&self, _ctx: &RunContext, _agent: &Agent, _output: &Value) {}
}

/// No-op hooks, the default for runs and agents that do not observe lifecycle
/// events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl RunHooks for NoopHooks {}

/// Returns the shared no-op hooks instance.
pub fn noop_hooks() -> Arc<dyn RunHooks> {
    Arc::new(NoopHooks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHooks {
        starts: AtomicUsize,
        llm_starts: AtomicUsize,
    }

    #[async_trait]
    impl RunHooks for CountingHooks {
        async fn on_agent_start(&self, _ctx: &RunContext, _agent: &Agent) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_llm_start(
            &self,
            _ctx: &RunContext,
            _agent: &Agent,
            _instructions: Option<&str>,
            _input: &[Message],
        ) {
            self.llm_starts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_hooks_dispatch() {
        let hooks = CountingHooks {
            starts: AtomicUsize::new(0),
            llm_starts: AtomicUsize::new(0),
        };
        let ctx = RunContext::new();
        let agent = Agent::simple("Test", "Test agent");

        hooks.on_agent_start(&ctx, &agent).await;
        hooks.on_llm_start(&ctx, &agent, None, &[]).await;
        hooks.on_llm_end(&ctx, &agent, &ModelResponse::new_message("hi"))
            .await;

        assert_eq!(hooks.starts.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.llm_starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_noop_hooks() {
        let hooks = NoopHooks;
        let ctx = RunContext::new();
        let agent = Agent::simple("Test", "Test agent");
        // No-ops must be callable without side effects.
        hooks.on_agent_start(&ctx, &agent).await;
        hooks
            .on_agent_end(&ctx, &agent, &serde_json::json!("done"))
            .await;
    }
}
