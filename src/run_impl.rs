//! Single-turn execution: one think→act cycle of the run loop.
//!
//! A turn resolves the agent's prompt, handoffs, and settings, streams one
//! model call onto the event queue, classifies the response into messages,
//! tool calls, and handoff calls, executes tools through the Tower stack, and
//! reports what the loop should do next.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use futures::StreamExt;
use serde_json::Value;
use tower::ServiceExt;
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::context::RunContext;
use crate::error::{AgentsError, Result};
use crate::handoff::{resolve_handoffs, Handoff, HandoffTool};
use crate::hooks::RunHooks;
use crate::items::{
    ItemHelpers, Message, ModelResponse, RunInput, RunItem, ToolCall, HandoffItem, MessageItem,
    Role, ToolCallItem, ToolOutputItem,
};
use crate::model::{Model, ModelRequest, ModelSettings, ResponseEvent};
use crate::result::{StreamEvent, StreamingState};
use crate::service::{apply_layers, build_tool_stack, Effect, ErasedToolLayer, ToolRequest};
use crate::tool::Tool;
use crate::tracing::{GenerationSpan, SharedTracingContext, ToolSpan};

/// What the loop should do after a turn.
#[derive(Debug)]
pub enum NextStep {
    /// The model called tools; run another turn with their outputs.
    RunAgain,
    /// Transfer control to another agent.
    Handoff(Arc<Agent>),
    /// The run is done.
    FinalOutput(Value),
}

/// The outcome of one turn.
pub struct SingleStepResult {
    pub model_response: ModelResponse,
    /// The run input as of this turn (sessions may have rewritten it).
    pub original_input: RunInput,
    /// Items generated by earlier turns of this run.
    pub pre_step_items: Vec<RunItem>,
    /// Items generated by this turn.
    pub new_step_items: Vec<RunItem>,
    pub next_step: NextStep,
}

impl SingleStepResult {
    /// All items generated so far in the run, oldest first.
    pub fn generated_items(&self) -> Vec<RunItem> {
        let mut items = self.pre_step_items.clone();
        items.extend(self.new_step_items.clone());
        items
    }
}

/// The instructions and input about to be sent to the model.
#[derive(Debug, Clone)]
pub struct ModelInputData {
    pub instructions: Option<String>,
    pub input: Vec<Message>,
}

/// Caller-supplied rewrite of the model input, applied every turn just
/// before the llm-start hooks.
#[async_trait::async_trait]
pub trait ModelInputFilter: Send + Sync {
    async fn filter(&self, data: ModelInputData) -> Result<ModelInputData>;
}

/// Tracks which agents have used tools during a run, to support clearing a
/// forced tool choice after its first use.
#[derive(Debug, Default)]
pub struct AgentToolUseTracker {
    used: HashMap<String, Vec<String>>,
}

impl AgentToolUseTracker {
    pub fn add_tool_use(&mut self, agent: &str, tools: &[String]) {
        self.used
            .entry(agent.to_string())
            .or_default()
            .extend(tools.iter().cloned());
    }

    pub fn has_used_tools(&self, agent: &str) -> bool {
        self.used.get(agent).map(|t| !t.is_empty()).unwrap_or(false)
    }
}

/// Clear a forced tool choice once the agent has already used a tool, so a
/// `Required` or named choice cannot loop forever.
pub(crate) fn maybe_reset_tool_choice(
    agent: &Agent,
    tracker: &AgentToolUseTracker,
    mut settings: ModelSettings,
) -> ModelSettings {
    if agent.config.reset_tool_choice
        && settings.tool_choice.is_some()
        && tracker.has_used_tools(agent.name())
    {
        debug!(agent = %agent.name(), "resetting forced tool choice after tool use");
        settings.tool_choice = None;
    }
    settings
}

/// Run-scoped collaborators threaded through every turn.
pub(crate) struct TurnEnv {
    pub state: Arc<StreamingState>,
    pub context: Arc<RunContext>,
    pub hooks: Arc<dyn RunHooks>,
    pub trace: SharedTracingContext,
    pub run_id: String,
    pub run_layers: Vec<Arc<dyn ErasedToolLayer>>,
    pub input_filter: Option<Arc<dyn ModelInputFilter>>,
}

impl TurnEnv {
    /// The global hooks plus the agent's own, dispatched together.
    pub(crate) fn hook_set(&self, agent: &Agent) -> Vec<Arc<dyn RunHooks>> {
        let mut hooks = vec![self.hooks.clone()];
        if let Some(agent_hooks) = &agent.config.hooks {
            hooks.push(agent_hooks.clone());
        }
        hooks
    }
}

/// Execute one streamed turn for `agent`.
///
/// `strip_tools` forces a tool-free turn: no tools or handoffs are advertised
/// and any forced tool choice is dropped. The loop uses it to get one last
/// plain reply when the turn budget runs out under the reply policy.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_single_turn_streamed(
    env: &TurnEnv,
    agent: &Arc<Agent>,
    original_input: &RunInput,
    pre_step_items: &[RunItem],
    model: &Arc<dyn Model>,
    settings: ModelSettings,
    should_run_agent_start_hooks: bool,
    strip_tools: bool,
) -> Result<SingleStepResult> {
    if should_run_agent_start_hooks {
        let hooks = env.hook_set(agent);
        join_all(
            hooks
                .iter()
                .map(|h| h.on_agent_start(&env.context, agent)),
        )
        .await;
    }

    let instructions = agent
        .config
        .instructions
        .resolve(&env.context, agent)
        .await?;
    let instructions = if instructions.is_empty() {
        None
    } else {
        Some(instructions)
    };

    let handoffs = if strip_tools {
        Vec::new()
    } else {
        resolve_handoffs(agent.handoffs(), &env.context).await?
    };

    let mut advertised: Vec<Arc<dyn Tool>> = Vec::new();
    let mut settings = settings;
    if strip_tools {
        settings.tool_choice = None;
    } else {
        advertised.extend(agent.tools().iter().cloned());
        advertised.extend(
            handoffs
                .iter()
                .map(|h| Arc::new(HandoffTool::new(h.clone())) as Arc<dyn Tool>),
        );
    }

    // Model input: the run input followed by everything generated so far.
    let mut input = original_input.to_messages();
    input.extend(ItemHelpers::to_messages(pre_step_items));

    let mut data = ModelInputData {
        instructions,
        input,
    };
    if let Some(filter) = &env.input_filter {
        data = filter.filter(data).await?;
    }

    let hooks = env.hook_set(agent);
    join_all(hooks.iter().map(|h| {
        h.on_llm_start(
            &env.context,
            agent,
            data.instructions.as_deref(),
            &data.input,
        )
    }))
    .await;

    let gen_span = GenerationSpan::new(env.trace.clone(), model.name().to_string());
    let request = ModelRequest {
        instructions: data.instructions,
        input: data.input,
        settings,
        tools: advertised,
        output_schema: agent.config.output_schema.clone(),
    };

    let mut stream = match model.stream_response(request).await {
        Ok(stream) => stream,
        Err(e) => {
            gen_span.error(e.to_string());
            return Err(e);
        }
    };

    let mut response: Option<ModelResponse> = None;
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                if let ResponseEvent::Completed { response: r } = &event {
                    response = Some(r.clone());
                }
                env.state.emit(StreamEvent::RawResponse(event));
            }
            Err(e) => {
                gen_span.error(e.to_string());
                return Err(e);
            }
        }
    }

    let response = match response {
        Some(response) => response,
        None => {
            let err = AgentsError::model_behavior("model stream ended without a completed response");
            gen_span.error(err.to_string());
            return Err(err);
        }
    };

    gen_span.complete_with_usage(response.usage.clone());
    env.context.add_usage(&response.usage);
    env.state
        .raw_responses
        .lock()
        .unwrap()
        .push(response.clone());

    let hooks = env.hook_set(agent);
    join_all(
        hooks
            .iter()
            .map(|h| h.on_llm_end(&env.context, agent, &response)),
    )
    .await;

    let next = process_model_response(env, agent, &handoffs, &response).await?;

    Ok(SingleStepResult {
        model_response: response,
        original_input: original_input.clone(),
        pre_step_items: pre_step_items.to_vec(),
        new_step_items: next.items,
        next_step: next.step,
    })
}

struct ProcessedResponse {
    items: Vec<RunItem>,
    step: NextStep,
}

/// Classify the model response and execute its side effects.
async fn process_model_response(
    env: &TurnEnv,
    agent: &Arc<Agent>,
    handoffs: &[Handoff],
    response: &ModelResponse,
) -> Result<ProcessedResponse> {
    let mut items: Vec<RunItem> = Vec::new();

    if let Some(content) = &response.content {
        if !content.is_empty() {
            let item = RunItem::Message(MessageItem {
                id: response.id.clone(),
                role: Role::Assistant,
                content: content.clone(),
                created_at: Utc::now(),
            });
            env.state.emit(StreamEvent::RunItem(item.clone()));
            items.push(item);
        }
    }

    // Split calls into the first handoff, executable tools, and rejects.
    let mut handoff_target: Option<(Arc<Agent>, &ToolCall)> = None;
    let mut executable: Vec<(&ToolCall, Arc<dyn Tool>)> = Vec::new();
    let mut rejected: Vec<(&ToolCall, String)> = Vec::new();

    for call in &response.tool_calls {
        if let Some(handoff) = handoffs.iter().find(|h| h.tool_name() == call.name) {
            if handoff_target.is_none() {
                handoff_target = Some((handoff.agent.clone(), call));
            } else {
                rejected.push((call, "multiple handoffs requested; only the first was honored".to_string()));
            }
        } else if let Some(tool) = agent.tools().iter().find(|t| t.name() == call.name) {
            executable.push((call, tool.clone()));
        } else {
            warn!(tool = %call.name, "model called unknown tool");
            rejected.push((call, format!("unknown tool: {}", call.name)));
        }
    }

    // Handoff calls are acknowledged immediately so consumers see the
    // transfer before any tool output.
    if let Some((target, call)) = &handoff_target {
        let call_item = RunItem::ToolCall(ToolCallItem {
            id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            created_at: Utc::now(),
        });
        env.state.emit(StreamEvent::RunItem(call_item.clone()));
        items.push(call_item);

        let ack = RunItem::ToolOutput(ToolOutputItem {
            id: uuid::Uuid::new_v4().to_string(),
            tool_call_id: call.id.clone(),
            output: serde_json::json!({"assistant": target.name()}),
            error: None,
            created_at: Utc::now(),
        });
        env.state.emit(StreamEvent::RunItem(ack.clone()));
        items.push(ack);

        let reason = call
            .arguments
            .get("reason")
            .and_then(|v| v.as_str())
            .map(String::from);

        {
            let mut trace = env.trace.lock().unwrap();
            let span_id = trace.start_span(crate::tracing::SpanType::Handoff {
                from_agent: agent.name().to_string(),
                to_agent: target.name().to_string(),
                reason: reason.clone(),
            });
            trace.end_span(&span_id);
        }

        let handoff_item = RunItem::Handoff(HandoffItem {
            id: uuid::Uuid::new_v4().to_string(),
            from_agent: agent.name().to_string(),
            to_agent: target.name().to_string(),
            reason,
            created_at: Utc::now(),
        });
        env.state.emit(StreamEvent::RunItem(handoff_item.clone()));
        items.push(handoff_item);
    }

    for (call, reason) in &rejected {
        let call_item = RunItem::ToolCall(ToolCallItem {
            id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            created_at: Utc::now(),
        });
        env.state.emit(StreamEvent::RunItem(call_item.clone()));
        items.push(call_item);

        let output = RunItem::ToolOutput(ToolOutputItem {
            id: uuid::Uuid::new_v4().to_string(),
            tool_call_id: call.id.clone(),
            output: Value::Null,
            error: Some(reason.clone()),
            created_at: Utc::now(),
        });
        env.state.emit(StreamEvent::RunItem(output.clone()));
        items.push(output);
    }

    let mut final_from_tool: Option<Value> = None;
    if !executable.is_empty() {
        for (call, _) in &executable {
            let call_item = RunItem::ToolCall(ToolCallItem {
                id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
                created_at: Utc::now(),
            });
            env.state.emit(StreamEvent::RunItem(call_item.clone()));
            items.push(call_item);
        }

        let responses = execute_tools(env, agent, &executable).await;
        for ((call, _), response) in executable.iter().zip(responses) {
            let output = match &response.effect {
                Effect::Rewrite(v) => v.clone(),
                _ => response.output.clone(),
            };
            if let Effect::Final(v) = &response.effect {
                final_from_tool.get_or_insert(v.clone());
            }
            let item = RunItem::ToolOutput(ToolOutputItem {
                id: uuid::Uuid::new_v4().to_string(),
                tool_call_id: call.id.clone(),
                output,
                error: response.error.clone(),
                created_at: Utc::now(),
            });
            env.state.emit(StreamEvent::RunItem(item.clone()));
            items.push(item);
        }
    }

    let step = if let Some(value) = final_from_tool {
        NextStep::FinalOutput(value)
    } else if let Some((target, _)) = handoff_target {
        NextStep::Handoff(target)
    } else if response.tool_calls.is_empty() {
        NextStep::FinalOutput(final_output_value(agent, response)?)
    } else {
        NextStep::RunAgain
    };

    Ok(ProcessedResponse { items, step })
}

/// Run every executable call through its Tower stack concurrently, preserving
/// call order in the results.
async fn execute_tools(
    env: &TurnEnv,
    agent: &Arc<Agent>,
    calls: &[(&ToolCall, Arc<dyn Tool>)],
) -> Vec<crate::service::ToolResponse> {
    // All tool spans of a turn hang off the agent span, not off each other.
    let parent = env.trace.lock().unwrap().current_span();
    let futures = calls.iter().map(|(call, tool)| {
        let stack = build_tool_stack(tool.clone());
        let stack = apply_layers(stack, &agent.config.agent_layers);
        let stack = apply_layers(stack, &env.run_layers);
        let span = ToolSpan::new(
            env.trace.clone(),
            parent.clone(),
            call.name.clone(),
            call.arguments.clone(),
        );
        let request = ToolRequest {
            run_id: env.run_id.clone(),
            agent: agent.name().to_string(),
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
        };
        async move {
            match stack.oneshot(request).await {
                Ok(response) => {
                    match &response.error {
                        Some(err) => span.error(err.clone()),
                        None => span.success(),
                    }
                    response
                }
                Err(e) => {
                    span.error(e.to_string());
                    crate::service::ToolResponse::error(e.to_string())
                }
            }
        }
    });

    join_all(futures).await
}

/// Turn a plain assistant reply into the run's final output, honoring the
/// agent's output schema.
fn final_output_value(agent: &Agent, response: &ModelResponse) -> Result<Value> {
    let content = response.content.clone().unwrap_or_default();
    match &agent.config.output_schema {
        Some(_) => serde_json::from_str(&content).map_err(|e| {
            AgentsError::model_behavior(format!(
                "final output is not valid JSON for the declared schema: {}",
                e
            ))
        }),
        None => Ok(Value::String(content)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolChoice;

    #[test]
    fn test_tool_use_tracker() {
        let mut tracker = AgentToolUseTracker::default();
        assert!(!tracker.has_used_tools("triage"));

        tracker.add_tool_use("triage", &["get_weather".to_string()]);
        assert!(tracker.has_used_tools("triage"));
        assert!(!tracker.has_used_tools("billing"));
    }

    #[test]
    fn test_tool_choice_reset_after_use() {
        let agent = Agent::simple("triage", "Route requests.");
        let mut tracker = AgentToolUseTracker::default();
        let settings = ModelSettings {
            tool_choice: Some(ToolChoice::Required),
            ..Default::default()
        };

        // not used yet: forced choice survives
        let kept = maybe_reset_tool_choice(&agent, &tracker, settings.clone());
        assert_eq!(kept.tool_choice, Some(ToolChoice::Required));

        tracker.add_tool_use("triage", &["get_weather".to_string()]);
        let cleared = maybe_reset_tool_choice(&agent, &tracker, settings.clone());
        assert_eq!(cleared.tool_choice, None);

        // opt-out leaves the forced choice alone
        let opt_out = Agent::simple("triage", "Route requests.").with_reset_tool_choice(false);
        let kept = maybe_reset_tool_choice(&opt_out, &tracker, settings);
        assert_eq!(kept.tool_choice, Some(ToolChoice::Required));
    }

    #[test]
    fn test_final_output_respects_schema() {
        let plain = Agent::simple("a", "x");
        let response = ModelResponse::new_message("hello");
        assert_eq!(
            final_output_value(&plain, &response).unwrap(),
            Value::String("hello".to_string())
        );

        let structured = Agent::simple("a", "x")
            .with_output_schema(serde_json::json!({"type": "object"}));
        let response = ModelResponse::new_message(r#"{"city": "Tokyo"}"#);
        assert_eq!(
            final_output_value(&structured, &response).unwrap()["city"],
            "Tokyo"
        );

        let bad = ModelResponse::new_message("not json");
        assert!(matches!(
            final_output_value(&structured, &bad),
            Err(AgentsError::ModelBehaviorError { .. })
        ));
    }
}
