//! The streaming run loop.
//!
//! `ReactRunner::run_streamed` validates the request, snapshots the run
//! state, and spawns the loop on a background task, returning a
//! [`RunResultStreaming`] handle immediately. The loop drives turns through
//! [`run_single_turn_streamed`](crate::run_impl), persisting to the session
//! and emitting events as it goes, and guarantees a terminal sentinel on
//! every exit path.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::Agent;
use crate::context::RunContext;
use crate::error::{AgentsError, Result};
use crate::guardrail::GuardrailRunner;
use crate::handoff::HandoffSetup;
use crate::hooks::{noop_hooks, RunHooks};
use crate::items::{ItemHelpers, Message, RunInput, RunItem};
use crate::memory::{Session, SessionInputCallback};
use crate::model::{Model, ModelProvider, ModelSettings, OpenAIProvider};
use crate::result::{RunResultStreaming, StreamEvent, StreamingState};
use crate::run_impl::{
    maybe_reset_tool_choice, run_single_turn_streamed, AgentToolUseTracker, ModelInputFilter,
    NextStep, TurnEnv,
};
use crate::service::ErasedToolLayer;
use crate::tracing::{AgentSpan, SharedTracingContext, TracingContext};

/// Default turn ceiling for a run.
pub const DEFAULT_MAX_TURNS: usize = 10;

/// What to do when a run reaches its turn ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxTurnsPolicy {
    /// Abort the run; the consumer observes a max-turns error when draining.
    #[default]
    Error,
    /// Strip tools and force one final tool-free turn, completing the run
    /// with a plain reply instead of an error.
    FinalReply,
}

/// Per-run configuration.
#[derive(Clone)]
pub struct RunConfig {
    pub max_turns: usize,
    pub on_max_turns: MaxTurnsPolicy,
    /// Run-level model override, taking precedence over the agent's own.
    pub model: Option<Arc<dyn Model>>,
    /// Resolves agent model names when no override is set.
    pub model_provider: Arc<dyn ModelProvider>,
    /// Run-level settings merged over each agent's settings.
    pub model_settings: ModelSettings,
    pub session: Option<Arc<dyn Session>>,
    /// Merges session history with structured run input. Required when the
    /// input is a message list and a session is attached.
    pub session_input_callback: Option<Arc<dyn SessionInputCallback>>,
    pub input_filter: Option<Arc<dyn ModelInputFilter>>,
    /// Run-scope policy layers applied outermost around every tool stack.
    pub run_layers: Vec<Arc<dyn ErasedToolLayer>>,
    /// Ambient trace to attach spans to. When absent the run owns its trace
    /// and finishes it on exit.
    pub trace_context: Option<SharedTracingContext>,
    pub hooks: Arc<dyn RunHooks>,
    pub context: Arc<RunContext>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            on_max_turns: MaxTurnsPolicy::default(),
            model: None,
            model_provider: Arc::new(OpenAIProvider::new()),
            model_settings: ModelSettings::default(),
            session: None,
            session_input_callback: None,
            input_filter: None,
            run_layers: vec![],
            trace_context: None,
            hooks: noop_hooks(),
            context: Arc::new(RunContext::new()),
        }
    }
}

impl RunConfig {
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_max_turns_policy(mut self, policy: MaxTurnsPolicy) -> Self {
        self.on_max_turns = policy;
        self
    }

    pub fn with_model(mut self, model: Arc<dyn Model>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_session(mut self, session: Arc<dyn Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn RunHooks>) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Entry point for streamed runs.
pub struct ReactRunner;

impl ReactRunner {
    /// Start a streamed run. Returns immediately with a handle; the loop
    /// executes on a spawned task. Fails synchronously when the input is a
    /// message list, a session is attached, and no merge callback is
    /// configured.
    pub fn run_streamed(
        agent: Arc<Agent>,
        input: impl Into<RunInput>,
        config: RunConfig,
    ) -> Result<RunResultStreaming> {
        let input = input.into();

        if config.session.is_some()
            && !input.is_text()
            && config.session_input_callback.is_none()
        {
            return Err(AgentsError::user(
                "structured input with a session requires a session_input_callback to merge history",
            ));
        }

        let run_id = Uuid::new_v4().to_string();
        info!(
            run_id = %run_id,
            agent = %agent.name(),
            max_turns = config.max_turns,
            "starting streamed run"
        );

        let owns_trace = config.trace_context.is_none();
        let trace = config
            .trace_context
            .clone()
            .unwrap_or_else(|| Arc::new(Mutex::new(TracingContext::new())));

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let state = Arc::new(StreamingState::new(
            agent.clone(),
            input,
            config.max_turns,
            tx,
        ));

        let loop_state = state.clone();
        let handle = tokio::spawn(streaming_loop(
            loop_state, agent, config, trace, owns_trace, run_id,
        ));

        Ok(RunResultStreaming::new(state, rx, handle))
    }
}

/// Outer loop wrapper: runs the loop, stores any error, then marks the run
/// complete, finishes the owned trace, and enqueues the terminal sentinel.
async fn streaming_loop(
    state: Arc<StreamingState>,
    agent: Arc<Agent>,
    config: RunConfig,
    trace: SharedTracingContext,
    owns_trace: bool,
    run_id: String,
) {
    let result = run_loop(state.clone(), agent, config, trace.clone(), run_id).await;
    if let Err(e) = result {
        warn!(error = %e, "run loop ended with error");
        *state.error.lock().unwrap() = Some(e);
    }

    state.is_complete.store(true, Ordering::SeqCst);
    if owns_trace {
        trace.lock().unwrap().finish();
    }
    state.emit_sentinel();
}

async fn run_loop(
    state: Arc<StreamingState>,
    agent: Arc<Agent>,
    config: RunConfig,
    trace: SharedTracingContext,
    run_id: String,
) -> Result<()> {
    let mut current_span: Option<AgentSpan> = None;
    let result = run_loop_inner(
        state,
        agent,
        config,
        trace,
        run_id,
        &mut current_span,
    )
    .await;

    // any span still open is closed here, annotated on failure
    if let Some(span) = current_span.take() {
        match &result {
            Ok(()) => span.complete(),
            Err(e) => span.error(e.to_string()),
        }
    }
    result
}

async fn run_loop_inner(
    state: Arc<StreamingState>,
    starting_agent: Arc<Agent>,
    config: RunConfig,
    trace: SharedTracingContext,
    run_id: String,
    current_span: &mut Option<AgentSpan>,
) -> Result<()> {
    let env = TurnEnv {
        state: state.clone(),
        context: config.context.clone(),
        hooks: config.hooks.clone(),
        trace: trace.clone(),
        run_id,
        run_layers: config.run_layers.clone(),
        input_filter: config.input_filter.clone(),
    };

    let mut current_agent = starting_agent;
    let mut generated_items: Vec<RunItem> = Vec::new();
    let mut tracker = AgentToolUseTracker::default();
    let mut should_run_agent_start_hooks = true;
    let mut turn: usize = 0;

    state.emit(StreamEvent::AgentUpdated {
        agent: current_agent.clone(),
    });

    let original_input = state.input.lock().unwrap().clone();

    let guard_text = input_text(&original_input);
    let records =
        GuardrailRunner::check_input(&current_agent.config.input_guardrails, &guard_text).await?;
    *state.input_guardrail_results.lock().unwrap() = records;

    // Session: merge history into the run input, then write a baseline
    // record of the original input before the first turn.
    if let Some(session) = &config.session {
        let merged = prepare_input_with_session(
            session.as_ref(),
            &original_input,
            config.session_input_callback.as_deref(),
        )
        .await?;
        *state.input.lock().unwrap() = RunInput::Items(merged);

        let baseline = ItemHelpers::items_from_messages(&original_input.to_messages());
        session.add_items(baseline).await?;
    }

    let run_input = state.input.lock().unwrap().clone();

    loop {
        if state.cancelled.load(Ordering::SeqCst) {
            info!(agent = %current_agent.name(), turn, "run cancelled");
            if let Some(span) = current_span.take() {
                span.complete();
            }
            return Ok(());
        }

        turn += 1;
        let mut strip_tools = false;
        if turn > state.max_turns {
            match config.on_max_turns {
                MaxTurnsPolicy::Error => {
                    warn!(max_turns = state.max_turns, "maximum turns exceeded");
                    if let Some(span) = current_span.take() {
                        span.error_with_data(
                            format!("max turns ({}) exceeded", state.max_turns),
                            serde_json::json!({"max_turns": state.max_turns}),
                        );
                    }
                    return Err(AgentsError::MaxTurnsExceeded {
                        max_turns: state.max_turns,
                    });
                }
                MaxTurnsPolicy::FinalReply => {
                    warn!(
                        max_turns = state.max_turns,
                        "maximum turns reached; forcing a final tool-free reply"
                    );
                    strip_tools = true;
                }
            }
        }
        state.current_turn.store(turn, Ordering::SeqCst);

        if current_span.is_none() {
            *current_span = Some(AgentSpan::new(
                trace.clone(),
                current_agent.name().to_string(),
                current_agent
                    .tools()
                    .iter()
                    .map(|t| t.name().to_string())
                    .collect(),
                handoff_names(current_agent.handoffs()),
                current_agent
                    .config
                    .output_schema
                    .as_ref()
                    .map(|_| "json_schema".to_string()),
            ));
        }

        let model = resolve_model(&config, &current_agent);
        let settings = current_agent
            .config
            .model_settings
            .resolve(&config.model_settings);
        let settings = maybe_reset_tool_choice(&current_agent, &tracker, settings);

        let step = run_single_turn_streamed(
            &env,
            &current_agent,
            &run_input,
            &generated_items,
            &model,
            settings,
            should_run_agent_start_hooks,
            strip_tools,
        )
        .await?;
        should_run_agent_start_hooks = false;

        state.usage_stats.lock().unwrap().record(
            model.name(),
            current_agent.name(),
            step.model_response.usage.clone(),
        );

        let tools_used: Vec<String> = step
            .new_step_items
            .iter()
            .filter_map(|item| match item {
                RunItem::ToolCall(call) => Some(call.tool_name.clone()),
                _ => None,
            })
            .collect();
        if !tools_used.is_empty() {
            tracker.add_tool_use(current_agent.name(), &tools_used);
        }

        // per-turn snapshot replaces the previous turn's items
        *state.new_items.lock().unwrap() = step.new_step_items.clone();

        // persist before any transition so interruptions never lose a turn
        if let Some(session) = &config.session {
            session.add_items(step.new_step_items.clone()).await?;
        }
        generated_items.extend(step.new_step_items.iter().cloned());

        match step.next_step {
            NextStep::RunAgain => {
                if strip_tools {
                    return Err(AgentsError::model_behavior(
                        "model kept calling tools during the forced final reply",
                    ));
                }
            }
            NextStep::Handoff(target) => {
                info!(
                    from = %current_agent.name(),
                    to = %target.name(),
                    "agent handoff"
                );
                if let Some(span) = current_span.take() {
                    span.complete();
                }
                current_agent = target.clone();
                *state.current_agent.lock().unwrap() = target.clone();
                should_run_agent_start_hooks = true;
                state.emit(StreamEvent::AgentUpdated { agent: target });

                // cancellation lands between tenures, never mid-turn
                if state.cancelled.load(Ordering::SeqCst) {
                    info!(turn, "run cancelled after handoff");
                    return Ok(());
                }
            }
            NextStep::FinalOutput(value) => {
                let text = match value.as_str() {
                    Some(s) => s.to_string(),
                    None => value.to_string(),
                };
                let records = GuardrailRunner::check_output(
                    &current_agent.config.output_guardrails,
                    &text,
                )
                .await?;
                *state.output_guardrail_results.lock().unwrap() = records;
                *state.final_output.lock().unwrap() = Some(value.clone());

                let hooks = env.hook_set(&current_agent);
                join_all(
                    hooks
                        .iter()
                        .map(|h| h.on_agent_end(&config.context, &current_agent, &value)),
                )
                .await;

                if let Some(span) = current_span.take() {
                    span.complete();
                }
                info!(agent = %current_agent.name(), turn, "run completed");
                return Ok(());
            }
        }
    }
}

fn resolve_model(config: &RunConfig, agent: &Agent) -> Arc<dyn Model> {
    config
        .model
        .clone()
        .or_else(|| agent.config.model_override.clone())
        .unwrap_or_else(|| config.model_provider.get_model(&agent.config.model))
}

/// Handoff names knowable without running resolvers, for span annotation.
fn handoff_names(setups: &[HandoffSetup]) -> Vec<String> {
    setups
        .iter()
        .filter_map(|setup| match setup {
            HandoffSetup::Agent(agent) => Some(agent.name().to_string()),
            HandoffSetup::Descriptor(handoff) => Some(handoff.name.clone()),
            HandoffSetup::Resolver(_) => None,
        })
        .collect()
}

fn input_text(input: &RunInput) -> String {
    match input {
        RunInput::Text(text) => text.clone(),
        RunInput::Items(messages) => messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Merge session history with new run input. Text input appends a user
/// message to the history; structured input goes through the caller's merge
/// callback.
async fn prepare_input_with_session(
    session: &dyn Session,
    input: &RunInput,
    callback: Option<&dyn SessionInputCallback>,
) -> Result<Vec<Message>> {
    let history = session.get_messages(None).await?;
    match input {
        RunInput::Text(text) => {
            let mut merged = history;
            merged.push(Message::user(text.clone()));
            Ok(merged)
        }
        RunInput::Items(items) => match callback {
            Some(callback) => callback.merge(history, items.clone()).await,
            None => Err(AgentsError::user(
                "structured input with a session requires a session_input_callback to merge history",
            )),
        },
    }
}
