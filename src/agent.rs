//! Agent definition and configuration.
//!
//! An `Agent` bundles everything one participant in a run needs: a name,
//! instructions (static or computed per-run), tools, handoff setups, model
//! selection and settings, hooks, guardrails, and tool-stack layers. Agents
//! are built with a fluent builder and shared via `Arc` across the loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::RunContext;
use crate::error::Result;
use crate::guardrail::{InputGuardrail, OutputGuardrail};
use crate::handoff::HandoffSetup;
use crate::hooks::RunHooks;
use crate::model::{Model, ModelSettings};
use crate::service::ErasedToolLayer;
use crate::tool::Tool;

/// Computes an agent's system prompt at turn time.
#[async_trait]
pub trait InstructionsFn: Send + Sync {
    async fn get(&self, context: &RunContext, agent: &Agent) -> Result<String>;
}

/// System instructions: a fixed string or a resolver invoked each turn.
#[derive(Clone)]
pub enum Instructions {
    Static(String),
    Dynamic(Arc<dyn InstructionsFn>),
}

impl Instructions {
    pub async fn resolve(&self, context: &RunContext, agent: &Agent) -> Result<String> {
        match self {
            Instructions::Static(s) => Ok(s.clone()),
            Instructions::Dynamic(f) => f.get(context, agent).await,
        }
    }
}

impl From<&str> for Instructions {
    fn from(s: &str) -> Self {
        Instructions::Static(s.to_string())
    }
}

impl From<String> for Instructions {
    fn from(s: String) -> Self {
        Instructions::Static(s)
    }
}

/// Complete configuration for an [`Agent`].
#[derive(Clone)]
pub struct AgentConfig {
    /// Agent name, used for identification, logs, and handoff tool names.
    pub name: String,

    /// System instructions guiding the agent's behavior.
    pub instructions: Instructions,

    /// Tools the agent may call.
    pub tools: Vec<Arc<dyn Tool>>,

    /// Handoff targets, resolved into descriptors each turn.
    pub handoffs: Vec<HandoffSetup>,

    /// Guardrails applied to run input before the first turn.
    pub input_guardrails: Vec<Arc<dyn InputGuardrail>>,

    /// Guardrails applied to the final output.
    pub output_guardrails: Vec<Arc<dyn OutputGuardrail>>,

    /// Model name, resolved through the provider when no instance override
    /// is set.
    pub model: String,

    /// Explicit model instance taking precedence over name resolution.
    pub model_override: Option<Arc<dyn Model>>,

    /// Agent-level model settings; run-level overrides merge on top.
    pub model_settings: ModelSettings,

    /// Optional JSON schema for structured final output.
    pub output_schema: Option<Value>,

    /// Per-agent lifecycle hooks, invoked alongside the run-level hooks.
    pub hooks: Option<Arc<dyn RunHooks>>,

    /// Agent-scope policy layers applied around each tool stack.
    pub agent_layers: Vec<Arc<dyn ErasedToolLayer>>,

    /// When true, a forced tool choice is cleared after the agent has used
    /// a tool once, preventing infinite tool-call loops.
    pub reset_tool_choice: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "assistant".to_string(),
            instructions: Instructions::Static("You are a helpful assistant.".to_string()),
            tools: vec![],
            handoffs: vec![],
            input_guardrails: vec![],
            output_guardrails: vec![],
            model: "gpt-4o".to_string(),
            model_override: None,
            model_settings: ModelSettings::default(),
            output_schema: None,
            hooks: None,
            agent_layers: vec![],
            reset_tool_choice: true,
        }
    }
}

/// A configured participant in a run.
///
/// Built with a fluent builder and shared via `Arc`:
///
/// ```rust
/// use react_agents_rs::{Agent, tool::FunctionTool};
/// use std::sync::Arc;
///
/// let weather = Arc::new(FunctionTool::simple(
///     "get_weather",
///     "Gets the current weather for a location.",
///     |location: String| format!("It is sunny in {}.", location),
/// ));
///
/// let agent = Agent::simple("weather_bot", "You report the weather.")
///     .with_model("gpt-4o-mini")
///     .with_tool(weather);
///
/// assert_eq!(agent.name(), "weather_bot");
/// assert_eq!(agent.tools().len(), 1);
/// ```
#[derive(Clone)]
pub struct Agent {
    pub config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Creates an agent with a name and static instructions; everything else
    /// takes default values.
    pub fn simple(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self::new(AgentConfig {
            name: name.into(),
            instructions: Instructions::Static(instructions.into()),
            ..Default::default()
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.config.tools
    }

    pub fn handoffs(&self) -> &[HandoffSetup] {
        &self.config.handoffs
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    /// Pin this agent to a concrete model instance, bypassing provider
    /// resolution.
    pub fn with_model_instance(mut self, model: Arc<dyn Model>) -> Self {
        self.config.model_override = Some(model);
        self
    }

    pub fn with_model_settings(mut self, settings: ModelSettings) -> Self {
        self.config.model_settings = settings;
        self
    }

    /// Replace static instructions with a per-run resolver.
    pub fn with_dynamic_instructions(mut self, f: Arc<dyn InstructionsFn>) -> Self {
        self.config.instructions = Instructions::Dynamic(f);
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.config.tools.push(tool);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.config.tools.extend(tools);
        self
    }

    pub fn with_handoff(mut self, handoff: impl Into<HandoffSetup>) -> Self {
        self.config.handoffs.push(handoff.into());
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.config.output_schema = Some(schema);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn RunHooks>) -> Self {
        self.config.hooks = Some(hooks);
        self
    }

    pub fn with_layer(mut self, layer: Arc<dyn ErasedToolLayer>) -> Self {
        self.config.agent_layers.push(layer);
        self
    }

    pub fn with_input_guardrail(mut self, guardrail: Arc<dyn InputGuardrail>) -> Self {
        self.config.input_guardrails.push(guardrail);
        self
    }

    pub fn with_output_guardrail(mut self, guardrail: Arc<dyn OutputGuardrail>) -> Self {
        self.config.output_guardrails.push(guardrail);
        self
    }

    pub fn with_reset_tool_choice(mut self, reset: bool) -> Self {
        self.config.reset_tool_choice = reset;
        self
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.config.name)
            .field("model", &self.config.model)
            .field("tools", &self.config.tools.len())
            .field("handoffs", &self.config.handoffs.len())
            .finish()
    }
}
