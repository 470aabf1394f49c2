//! Agent handoffs
//!
//! A handoff lets one agent transfer the conversation to another. Handoffs
//! are advertised to the model as tools named `transfer_to_<agent>`; when the
//! model calls one, the loop swaps the active agent instead of dispatching a
//! tool.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::agent::Agent;
use crate::context::RunContext;
use crate::error::{AgentsError, Result};
use crate::tool::{Tool, ToolResult};

/// A resolved handoff target: the agent to transfer to, plus the name and
/// description shown to the model.
#[derive(Clone)]
pub struct Handoff {
    pub name: String,
    pub description: String,
    pub agent: Arc<Agent>,
}

impl Handoff {
    /// Create a handoff to `agent` with a default description.
    pub fn new(agent: Arc<Agent>) -> Self {
        let name = agent.name().to_string();
        Self {
            description: format!("Transfer the conversation to the {} agent", name),
            name,
            agent,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// The function name advertised to the model for this handoff.
    pub fn tool_name(&self) -> String {
        format!("transfer_to_{}", sanitize_name(&self.name))
    }

    pub fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "Why the conversation is being transferred"
                }
            },
            "required": []
        })
    }
}

impl std::fmt::Debug for Handoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handoff")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

fn sanitize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// How an agent declares a handoff: a bare agent, a pre-built descriptor, or
/// a resolver consulted at each turn.
#[derive(Clone)]
pub enum HandoffSetup {
    Agent(Arc<Agent>),
    Descriptor(Handoff),
    Resolver(Arc<dyn HandoffResolver>),
}

impl From<Arc<Agent>> for HandoffSetup {
    fn from(agent: Arc<Agent>) -> Self {
        HandoffSetup::Agent(agent)
    }
}

impl From<Handoff> for HandoffSetup {
    fn from(handoff: Handoff) -> Self {
        HandoffSetup::Descriptor(handoff)
    }
}

/// Resolves a handoff lazily, once per turn. Returning `None` disables the
/// handoff for that turn.
#[async_trait]
pub trait HandoffResolver: Send + Sync {
    async fn resolve(&self, context: &RunContext) -> Result<Option<Handoff>>;
}

/// Normalize an agent's handoff setups into plain descriptors for one turn.
pub async fn resolve_handoffs(
    setups: &[HandoffSetup],
    context: &RunContext,
) -> Result<Vec<Handoff>> {
    let mut handoffs = Vec::with_capacity(setups.len());
    for setup in setups {
        match setup {
            HandoffSetup::Agent(agent) => handoffs.push(Handoff::new(agent.clone())),
            HandoffSetup::Descriptor(handoff) => handoffs.push(handoff.clone()),
            HandoffSetup::Resolver(resolver) => {
                if let Some(handoff) = resolver.resolve(context).await? {
                    handoffs.push(handoff);
                }
            }
        }
    }
    Ok(handoffs)
}

/// Adapter exposing a handoff as a model-visible tool. The loop intercepts
/// handoff calls before tool dispatch, so `execute` is never reached in a
/// well-formed run.
pub struct HandoffTool {
    tool_name: String,
    handoff: Handoff,
}

impl HandoffTool {
    pub fn new(handoff: Handoff) -> Self {
        Self {
            tool_name: handoff.tool_name(),
            handoff,
        }
    }
}

impl std::fmt::Debug for HandoffTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffTool")
            .field("tool_name", &self.tool_name)
            .finish()
    }
}

#[async_trait]
impl Tool for HandoffTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        &self.handoff.description
    }

    fn parameters_schema(&self) -> Value {
        self.handoff.parameters_schema()
    }

    async fn execute(&self, _arguments: Value) -> Result<ToolResult> {
        Err(AgentsError::HandoffError {
            message: format!("handoff '{}' invoked as a plain tool", self.handoff.name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_name_sanitization() {
        let agent = Arc::new(Agent::simple("Billing Agent", "Handle billing"));
        let handoff = Handoff::new(agent);
        assert_eq!(handoff.tool_name(), "transfer_to_billing_agent");
    }

    #[tokio::test]
    async fn test_resolve_handoffs_mixes_setups() {
        struct SometimesResolver {
            enabled: bool,
        }

        #[async_trait]
        impl HandoffResolver for SometimesResolver {
            async fn resolve(&self, _context: &RunContext) -> Result<Option<Handoff>> {
                if self.enabled {
                    Ok(Some(Handoff::new(Arc::new(Agent::simple(
                        "escalation",
                        "Handle escalations",
                    )))))
                } else {
                    Ok(None)
                }
            }
        }

        let setups = vec![
            HandoffSetup::Agent(Arc::new(Agent::simple("billing", "Billing"))),
            HandoffSetup::Resolver(Arc::new(SometimesResolver { enabled: false })),
            HandoffSetup::Resolver(Arc::new(SometimesResolver { enabled: true })),
        ];

        let context = RunContext::new();
        let handoffs = resolve_handoffs(&setups, &context).await.unwrap();
        assert_eq!(handoffs.len(), 2);
        assert_eq!(handoffs[0].name, "billing");
        assert_eq!(handoffs[1].name, "escalation");
    }

    #[tokio::test]
    async fn test_handoff_tool_rejects_direct_execution() {
        let handoff = Handoff::new(Arc::new(Agent::simple("billing", "Billing")));
        let tool = HandoffTool::new(handoff);
        let err = tool.execute(json!({})).await.unwrap_err();
        assert!(matches!(err, AgentsError::HandoffError { .. }));
    }
}
