//! Items representing conversation messages, tool calls, and model responses
//!
//! This module defines the data structures that flow through the run loop:
//! the wire-level [`Message`] representation sent to the model, the
//! aggregated [`ModelResponse`] produced by a completed model stream, and the
//! [`RunItem`]s generated turn by turn and persisted to sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::usage::Usage;

/// Role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: Some(tool_calls),
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            name: None,
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}

/// A tool call made by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// The aggregated response from one completed model stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    /// The provider-assigned response id.
    pub id: String,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    /// Token usage for this response.
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
}

impl ModelResponse {
    pub fn new_message(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: Some(content.into()),
            tool_calls: vec![],
            usage: Usage::empty(),
            created_at: Utc::now(),
        }
    }

    pub fn new_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: None,
            tool_calls,
            usage: Usage::empty(),
            created_at: Utc::now(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn has_content(&self) -> bool {
        self.content.as_deref().map(|c| !c.is_empty()).unwrap_or(false)
    }
}

/// The input that starts a run: either a plain user message or a prepared
/// list of conversation messages.
#[derive(Debug, Clone)]
pub enum RunInput {
    Text(String),
    Items(Vec<Message>),
}

impl RunInput {
    /// Normalize the input into a message list. A plain string becomes a
    /// single user message.
    pub fn to_messages(&self) -> Vec<Message> {
        match self {
            RunInput::Text(text) => vec![Message::user(text.clone())],
            RunInput::Items(items) => items.clone(),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, RunInput::Text(_))
    }
}

impl From<&str> for RunInput {
    fn from(s: &str) -> Self {
        RunInput::Text(s.to_string())
    }
}

impl From<String> for RunInput {
    fn from(s: String) -> Self {
        RunInput::Text(s)
    }
}

impl From<Vec<Message>> for RunInput {
    fn from(items: Vec<Message>) -> Self {
        RunInput::Items(items)
    }
}

/// A run item representing a single step in the agent execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunItem {
    Message(MessageItem),
    ToolCall(ToolCallItem),
    ToolOutput(ToolOutputItem),
    Handoff(HandoffItem),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageItem {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallItem {
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutputItem {
    pub id: String,
    pub tool_call_id: String,
    pub output: Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffItem {
    pub id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RunItem {
    pub fn message(role: Role, content: impl Into<String>) -> Self {
        RunItem::Message(MessageItem {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        })
    }
}

/// Helper functions for working with items
pub struct ItemHelpers;

impl ItemHelpers {
    /// Convert run items to messages for the conversation history.
    ///
    /// Consecutive tool call items are folded into a single assistant
    /// message so the transcript replays the way the model produced it:
    /// one assistant turn carrying the calls, followed by tool outputs.
    pub fn to_messages(items: &[RunItem]) -> Vec<Message> {
        let mut messages = Vec::new();
        let mut pending_calls: Vec<ToolCall> = Vec::new();

        for item in items {
            if !matches!(item, RunItem::ToolCall(_)) && !pending_calls.is_empty() {
                messages.push(Message::assistant_with_tool_calls(
                    "",
                    std::mem::take(&mut pending_calls),
                ));
            }
            match item {
                RunItem::Message(msg) => {
                    messages.push(Message {
                        role: msg.role,
                        content: msg.content.clone(),
                        name: None,
                        tool_call_id: None,
                        tool_calls: None,
                    });
                }
                RunItem::ToolCall(call) => {
                    pending_calls.push(ToolCall {
                        id: call.id.clone(),
                        name: call.tool_name.clone(),
                        arguments: call.arguments.clone(),
                    });
                }
                RunItem::ToolOutput(output) => {
                    let content = if let Some(error) = &output.error {
                        format!("Error: {}", error)
                    } else {
                        output.output.to_string()
                    };
                    messages.push(Message::tool(content, &output.tool_call_id));
                }
                RunItem::Handoff(_) => {}
            }
        }
        if !pending_calls.is_empty() {
            messages.push(Message::assistant_with_tool_calls("", pending_calls));
        }

        messages
    }

    /// Convert raw conversation messages into run items for persistence.
    pub fn items_from_messages(messages: &[Message]) -> Vec<RunItem> {
        messages
            .iter()
            .map(|m| match m.role {
                Role::Tool => RunItem::ToolOutput(ToolOutputItem {
                    id: Uuid::new_v4().to_string(),
                    tool_call_id: m.tool_call_id.clone().unwrap_or_default(),
                    output: Value::String(m.content.clone()),
                    error: None,
                    created_at: Utc::now(),
                }),
                role => RunItem::message(role, m.content.clone()),
            })
            .collect()
    }
}
