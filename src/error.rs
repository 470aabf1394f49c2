//! Error types for the agent runtime

use thiserror::Error;

/// Result type alias for the agent runtime
pub type Result<T> = std::result::Result<T, AgentsError>;

/// Main error type for the agent runtime
#[derive(Debug, Error)]
pub enum AgentsError {
    /// Error from the OpenAI API
    #[error("OpenAI API error: {0}")]
    OpenAIError(#[from] async_openai::error::OpenAIError),

    /// Maximum turns exceeded
    #[error("Maximum turns exceeded: {max_turns}")]
    MaxTurnsExceeded { max_turns: usize },

    /// Input guardrail triggered
    #[error("Input guardrail triggered: {message}")]
    InputGuardrailTriggered { message: String },

    /// Output guardrail triggered
    #[error("Output guardrail triggered: {message}")]
    OutputGuardrailTriggered { message: String },

    /// Tool execution error
    #[error("Tool execution error: {message}")]
    ToolExecutionError { message: String },

    /// Handoff error
    #[error("Handoff error: {message}")]
    HandoffError { message: String },

    /// Model behavior error (e.g. a stream that ends without a completed response)
    #[error("Model behavior error: {message}")]
    ModelBehaviorError { message: String },

    /// Caller misconfiguration
    #[error("User error: {message}")]
    UserError { message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl AgentsError {
    /// Shorthand for a model behavior error.
    pub fn model_behavior(message: impl Into<String>) -> Self {
        Self::ModelBehaviorError {
            message: message.into(),
        }
    }

    /// Shorthand for a user error.
    pub fn user(message: impl Into<String>) -> Self {
        Self::UserError {
            message: message.into(),
        }
    }
}
