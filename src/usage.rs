//! # Usage Tracking for Token Consumption
//!
//! Tracks token usage of model calls across an agent run. The run loop adds
//! one [`Usage`] per completed model response into the run context; callers
//! can aggregate per-model and per-agent breakdowns with [`UsageStats`].
//!
//! ### Example: Tracking and Summarizing Usage
//!
//! ```rust
//! use react_agents_rs::usage::{Usage, UsageStats};
//!
//! let mut stats = UsageStats::new();
//! stats.record("gpt-4o", "Researcher", Usage::new(1200, 300));
//! stats.record("gpt-4o-mini", "Summarizer", Usage::new(500, 150));
//!
//! assert_eq!(stats.total.total_tokens, 2150);
//! assert_eq!(stats.total.request_count, 2);
//! ```

use serde::{Deserialize, Serialize};
use std::ops::Add;

/// Represents the token usage for a single model call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    /// The number of tokens in the input prompt.
    pub prompt_tokens: usize,

    /// The number of tokens in the generated completion.
    pub completion_tokens: usize,

    /// The total number of tokens (prompt + completion).
    pub total_tokens: usize,

    /// The number of API requests made. Typically 1 for a single `Usage`.
    pub request_count: usize,
}

impl Usage {
    /// Creates a new `Usage` instance from the prompt and completion token counts.
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            request_count: 1,
        }
    }

    /// Creates an empty `Usage` instance with all fields set to zero.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Adds the values from another `Usage` instance to this one.
    pub fn add_usage(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.request_count += other.request_count;
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens + other.prompt_tokens,
            completion_tokens: self.completion_tokens + other.completion_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
            request_count: self.request_count + other.request_count,
        }
    }
}

/// Aggregates `Usage` information across an entire agent run.
///
/// `UsageStats` provides an overview of token consumption, with breakdowns by
/// model and by agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    /// The total usage across all models and agents.
    pub total: Usage,

    /// A map of usage statistics broken down by model name.
    pub by_model: std::collections::HashMap<String, Usage>,

    /// A map of usage statistics broken down by agent name.
    pub by_agent: std::collections::HashMap<String, Usage>,
}

impl UsageStats {
    /// Creates a new, empty `UsageStats` instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new `Usage` instance, updating the total and the breakdowns.
    pub fn record(&mut self, model: &str, agent: &str, usage: Usage) {
        self.total.add_usage(&usage);

        self.by_model
            .entry(model.to_string())
            .and_modify(|u| u.add_usage(&usage))
            .or_insert_with(|| usage.clone());

        self.by_agent
            .entry(agent.to_string())
            .and_modify(|u| u.add_usage(&usage))
            .or_insert(usage);
    }
}
