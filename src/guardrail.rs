//! Input and output guardrails.
//!
//! Guardrails validate run input before the first turn and the final output
//! after the last one. They run in descending priority order; the first
//! failing guardrail aborts the run with a triggered error. Passing results
//! are recorded on the streaming handle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{AgentsError, Result};

/// Outcome of one guardrail check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub passed: bool,
    pub reason: Option<String>,
}

impl GuardrailResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// A guardrail outcome paired with the guardrail that produced it, as
/// recorded on the run result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailRecord {
    pub guardrail_name: String,
    pub result: GuardrailResult,
}

/// Validates run input before the first model call.
#[async_trait]
pub trait InputGuardrail: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32 {
        0
    }
    async fn check(&self, input: &str) -> Result<GuardrailResult>;
}

/// Validates the final output before the run completes.
#[async_trait]
pub trait OutputGuardrail: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32 {
        0
    }
    async fn check(&self, output: &str) -> Result<GuardrailResult>;
}

/// Executes guardrails in descending priority order.
pub struct GuardrailRunner;

impl GuardrailRunner {
    pub async fn check_input(
        guards: &[Arc<dyn InputGuardrail>],
        input: &str,
    ) -> Result<Vec<GuardrailRecord>> {
        let mut guards = guards.to_vec();
        guards.sort_by_key(|g| -g.priority());
        let mut records = Vec::with_capacity(guards.len());
        for g in guards {
            let result = g.check(input).await?;
            if !result.passed {
                return Err(AgentsError::InputGuardrailTriggered {
                    message: result.reason.unwrap_or_else(|| g.name().to_string()),
                });
            }
            records.push(GuardrailRecord {
                guardrail_name: g.name().to_string(),
                result,
            });
        }
        Ok(records)
    }

    pub async fn check_output(
        guards: &[Arc<dyn OutputGuardrail>],
        output: &str,
    ) -> Result<Vec<GuardrailRecord>> {
        let mut guards = guards.to_vec();
        guards.sort_by_key(|g| -g.priority());
        let mut records = Vec::with_capacity(guards.len());
        for g in guards {
            let result = g.check(output).await?;
            if !result.passed {
                return Err(AgentsError::OutputGuardrailTriggered {
                    message: result.reason.unwrap_or_else(|| g.name().to_string()),
                });
            }
            records.push(GuardrailRecord {
                guardrail_name: g.name().to_string(),
                result,
            });
        }
        Ok(records)
    }
}

/// Rejects input longer than a fixed number of characters.
#[derive(Debug, Clone)]
pub struct MaxLengthGuardrail {
    name: String,
    max_length: usize,
}

impl MaxLengthGuardrail {
    pub fn new(max_length: usize) -> Self {
        Self {
            name: format!("max_length_{}", max_length),
            max_length,
        }
    }
}

#[async_trait]
impl InputGuardrail for MaxLengthGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, input: &str) -> Result<GuardrailResult> {
        if input.len() > self.max_length {
            Ok(GuardrailResult::fail(format!(
                "input exceeds maximum length of {} characters",
                self.max_length
            )))
        } else {
            Ok(GuardrailResult::pass())
        }
    }
}

/// Blocks input or output containing any of a set of case-insensitive
/// patterns.
#[derive(Debug, Clone)]
pub struct BlocklistGuardrail {
    name: String,
    patterns: Vec<String>,
}

impl BlocklistGuardrail {
    pub fn new(name: impl Into<String>, patterns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            patterns,
        }
    }

    fn matches(&self, text: &str) -> Option<&str> {
        let lower = text.to_lowercase();
        self.patterns
            .iter()
            .find(|p| lower.contains(&p.to_lowercase()))
            .map(String::as_str)
    }
}

#[async_trait]
impl InputGuardrail for BlocklistGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, input: &str) -> Result<GuardrailResult> {
        match self.matches(input) {
            Some(pattern) => Ok(GuardrailResult::fail(format!(
                "input contains blocked pattern: {}",
                pattern
            ))),
            None => Ok(GuardrailResult::pass()),
        }
    }
}

#[async_trait]
impl OutputGuardrail for BlocklistGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, output: &str) -> Result<GuardrailResult> {
        match self.matches(output) {
            Some(pattern) => Ok(GuardrailResult::fail(format!(
                "output contains blocked pattern: {}",
                pattern
            ))),
            None => Ok(GuardrailResult::pass()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_max_length_guardrail() {
        let guard = MaxLengthGuardrail::new(10);
        assert!(guard.check("short").await.unwrap().passed);

        let long = guard.check("this is a very long input").await.unwrap();
        assert!(!long.passed);
        assert!(long.reason.unwrap().contains("maximum length"));
    }

    #[tokio::test]
    async fn test_blocklist_case_insensitive() {
        let guard = BlocklistGuardrail::new("filter", vec!["forbidden".to_string()]);
        let blocked = InputGuardrail::check(&guard, "some FORBIDDEN content")
            .await
            .unwrap();
        assert!(!blocked.passed);
    }

    #[tokio::test]
    async fn test_runner_records_passing_results() {
        let guards: Vec<Arc<dyn InputGuardrail>> = vec![
            Arc::new(MaxLengthGuardrail::new(100)),
            Arc::new(BlocklistGuardrail::new("filter", vec!["spam".to_string()])),
        ];

        let records = GuardrailRunner::check_input(&guards, "valid input")
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.result.passed));

        let err = GuardrailRunner::check_input(&guards, "this is spam")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentsError::InputGuardrailTriggered { .. }));
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        #[derive(Debug)]
        struct AlwaysFail {
            name: String,
            priority: i32,
        }

        #[async_trait]
        impl InputGuardrail for AlwaysFail {
            fn name(&self) -> &str {
                &self.name
            }
            fn priority(&self) -> i32 {
                self.priority
            }
            async fn check(&self, _: &str) -> Result<GuardrailResult> {
                Ok(GuardrailResult::fail(self.name.clone()))
            }
        }

        let guards: Vec<Arc<dyn InputGuardrail>> = vec![
            Arc::new(AlwaysFail {
                name: "low".to_string(),
                priority: 1,
            }),
            Arc::new(AlwaysFail {
                name: "high".to_string(),
                priority: 10,
            }),
        ];

        match GuardrailRunner::check_input(&guards, "test").await {
            Err(AgentsError::InputGuardrailTriggered { message }) => assert_eq!(message, "high"),
            other => panic!("expected input guardrail error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_output_guardrail() {
        let guards: Vec<Arc<dyn OutputGuardrail>> = vec![Arc::new(BlocklistGuardrail::new(
            "filter",
            vec!["secret".to_string()],
        ))];

        assert!(GuardrailRunner::check_output(&guards, "normal output")
            .await
            .is_ok());
        assert!(GuardrailRunner::check_output(&guards, "a secret value")
            .await
            .is_err());
    }
}
