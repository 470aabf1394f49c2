//! Tower-based tool execution.
//!
//! Every tool call is routed through a boxed Tower service stack: the base
//! service adapts a `dyn Tool`, a lenient schema check wraps it, and run- or
//! agent-scoped layers compose around the outside.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep, timeout};
use tower::{service_fn, util::BoxService, BoxError, Layer, Service};

use crate::tool::{Tool, ToolResult};

/// Control surface for layers and services to steer the run.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Normal tool output; the loop continues.
    Continue,
    /// Replace the tool output with this value.
    Rewrite(Value),
    /// End the run with this value as the final output.
    Final(Value),
}

/// Request passed into the tool service stack.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub run_id: String,
    pub agent: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// Response from the tool service stack.
#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub output: Value,
    pub error: Option<String>,
    pub effect: Effect,
}

impl ToolResponse {
    pub fn success(output: Value) -> Self {
        Self {
            output,
            error: None,
            effect: Effect::Continue,
        }
    }

    pub fn error(msg: String) -> Self {
        Self {
            output: Value::Null,
            error: Some(msg),
            effect: Effect::Continue,
        }
    }
}

/// Base executor adapting `dyn Tool` to a Tower service. Tool failures are
/// folded into error responses rather than service errors so the loop can
/// surface them to the model.
#[derive(Clone)]
pub struct BaseToolService {
    tool: Arc<dyn Tool>,
}

impl BaseToolService {
    pub fn new(tool: Arc<dyn Tool>) -> Self {
        Self { tool }
    }
}

impl Service<ToolRequest> for BaseToolService {
    type Response = ToolResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ToolRequest) -> Self::Future {
        let tool = self.tool.clone();
        Box::pin(async move {
            match tool.execute(req.arguments.clone()).await {
                Ok(ToolResult {
                    output,
                    is_final,
                    error,
                }) => {
                    if let Some(err) = error {
                        Ok(ToolResponse::error(err))
                    } else if is_final {
                        Ok(ToolResponse {
                            output: output.clone(),
                            error: None,
                            effect: Effect::Final(output),
                        })
                    } else {
                        Ok(ToolResponse::success(output))
                    }
                }
                Err(e) => Ok(ToolResponse::error(e.to_string())),
            }
        })
    }
}

/// Boxed service type the runner composes dynamic layers over.
pub type ToolBoxService = BoxService<ToolRequest, ToolResponse, BoxError>;

/// Object-safe layer over a boxed tool service. Run- and agent-scoped layers
/// implement this so agents can carry heterogeneous layer lists.
pub trait ErasedToolLayer: Send + Sync {
    fn layer_boxed(&self, inner: ToolBoxService) -> ToolBoxService;
}

/// Build the default stack for one tool: base executor plus lenient schema
/// validation against the tool's declared parameters.
pub fn build_tool_stack(tool: Arc<dyn Tool>) -> ToolBoxService {
    let schema = tool.parameters_schema();
    let base = BaseToolService::new(tool);
    BoxService::new(InputSchemaLayer::lenient(schema).layer(base))
}

/// Wrap `stack` with each layer in order; the last layer ends up outermost.
pub fn apply_layers(mut stack: ToolBoxService, layers: &[Arc<dyn ErasedToolLayer>]) -> ToolBoxService {
    for layer in layers {
        stack = layer.layer_boxed(stack);
    }
    stack
}

/// Validates tool arguments against the declared JSON schema. Lenient mode
/// logs nothing and lets mismatches through; strict mode turns them into
/// error responses.
#[derive(Clone, Debug)]
pub struct InputSchemaLayer {
    schema: Value,
    strict: bool,
}

impl InputSchemaLayer {
    pub fn strict(schema: Value) -> Self {
        Self {
            schema,
            strict: true,
        }
    }

    pub fn lenient(schema: Value) -> Self {
        Self {
            schema,
            strict: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct InputSchemaService<S> {
    inner: S,
    schema: Value,
    strict: bool,
}

impl<S> Layer<S> for InputSchemaLayer {
    type Service = InputSchemaService<S>;
    fn layer(&self, inner: S) -> Self::Service {
        InputSchemaService {
            inner,
            schema: self.schema.clone(),
            strict: self.strict,
        }
    }
}

impl<S> Service<ToolRequest> for InputSchemaService<S>
where
    S: Service<ToolRequest, Response = ToolResponse, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ToolResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ToolRequest) -> Self::Future {
        let mut inner = self.inner.clone();
        let schema = self.schema.clone();
        let strict = self.strict;
        Box::pin(async move {
            if !schema.is_null() {
                if let Err(msg) = validate_required_fields(&schema, &req.arguments) {
                    if strict {
                        return Ok(ToolResponse::error(format!(
                            "schema validation failed: {}",
                            msg
                        )));
                    }
                }
            }
            inner.call(req).await
        })
    }
}

fn validate_required_fields(schema: &Value, args: &Value) -> Result<(), String> {
    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for field in required {
            if let Some(name) = field.as_str() {
                if args.get(name).is_none() {
                    return Err(format!("missing required field: {}", name));
                }
            }
        }
    }
    Ok(())
}

/// Times out tool execution at any scope.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutLayer {
    duration: Duration,
}

impl TimeoutLayer {
    pub fn secs(secs: u64) -> Self {
        Self {
            duration: Duration::from_secs(secs),
        }
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self { duration }
    }
}

#[derive(Clone, Debug)]
pub struct TimeoutService<S> {
    inner: S,
    duration: Duration,
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;
    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            duration: self.duration,
        }
    }
}

impl<S> Service<ToolRequest> for TimeoutService<S>
where
    S: Service<ToolRequest, Response = ToolResponse, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ToolResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ToolRequest) -> Self::Future {
        let mut inner = self.inner.clone();
        let d = self.duration;
        Box::pin(async move {
            match timeout(d, inner.call(req)).await {
                Ok(res) => res,
                Err(_elapsed) => Ok(ToolResponse::error("timeout".to_string())),
            }
        })
    }
}

/// Timeout layer in erased form, attachable to agents and runs.
#[derive(Clone, Copy, Debug)]
pub struct BoxedTimeoutLayer(pub TimeoutLayer);

impl ErasedToolLayer for BoxedTimeoutLayer {
    fn layer_boxed(&self, inner: ToolBoxService) -> ToolBoxService {
        let d = self.0.duration;
        let shared = Arc::new(tokio::sync::Mutex::new(inner));
        let svc = service_fn(move |req: ToolRequest| {
            let shared = shared.clone();
            async move {
                let mut inner = shared.lock().await;
                match timeout(d, inner.call(req)).await {
                    Ok(res) => res,
                    Err(_elapsed) => Ok(ToolResponse::error("timeout".to_string())),
                }
            }
        });
        BoxService::new(svc)
    }
}

/// Retry layer in erased form: retries on error responses and service errors.
#[derive(Clone, Copy, Debug)]
pub struct BoxedRetryLayer {
    attempts: usize,
    delay: Option<Duration>,
}

impl BoxedRetryLayer {
    pub fn times(attempts: usize) -> Self {
        Self {
            attempts: attempts.max(1),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl ErasedToolLayer for BoxedRetryLayer {
    fn layer_boxed(&self, inner: ToolBoxService) -> ToolBoxService {
        let attempts = self.attempts;
        let delay = self.delay;
        let shared = Arc::new(tokio::sync::Mutex::new(inner));
        let svc = service_fn(move |req: ToolRequest| {
            let shared = shared.clone();
            async move {
                let mut last_resp: Option<ToolResponse> = None;
                let mut last_err: Option<BoxError> = None;
                for i in 0..attempts {
                    let mut inner = shared.lock().await;
                    match inner.call(req.clone()).await {
                        Ok(resp) => {
                            if resp.error.is_none() {
                                return Ok(resp);
                            }
                            last_resp = Some(resp);
                        }
                        Err(e) => last_err = Some(e),
                    }
                    drop(inner);
                    if i + 1 < attempts {
                        if let Some(d) = delay {
                            sleep(d).await;
                        }
                    }
                }
                if let Some(resp) = last_resp {
                    Ok(resp)
                } else if let Some(e) = last_err {
                    Err(e)
                } else {
                    Ok(ToolResponse::error("retry exhausted".to_string()))
                }
            }
        });
        BoxService::new(svc)
    }
}

// Convenience constructors for erased layers.
pub fn boxed_timeout_secs(secs: u64) -> Arc<dyn ErasedToolLayer> {
    Arc::new(BoxedTimeoutLayer(TimeoutLayer::secs(secs)))
}

pub fn boxed_retry_times(attempts: usize) -> Arc<dyn ErasedToolLayer> {
    Arc::new(BoxedRetryLayer::times(attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::FunctionTool;
    use tower::ServiceExt;

    fn request(tool_name: &str, arguments: Value) -> ToolRequest {
        ToolRequest {
            run_id: "run".into(),
            agent: "agent".into(),
            tool_call_id: "call_1".into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }

    #[tokio::test]
    async fn base_tool_service_executes() {
        let tool = Arc::new(FunctionTool::simple("uppercase", "Upper", |s: String| {
            s.to_uppercase()
        }));
        let stack = build_tool_stack(tool);

        let resp = stack
            .oneshot(request("uppercase", serde_json::json!({"input": "abc"})))
            .await
            .unwrap();
        assert!(resp.error.is_none());
        assert_eq!(resp.output, serde_json::json!("ABC"));
        assert!(matches!(resp.effect, Effect::Continue));
    }

    #[tokio::test]
    async fn tool_error_becomes_error_response() {
        let tool = Arc::new(FunctionTool::new(
            "boom".to_string(),
            "Always fails".to_string(),
            serde_json::json!({"type": "object"}),
            |_args| {
                Err(crate::error::AgentsError::ToolExecutionError {
                    message: "boom".into(),
                })
            },
        ));
        let stack = build_tool_stack(tool);
        let resp = stack.oneshot(request("boom", Value::Null)).await.unwrap();
        assert!(resp.error.is_some());
    }

    #[tokio::test]
    async fn final_tool_produces_final_effect() {
        #[derive(Debug)]
        struct Finish;

        #[async_trait::async_trait]
        impl crate::tool::Tool for Finish {
            fn name(&self) -> &str {
                "finish"
            }
            fn description(&self) -> &str {
                "Finishes the run"
            }
            fn parameters_schema(&self) -> Value {
                serde_json::json!({"type": "object"})
            }
            async fn execute(&self, _arguments: Value) -> crate::error::Result<crate::tool::ToolResult>
            {
                Ok(crate::tool::ToolResult::final_output(serde_json::json!(
                    "done"
                )))
            }
        }

        let base = BaseToolService::new(Arc::new(Finish));
        let resp = base
            .oneshot(request("finish", serde_json::json!({})))
            .await
            .unwrap();
        assert!(matches!(resp.effect, Effect::Final(_)));
    }

    #[tokio::test]
    async fn timeout_layer_times_out() {
        #[derive(Debug)]
        struct Slow;

        #[async_trait::async_trait]
        impl crate::tool::Tool for Slow {
            fn name(&self) -> &str {
                "slow"
            }
            fn description(&self) -> &str {
                "Sleeps past the deadline"
            }
            fn parameters_schema(&self) -> Value {
                serde_json::json!({"type": "object"})
            }
            async fn execute(&self, _arguments: Value) -> crate::error::Result<crate::tool::ToolResult>
            {
                sleep(Duration::from_millis(100)).await;
                Ok(crate::tool::ToolResult::success(Value::String(
                    "done".into(),
                )))
            }
        }

        let base = BaseToolService::new(Arc::new(Slow));
        let svc = TimeoutLayer::from_duration(Duration::from_millis(50)).layer(base);
        let resp = svc.oneshot(request("slow", Value::Null)).await.unwrap();
        assert_eq!(resp.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn strict_schema_rejects_missing_required() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"input": {"type": "string"}},
            "required": ["input"]
        });
        let tool = Arc::new(FunctionTool::new(
            "echo".to_string(),
            "Echo".to_string(),
            schema.clone(),
            |args| Ok(args.get("input").cloned().unwrap_or(Value::Null)),
        ));
        let base = BaseToolService::new(tool);
        let svc = InputSchemaLayer::strict(schema).layer(base);
        let resp = svc
            .oneshot(request("echo", serde_json::json!({})))
            .await
            .unwrap();
        assert!(resp.error.is_some());
    }

    #[tokio::test]
    async fn retry_layer_succeeds_after_failure() {
        use std::sync::atomic::{AtomicBool, Ordering};
        static FIRST_FAIL: AtomicBool = AtomicBool::new(true);

        let tool = Arc::new(FunctionTool::new(
            "flaky".to_string(),
            "Flaky".to_string(),
            serde_json::json!({"type": "object"}),
            |_args| {
                if FIRST_FAIL.swap(false, Ordering::SeqCst) {
                    Err(crate::error::AgentsError::ToolExecutionError {
                        message: "boom".into(),
                    })
                } else {
                    Ok(Value::String("ok".into()))
                }
            },
        ));
        let stack = build_tool_stack(tool);
        let stack = apply_layers(stack, &[boxed_retry_times(2)]);
        let resp = stack.oneshot(request("flaky", Value::Null)).await.unwrap();
        assert!(resp.error.is_none());
        assert_eq!(resp.output, Value::String("ok".into()));
    }
}
