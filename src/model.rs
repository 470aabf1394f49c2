//! Model abstraction for streaming LLM interactions
//!
//! The run loop consumes models through the [`Model`] trait: one call to
//! [`Model::stream_response`] yields an asynchronous sequence of
//! [`ResponseEvent`]s terminated by a single `Completed` event carrying the
//! aggregated response. [`OpenAIModel`] adapts the async-openai streaming
//! chat API to this interface; [`ScriptedModel`] yields canned responses for
//! tests and demos.

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionNamedToolChoice, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionStreamOptions, ChatCompletionTool, ChatCompletionToolArgs,
        ChatCompletionToolChoiceOption, ChatCompletionToolType, CreateChatCompletionRequestArgs,
        FunctionName, FunctionObjectArgs,
    },
    Client,
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

use crate::error::{AgentsError, Result};
use crate::items::{Message, ModelResponse, Role, ToolCall};
use crate::tool::Tool;
use crate::usage::Usage;

/// Incremental events produced while a model response streams in.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A fragment of assistant text.
    OutputTextDelta { delta: String },
    /// A fragment of a tool call under construction.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: String,
    },
    /// Terminal event: the full aggregated response, including usage.
    Completed { response: ModelResponse },
}

/// A boxed stream of response events.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<ResponseEvent>> + Send>>;

/// Constrains which tool (if any) the model must call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Named(String),
}

/// Per-call model settings. Agent-level settings are merged with run-level
/// overrides via [`ModelSettings::resolve`].
#[derive(Debug, Clone, Default)]
pub struct ModelSettings {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tool_choice: Option<ToolChoice>,
}

impl ModelSettings {
    /// Merge `overrides` on top of these settings; fields set in the override
    /// win.
    pub fn resolve(&self, overrides: &ModelSettings) -> ModelSettings {
        ModelSettings {
            temperature: overrides.temperature.or(self.temperature),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            tool_choice: overrides.tool_choice.clone().or_else(|| self.tool_choice.clone()),
        }
    }
}

/// One fully-resolved request to a model.
pub struct ModelRequest {
    pub instructions: Option<String>,
    pub input: Vec<Message>,
    pub settings: ModelSettings,
    pub tools: Vec<Arc<dyn Tool>>,
    pub output_schema: Option<Value>,
}

/// Trait for streaming model implementations.
#[async_trait]
pub trait Model: Send + Sync {
    /// The model name, for logging and usage attribution.
    fn name(&self) -> &str;

    /// Start one model call, returning a stream of incremental events
    /// terminated by [`ResponseEvent::Completed`].
    async fn stream_response(&self, request: ModelRequest) -> Result<ResponseStream>;
}

/// Resolves model names into model instances.
pub trait ModelProvider: Send + Sync {
    fn get_model(&self, name: &str) -> Arc<dyn Model>;
}

/// OpenAI model provider backed by a shared async-openai client.
pub struct OpenAIProvider {
    client: Client<OpenAIConfig>,
}

impl OpenAIProvider {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client<OpenAIConfig>) -> Self {
        Self { client }
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelProvider for OpenAIProvider {
    fn get_model(&self, name: &str) -> Arc<dyn Model> {
        Arc::new(OpenAIModel::with_client(self.client.clone(), name))
    }
}

/// Streaming OpenAI chat model using async-openai.
pub struct OpenAIModel {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAIModel {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            model: model.into(),
        }
    }

    pub fn with_client(client: Client<OpenAIConfig>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    fn convert_message(msg: &Message) -> ChatCompletionRequestMessage {
        match msg.role {
            Role::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(msg.content.clone())
                .build()
                .expect("system message")
                .into(),
            Role::User => ChatCompletionRequestUserMessageArgs::default()
                .content(msg.content.clone())
                .build()
                .expect("user message")
                .into(),
            Role::Assistant => {
                let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
                builder.content(msg.content.clone());
                if let Some(tool_calls) = &msg.tool_calls {
                    let calls: Vec<_> = tool_calls
                        .iter()
                        .map(|tc| async_openai::types::ChatCompletionMessageToolCall {
                            id: tc.id.clone(),
                            r#type: ChatCompletionToolType::Function,
                            function: async_openai::types::FunctionCall {
                                name: tc.name.clone(),
                                arguments: tc.arguments.to_string(),
                            },
                        })
                        .collect();
                    builder.tool_calls(calls);
                }
                builder.build().expect("assistant message").into()
            }
            Role::Tool => ChatCompletionRequestToolMessageArgs::default()
                .content(msg.content.clone())
                .tool_call_id(msg.tool_call_id.clone().unwrap_or_default())
                .build()
                .expect("tool message")
                .into(),
        }
    }

    fn convert_tools(tools: &[Arc<dyn Tool>]) -> Vec<ChatCompletionTool> {
        tools
            .iter()
            .map(|tool| {
                ChatCompletionToolArgs::default()
                    .r#type(ChatCompletionToolType::Function)
                    .function(
                        FunctionObjectArgs::default()
                            .name(tool.name())
                            .description(tool.description())
                            .parameters(tool.parameters_schema())
                            .build()
                            .expect("function object"),
                    )
                    .build()
                    .expect("tool")
            })
            .collect()
    }

    fn convert_tool_choice(choice: &ToolChoice) -> ChatCompletionToolChoiceOption {
        match choice {
            ToolChoice::Auto => ChatCompletionToolChoiceOption::Auto,
            ToolChoice::None => ChatCompletionToolChoiceOption::None,
            ToolChoice::Required => ChatCompletionToolChoiceOption::Required,
            ToolChoice::Named(name) => {
                ChatCompletionToolChoiceOption::Named(ChatCompletionNamedToolChoice {
                    r#type: ChatCompletionToolType::Function,
                    function: FunctionName { name: name.clone() },
                })
            }
        }
    }
}

#[async_trait]
impl Model for OpenAIModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn stream_response(&self, request: ModelRequest) -> Result<ResponseStream> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::new();
        if let Some(instructions) = &request.instructions {
            messages.push(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(instructions.clone())
                    .build()
                    .expect("system message")
                    .into(),
            );
        }
        messages.extend(request.input.iter().map(Self::convert_message));

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(messages)
            .stream(true)
            .stream_options(ChatCompletionStreamOptions {
                include_usage: true,
            });

        if !request.tools.is_empty() {
            args.tools(Self::convert_tools(&request.tools));
        }
        if let Some(choice) = &request.settings.tool_choice {
            args.tool_choice(Self::convert_tool_choice(choice));
        }
        if let Some(temp) = request.settings.temperature {
            args.temperature(temp);
        }
        if let Some(max) = request.settings.max_tokens {
            args.max_tokens(max);
        }

        let mut sse = self.client.chat().create_stream(args.build()?).await?;

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<ResponseEvent>>();
        let model = self.model.clone();
        tokio::spawn(async move {
            let mut response_id = String::new();
            let mut content = String::new();
            let mut usage = Usage::empty();
            // tool call fragments keyed by stream index
            let mut calls: BTreeMap<usize, (String, String, String)> = BTreeMap::new();

            while let Some(chunk) = sse.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(AgentsError::OpenAIError(e)));
                        return;
                    }
                };

                if response_id.is_empty() {
                    response_id = chunk.id.clone();
                }
                if let Some(u) = &chunk.usage {
                    usage = Usage::new(u.prompt_tokens as usize, u.completion_tokens as usize);
                }

                for choice in &chunk.choices {
                    if let Some(delta) = &choice.delta.content {
                        if !delta.is_empty() {
                            content.push_str(delta);
                            let _ = tx.send(Ok(ResponseEvent::OutputTextDelta {
                                delta: delta.clone(),
                            }));
                        }
                    }
                    if let Some(tool_calls) = &choice.delta.tool_calls {
                        for tc in tool_calls {
                            let index = tc.index as usize;
                            let entry = calls.entry(index).or_default();
                            if let Some(id) = &tc.id {
                                entry.0 = id.clone();
                            }
                            let mut args_delta = String::new();
                            if let Some(f) = &tc.function {
                                if let Some(name) = &f.name {
                                    entry.1.push_str(name);
                                }
                                if let Some(arguments) = &f.arguments {
                                    entry.2.push_str(arguments);
                                    args_delta = arguments.clone();
                                }
                            }
                            let _ = tx.send(Ok(ResponseEvent::ToolCallDelta {
                                index,
                                id: tc.id.clone(),
                                name: tc.function.as_ref().and_then(|f| f.name.clone()),
                                arguments_delta: args_delta,
                            }));
                        }
                    }
                }
            }

            let tool_calls: Vec<ToolCall> = calls
                .into_values()
                .map(|(id, name, arguments)| ToolCall {
                    id,
                    name,
                    arguments: serde_json::from_str(&arguments).unwrap_or(Value::Null),
                })
                .collect();

            debug!(model = %model, tool_calls = tool_calls.len(), "model stream completed");

            let response = ModelResponse {
                id: response_id,
                content: if content.is_empty() {
                    None
                } else {
                    Some(content)
                },
                tool_calls,
                usage,
                created_at: chrono::Utc::now(),
            };
            let _ = tx.send(Ok(ResponseEvent::Completed { response }));
        });

        Ok(Box::pin(
            tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
        ))
    }
}

/// A model that replays a script of canned responses, one per call.
///
/// Each scripted response is emitted as a short stream: one text delta (when
/// the response has content) followed by the `Completed` event. When the
/// script runs dry the model either falls back to a default message or, with
/// [`ScriptedModel::end_without_completion`], ends the stream with no
/// terminal event to exercise behavioral-error handling.
pub struct ScriptedModel {
    model: String,
    responses: std::sync::Mutex<std::collections::VecDeque<ModelResponse>>,
    end_without_completion: bool,
}

impl ScriptedModel {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            responses: std::sync::Mutex::new(std::collections::VecDeque::new()),
            end_without_completion: false,
        }
    }

    /// When the script is exhausted, end the stream without a completed
    /// response instead of falling back to a default message.
    pub fn end_without_completion(mut self) -> Self {
        self.end_without_completion = true;
        self
    }

    pub fn with_response(self, response: ModelResponse) -> Self {
        self.responses.lock().unwrap().push_back(response);
        self
    }

    pub fn with_message(self, content: impl Into<String>) -> Self {
        self.with_response(ModelResponse::new_message(content).with_usage(Usage::new(10, 5)))
    }

    pub fn with_tool_call(self, tool_name: impl Into<String>, args: Value) -> Self {
        let tool_call = ToolCall {
            id: uuid::Uuid::new_v4().to_string(),
            name: tool_name.into(),
            arguments: args,
        };
        self.with_response(
            ModelResponse::new_tool_calls(vec![tool_call]).with_usage(Usage::new(10, 5)),
        )
    }
}

#[async_trait]
impl Model for ScriptedModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn stream_response(&self, _request: ModelRequest) -> Result<ResponseStream> {
        let next = self.responses.lock().unwrap().pop_front();
        let response = match next {
            Some(response) => response,
            None if self.end_without_completion => {
                return Ok(Box::pin(futures::stream::empty()));
            }
            None => ModelResponse::new_message("Default response").with_usage(Usage::new(10, 5)),
        };

        let mut events = Vec::new();
        if let Some(content) = &response.content {
            events.push(Ok(ResponseEvent::OutputTextDelta {
                delta: content.clone(),
            }));
        }
        events.push(Ok(ResponseEvent::Completed { response }));
        Ok(Box::pin(futures::stream::iter(events)))
    }
}
