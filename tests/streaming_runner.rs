//! End-to-end tests for the streaming run loop, driven by scripted models.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde::Deserialize;
use serde_json::{json, Value};

use react_agents_rs::{
    Agent, AgentsError, BlocklistGuardrail, FunctionTool, InMemorySession, MaxTurnsPolicy,
    ReactRunner, Role, RunConfig, RunItem, RunResultStreaming, ScriptedModel, Session, SpanType,
    StreamEvent, Tool, ToolResult, TracingContext,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_test_writer()
        .try_init();
}

fn echo_agent() -> Agent {
    Agent::simple("assistant", "You are a helpful assistant.").with_tool(Arc::new(
        FunctionTool::simple("echo", "Echo the input back", |input: String| {
            format!("echo: {input}")
        }),
    ))
}

/// Drain the stream, splitting events from a trailing error.
async fn drain(result: &RunResultStreaming) -> (Vec<StreamEvent>, Option<AgentsError>) {
    let mut stream = result.stream_events();
    let mut events = Vec::new();
    let mut error = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => events.push(event),
            Err(e) => error = Some(e),
        }
    }
    (events, error)
}

#[tokio::test]
async fn test_text_run_completes_in_one_turn() {
    init_tracing();
    let model = ScriptedModel::new("scripted").with_message("Hi there!");
    let agent = Arc::new(Agent::simple("assistant", "Be helpful."));
    let config = RunConfig::default().with_model(Arc::new(model));

    let result = ReactRunner::run_streamed(agent, "hello", config).unwrap();
    let (events, error) = drain(&result).await;

    assert!(error.is_none());
    assert!(result.is_complete());
    assert_eq!(result.current_turn(), 1);
    assert_eq!(result.final_output(), Some(Value::String("Hi there!".into())));

    // the starting agent is announced before anything else
    assert!(matches!(events[0], StreamEvent::AgentUpdated { .. }));

    // the stream is single-consumer and already ended
    let mut again = result.stream_events();
    assert!(again.next().await.is_none());
}

#[tokio::test]
async fn test_tool_turn_then_final_reply() {
    init_tracing();
    let model = ScriptedModel::new("scripted")
        .with_tool_call("echo", json!({"input": "ping"}))
        .with_message("done");
    let agent = Arc::new(echo_agent());
    let config = RunConfig::default().with_model(Arc::new(model));

    let result = ReactRunner::run_streamed(agent, "run the echo tool", config).unwrap();
    let (events, error) = drain(&result).await;

    assert!(error.is_none());
    assert_eq!(result.current_turn(), 2);
    assert_eq!(result.final_output(), Some(Value::String("done".into())));

    let items: Vec<&RunItem> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::RunItem(item) => Some(item),
            _ => None,
        })
        .collect();
    let call = items
        .iter()
        .find_map(|i| match i {
            RunItem::ToolCall(c) => Some(c),
            _ => None,
        })
        .expect("tool call item");
    assert_eq!(call.tool_name, "echo");
    let output = items
        .iter()
        .find_map(|i| match i {
            RunItem::ToolOutput(o) => Some(o),
            _ => None,
        })
        .expect("tool output item");
    assert_eq!(output.tool_call_id, call.id);
    assert_eq!(output.output, json!("echo: ping"));
    assert!(output.error.is_none());

    // new_items holds only the final turn, not the whole run
    let last_turn = result.new_items();
    assert_eq!(last_turn.len(), 1);
    assert!(matches!(last_turn[0], RunItem::Message(_)));

    let stats = result.usage_stats();
    assert_eq!(stats.total.request_count, 2);
    assert_eq!(stats.total.prompt_tokens, 20);
    assert!(stats.by_agent.contains_key("assistant"));
    assert!(stats.by_model.contains_key("scripted"));
}

#[tokio::test]
async fn test_max_turns_exceeded_surfaces_at_drain() {
    init_tracing();
    let model = ScriptedModel::new("scripted")
        .with_tool_call("echo", json!({"input": "a"}))
        .with_tool_call("echo", json!({"input": "b"}))
        .with_tool_call("echo", json!({"input": "c"}));
    let agent = Arc::new(echo_agent());
    let config = RunConfig::default()
        .with_model(Arc::new(model))
        .with_max_turns(2);

    let result = ReactRunner::run_streamed(agent, "loop forever", config).unwrap();
    let (events, error) = drain(&result).await;

    assert!(matches!(
        error,
        Some(AgentsError::MaxTurnsExceeded { max_turns: 2 })
    ));
    // both budgeted turns ran to completion before the abort
    assert_eq!(result.current_turn(), 2);
    assert!(result.final_output().is_none());
    let tool_outputs = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::RunItem(RunItem::ToolOutput(_))))
        .count();
    assert_eq!(tool_outputs, 2);
}

#[tokio::test]
async fn test_max_turns_final_reply_policy() {
    init_tracing();
    let model = ScriptedModel::new("scripted")
        .with_tool_call("echo", json!({"input": "a"}))
        .with_tool_call("echo", json!({"input": "b"}))
        .with_message("wrapping up");
    let agent = Arc::new(echo_agent());
    let config = RunConfig::default()
        .with_model(Arc::new(model))
        .with_max_turns(2)
        .with_max_turns_policy(MaxTurnsPolicy::FinalReply);

    let result = ReactRunner::run_streamed(agent, "loop forever", config).unwrap();
    let (_events, error) = drain(&result).await;

    assert!(error.is_none());
    assert_eq!(result.current_turn(), 3);
    assert_eq!(
        result.final_output(),
        Some(Value::String("wrapping up".into()))
    );
}

#[tokio::test]
async fn test_handoff_switches_agent_and_traces() {
    init_tracing();
    let billing_model = ScriptedModel::new("scripted").with_message("That plan is $10/month.");
    let billing = Arc::new(
        Agent::simple("billing", "Answer billing questions.")
            .with_model_instance(Arc::new(billing_model)),
    );

    let triage_model = ScriptedModel::new("scripted")
        .with_tool_call("transfer_to_billing", json!({"reason": "pricing question"}));
    let triage = Arc::new(
        Agent::simple("triage", "Route the user to the right agent.")
            .with_model_instance(Arc::new(triage_model))
            .with_handoff(billing.clone()),
    );

    let trace = Arc::new(Mutex::new(TracingContext::new()));
    let mut config = RunConfig::default();
    config.trace_context = Some(trace.clone());

    let result = ReactRunner::run_streamed(triage, "how much is the pro plan?", config).unwrap();
    let (events, error) = drain(&result).await;

    assert!(error.is_none());
    assert_eq!(
        result.final_output(),
        Some(Value::String("That plan is $10/month.".into()))
    );
    assert_eq!(result.current_agent().name(), "billing");

    let updates: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::AgentUpdated { agent } => Some(agent.name().to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(updates, vec!["triage".to_string(), "billing".to_string()]);

    let handoff = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::RunItem(RunItem::Handoff(h)) => Some(h),
            _ => None,
        })
        .expect("handoff item");
    assert_eq!(handoff.from_agent, "triage");
    assert_eq!(handoff.to_agent, "billing");
    assert_eq!(handoff.reason.as_deref(), Some("pricing question"));

    let ctx = trace.lock().unwrap();
    let agent_spans = ctx
        .spans()
        .iter()
        .filter(|s| matches!(s.span_type, SpanType::Agent { .. }))
        .count();
    let handoff_spans = ctx
        .spans()
        .iter()
        .filter(|s| matches!(s.span_type, SpanType::Handoff { .. }))
        .count();
    assert_eq!(agent_spans, 2);
    assert_eq!(handoff_spans, 1);
}

#[tokio::test]
async fn test_cancel_before_first_turn() {
    init_tracing();
    let model = ScriptedModel::new("scripted").with_message("never sent");
    let agent = Arc::new(Agent::simple("assistant", "Be helpful."));
    let config = RunConfig::default().with_model(Arc::new(model));

    let result = ReactRunner::run_streamed(agent, "hello", config).unwrap();
    // the loop has not been polled yet on a current-thread runtime
    result.cancel();
    let (events, error) = drain(&result).await;

    assert!(error.is_none());
    assert!(result.is_complete());
    assert_eq!(result.current_turn(), 0);
    assert!(result.final_output().is_none());
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], StreamEvent::AgentUpdated { .. }));
}

/// Tool that reports when it has been entered and waits for the test to let
/// it return, so the test can cancel the run while the turn is in flight.
#[derive(Debug)]
struct GatedTool {
    entered: tokio::sync::mpsc::UnboundedSender<()>,
    release: Arc<tokio::sync::Notify>,
}

#[async_trait::async_trait]
impl Tool for GatedTool {
    fn name(&self) -> &str {
        "gated"
    }

    fn description(&self) -> &str {
        "Waits until released"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _arguments: Value) -> react_agents_rs::Result<ToolResult> {
        let _ = self.entered.send(());
        self.release.notified().await;
        Ok(ToolResult::success(json!("released")))
    }
}

#[tokio::test]
async fn test_cancel_during_turn_finishes_and_persists_it() {
    init_tracing();
    let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
    let release = Arc::new(tokio::sync::Notify::new());
    let tool = GatedTool {
        entered: entered_tx,
        release: release.clone(),
    };

    let session = Arc::new(InMemorySession::new("support-cancel"));
    let model = ScriptedModel::new("scripted")
        .with_tool_call("gated", json!({}))
        .with_message("never sent");
    let agent = Arc::new(Agent::simple("assistant", "Be helpful.").with_tool(Arc::new(tool)));
    let config = RunConfig::default()
        .with_model(Arc::new(model))
        .with_session(session.clone());

    let result = ReactRunner::run_streamed(agent, "hold on", config).unwrap();
    entered_rx.recv().await.expect("tool should start");
    // cancel lands while the tool is still running
    result.cancel();
    release.notify_one();
    let (events, error) = drain(&result).await;

    assert!(error.is_none());
    assert!(result.is_complete());
    // the in-flight turn ran to completion; no second turn started
    assert_eq!(result.current_turn(), 1);
    assert!(result.final_output().is_none());
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::RunItem(RunItem::ToolOutput(_)))));

    // the interrupted turn's items were still written to the session
    let items = session.get_items(None).await.unwrap();
    assert_eq!(items.len(), 3);
    assert!(matches!(items[0], RunItem::Message(_)));
    assert!(matches!(items[1], RunItem::ToolCall(_)));
    match &items[2] {
        RunItem::ToolOutput(o) => assert_eq!(o.output, json!("released")),
        other => panic!("expected tool output, got {other:?}"),
    }
}

#[tokio::test]
async fn test_session_persists_baseline_and_turn_items() {
    init_tracing();
    let session = Arc::new(InMemorySession::new("support-1"));
    let model = ScriptedModel::new("scripted").with_message("All good here.");
    let agent = Arc::new(Agent::simple("assistant", "Be helpful."));
    let config = RunConfig::default()
        .with_model(Arc::new(model))
        .with_session(session.clone());

    let result = ReactRunner::run_streamed(agent, "how are things?", config).unwrap();
    let run = result.collect().await.unwrap();
    assert!(run.is_success());

    let items = session.get_items(None).await.unwrap();
    assert_eq!(items.len(), 2);
    match &items[0] {
        RunItem::Message(m) => {
            assert_eq!(m.role, Role::User);
            assert_eq!(m.content, "how are things?");
        }
        other => panic!("expected user message, got {other:?}"),
    }
    match &items[1] {
        RunItem::Message(m) => {
            assert_eq!(m.role, Role::Assistant);
            assert_eq!(m.content, "All good here.");
        }
        other => panic!("expected assistant message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_session_history_feeds_second_run() {
    init_tracing();
    let session = Arc::new(InMemorySession::new("support-2"));
    let agent = Arc::new(Agent::simple("assistant", "Be helpful."));

    let first = ScriptedModel::new("scripted").with_message("Noted.");
    let config = RunConfig::default()
        .with_model(Arc::new(first))
        .with_session(session.clone());
    ReactRunner::run_streamed(agent.clone(), "remember the number 7", config)
        .unwrap()
        .collect()
        .await
        .unwrap();

    let second = ScriptedModel::new("scripted").with_message("It was 7.");
    let config = RunConfig::default()
        .with_model(Arc::new(second))
        .with_session(session.clone());
    let result = ReactRunner::run_streamed(agent, "what was it?", config).unwrap();
    let run = result.collect().await.unwrap();
    assert_eq!(run.final_output, Some(Value::String("It was 7.".into())));

    // four messages now in history: two user turns and two replies
    let items = session.get_items(None).await.unwrap();
    assert_eq!(items.len(), 4);
}

#[tokio::test]
async fn test_structured_input_with_session_rejected_without_callback() {
    init_tracing();
    let session: Arc<dyn Session> = Arc::new(InMemorySession::new("support-3"));
    let agent = Arc::new(Agent::simple("assistant", "Be helpful."));
    let config = RunConfig::default().with_session(session);

    let err = ReactRunner::run_streamed(
        agent,
        vec![react_agents_rs::Message::user("hi")],
        config,
    )
    .unwrap_err();
    assert!(matches!(err, AgentsError::UserError { .. }));
}

#[tokio::test]
async fn test_model_stream_without_completion_is_behavior_error() {
    init_tracing();
    let model = ScriptedModel::new("scripted").end_without_completion();
    let agent = Arc::new(Agent::simple("assistant", "Be helpful."));
    let config = RunConfig::default().with_model(Arc::new(model));

    let result = ReactRunner::run_streamed(agent, "hello", config).unwrap();
    let (_events, error) = drain(&result).await;

    assert!(matches!(
        error,
        Some(AgentsError::ModelBehaviorError { .. })
    ));
    assert!(result.final_output().is_none());
}

#[tokio::test]
async fn test_input_guardrail_blocks_run() {
    init_tracing();
    let model = ScriptedModel::new("scripted").with_message("never reached");
    let agent = Arc::new(
        Agent::simple("assistant", "Be helpful.").with_input_guardrail(Arc::new(
            BlocklistGuardrail::new("no_secrets", vec!["password".to_string()]),
        )),
    );
    let config = RunConfig::default().with_model(Arc::new(model));

    let result = ReactRunner::run_streamed(agent, "what is the admin password?", config).unwrap();
    let (_events, error) = drain(&result).await;

    assert!(matches!(
        error,
        Some(AgentsError::InputGuardrailTriggered { .. })
    ));
    assert_eq!(result.current_turn(), 0);
}

#[tokio::test]
async fn test_output_guardrail_blocks_final_output() {
    init_tracing();
    let model = ScriptedModel::new("scripted").with_message("the password is hunter2");
    let agent = Arc::new(
        Agent::simple("assistant", "Be helpful.").with_output_guardrail(Arc::new(
            BlocklistGuardrail::new("no_secrets", vec!["password".to_string()]),
        )),
    );
    let config = RunConfig::default().with_model(Arc::new(model));

    let result = ReactRunner::run_streamed(agent, "hello", config).unwrap();
    let (_events, error) = drain(&result).await;

    assert!(matches!(
        error,
        Some(AgentsError::OutputGuardrailTriggered { .. })
    ));
    assert!(result.final_output().is_none());
}

#[derive(Debug, Deserialize, PartialEq)]
struct WeatherReport {
    city: String,
    temp_c: i64,
}

#[tokio::test]
async fn test_output_schema_parses_typed_final_output() {
    init_tracing();
    let model =
        ScriptedModel::new("scripted").with_message(r#"{"city": "Paris", "temp_c": 21}"#);
    let agent = Arc::new(
        Agent::simple("weather", "Report the weather as JSON.").with_output_schema(json!({
            "type": "object",
            "properties": {
                "city": {"type": "string"},
                "temp_c": {"type": "integer"}
            },
            "required": ["city", "temp_c"]
        })),
    );
    let config = RunConfig::default().with_model(Arc::new(model));

    let result = ReactRunner::run_streamed(agent, "weather in paris", config).unwrap();
    let run = result.collect().await.unwrap();

    let report: WeatherReport = run.final_output_typed().unwrap();
    assert_eq!(
        report,
        WeatherReport {
            city: "Paris".to_string(),
            temp_c: 21,
        }
    );
}

#[tokio::test]
async fn test_input_filter_rewrites_model_input() {
    use react_agents_rs::{ModelInputData, ModelInputFilter, RunInput};

    init_tracing();

    struct Redact;

    #[async_trait::async_trait]
    impl ModelInputFilter for Redact {
        async fn filter(
            &self,
            mut data: ModelInputData,
        ) -> react_agents_rs::Result<ModelInputData> {
            for message in &mut data.input {
                message.content = message.content.replace("4111-1111", "[redacted]");
            }
            Ok(data)
        }
    }

    // The filter runs before every model call; the scripted model ignores its
    // input, so assert through the run input snapshot staying untouched while
    // the run still completes.
    let model = ScriptedModel::new("scripted").with_message("noted");
    let agent = Arc::new(Agent::simple("assistant", "Be helpful."));
    let mut config = RunConfig::default().with_model(Arc::new(model));
    config.input_filter = Some(Arc::new(Redact));

    let result = ReactRunner::run_streamed(agent, "my card is 4111-1111", config).unwrap();
    let (_events, error) = drain(&result).await;

    assert!(error.is_none());
    assert_eq!(result.final_output(), Some(Value::String("noted".into())));
    // the stored run input keeps the caller's original text
    match result.input() {
        RunInput::Text(text) => assert_eq!(text, "my card is 4111-1111"),
        other => panic!("expected text input, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_tool_call_is_rejected_and_loop_continues() {
    init_tracing();
    let model = ScriptedModel::new("scripted")
        .with_tool_call("launch_rockets", json!({}))
        .with_message("sorry, no such tool");
    let agent = Arc::new(echo_agent());
    let config = RunConfig::default().with_model(Arc::new(model));

    let result = ReactRunner::run_streamed(agent, "do something", config).unwrap();
    let (events, error) = drain(&result).await;

    assert!(error.is_none());
    let rejection = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::RunItem(RunItem::ToolOutput(o)) => o.error.clone(),
            _ => None,
        })
        .expect("rejection output");
    assert!(rejection.contains("unknown tool"));
    assert_eq!(
        result.final_output(),
        Some(Value::String("sorry, no such tool".into()))
    );
}
