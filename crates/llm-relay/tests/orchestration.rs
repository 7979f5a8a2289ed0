//! End-to-end tests that drive the tool loop through the resilience
//! wrappers and the streaming adapter, using a scripted in-process backend.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Value, json};

use llm_relay::chat::{Block, FinishReason};
use llm_relay::middleware::{GeneratorStack, LogLevel, Logging, Timeout};
use llm_relay::registry::{GeneratorConfig, GeneratorFactory, GeneratorRegistry};
use llm_relay::retry::{ConstantBackoff, Retry};
use llm_relay::stream::StreamingAdapter;
use llm_relay::tool::{ToolError, ToolGenerator, tool_fn};
use llm_relay::{
    Capability, Dialog, Fallback, FragmentStream, GenOptions, Generator, JsonSchema, LlmError,
    Message, Response, Role, StreamFragment, Tool,
};

// ── Scripted backend ────────────────────────────────────────────────

/// Replays a fixed script of responses or streams, one per call.
#[derive(Default)]
struct Scripted {
    responses: Mutex<VecDeque<Result<Response, LlmError>>>,
    streams: Mutex<VecDeque<Vec<StreamFragment>>>,
    calls: AtomicU32,
    tools: Mutex<Vec<String>>,
}

impl Scripted {
    fn with_responses(script: Vec<Result<Response, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(script.into()),
            ..Self::default()
        })
    }

    fn with_streams(script: Vec<Vec<StreamFragment>>) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(script.into()),
            ..Self::default()
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Generator for Scripted {
    fn generate<'a>(
        &'a self,
        _dialog: &'a Dialog,
        _options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<Response, LlmError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("script exhausted");
        Box::pin(async move { next })
    }

    fn capabilities(&self) -> HashSet<Capability> {
        [Capability::ToolRegistration, Capability::Streaming].into()
    }

    fn register_tool(&self, tool: Tool) -> Result<(), LlmError> {
        self.tools.lock().unwrap().push(tool.name);
        Ok(())
    }

    fn stream<'a>(
        &'a self,
        _dialog: &'a Dialog,
        _options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<FragmentStream, LlmError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fragments = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .expect("stream script exhausted");
        Box::pin(async move {
            let stream: FragmentStream =
                Box::pin(futures::stream::iter(fragments.into_iter().map(Ok)));
            Ok(stream)
        })
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

fn add_tool() -> Tool {
    Tool::new(
        "add",
        "Add two numbers",
        JsonSchema::new(json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"]
        })),
    )
}

fn tools_over(generator: Arc<dyn Generator>) -> ToolGenerator {
    let mut tools = ToolGenerator::new(generator);
    tools
        .register(
            add_tool(),
            Some(Arc::new(tool_fn(|input: Value| async move {
                let a = input["a"].as_i64().ok_or_else(|| ToolError::new("a must be an integer"))?;
                let b = input["b"].as_i64().ok_or_else(|| ToolError::new("b must be an integer"))?;
                Ok::<_, ToolError>((a + b).to_string())
            }))),
        )
        .unwrap();
    tools
}

fn ask() -> Dialog {
    Dialog::from(vec![Message::user("What is 2 + 3?")])
}

fn call_add() -> Response {
    Response::single(
        Message::new(
            Role::Assistant,
            vec![Block::tool_call("call_1", "add", json!({"a": 2, "b": 3}))],
        ),
        FinishReason::ToolUse,
    )
}

fn answer(text: &str) -> Response {
    Response::single(Message::assistant(text), FinishReason::EndTurn)
}

fn rate_limited() -> LlmError {
    LlmError::RateLimit {
        message: "slow down".into(),
        retry_after: None,
    }
}

fn assert_add_round_trip(dialog: &Dialog) {
    assert_eq!(dialog.len(), 4);
    assert_eq!(dialog[1].role, Role::Assistant);
    assert_eq!(dialog[2].role, Role::ToolResult);
    assert_eq!(dialog[2].blocks[0].correlation_id(), Some("call_1"));
    assert_eq!(dialog[2].blocks[0].content, "5");
    assert_eq!(dialog[3].text(), "The answer is 5.");
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn tool_loop_survives_transient_errors_under_retry() {
    let backend = Scripted::with_responses(vec![
        Err(rate_limited()),
        Ok(call_add()),
        Err(rate_limited()),
        Ok(answer("The answer is 5.")),
    ]);
    let retrying = Arc::new(Retry::new(
        backend.clone(),
        ConstantBackoff::new(Duration::from_millis(1), 3),
    ));

    let tools = tools_over(retrying);
    let dialog = tools.generate(ask(), |_| GenOptions::default()).await.unwrap();

    assert_add_round_trip(&dialog);
    assert_eq!(backend.calls(), 4);
    assert_eq!(*backend.tools.lock().unwrap(), vec!["add".to_string()]);
}

#[tokio::test]
async fn tool_loop_fails_over_to_second_backend() {
    let primary = Scripted::with_responses(vec![
        Err(LlmError::Auth("expired key".into())),
        Err(LlmError::Auth("expired key".into())),
    ]);
    let secondary =
        Scripted::with_responses(vec![Ok(call_add()), Ok(answer("The answer is 5."))]);
    let members: Vec<Arc<dyn Generator>> = vec![primary.clone(), secondary.clone()];
    let fallback = Fallback::new(members).unwrap();

    let tools = tools_over(Arc::new(fallback));
    let dialog = tools.generate(ask(), |_| GenOptions::default()).await.unwrap();

    assert_add_round_trip(&dialog);
    assert_eq!(primary.calls(), 2);
    assert_eq!(secondary.calls(), 2);
    // Registration reached both members.
    assert_eq!(primary.tools.lock().unwrap().len(), 1);
    assert_eq!(secondary.tools.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn non_retryable_error_surfaces_with_partial_dialog() {
    let backend = Scripted::with_responses(vec![
        Ok(call_add()),
        Err(LlmError::ContentPolicy("refused".into())),
    ]);
    let retrying = Arc::new(Retry::new(
        backend.clone(),
        ConstantBackoff::new(Duration::from_millis(1), 3),
    ));

    let tools = tools_over(retrying);
    let err = tools
        .generate(ask(), |_| GenOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err.error, LlmError::ContentPolicy(_)));
    assert_eq!(err.dialog.len(), 3);
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn streamed_tool_calls_drive_the_loop() {
    let backend = Scripted::with_streams(vec![
        vec![
            StreamFragment::new(Block::tool_call_header("call_1", "add")),
            StreamFragment::new(Block::tool_call_delta(r#"{"a": 2,"#)),
            StreamFragment::new(Block::tool_call_delta(r#" "b": 3}"#)),
        ],
        vec![
            StreamFragment::new(Block::text("The answer ")),
            StreamFragment::new(Block::text("is 5.")),
        ],
    ]);
    let adapter = Arc::new(StreamingAdapter::new(backend.clone()));

    let tools = tools_over(adapter);
    let dialog = tools.generate(ask(), |_| GenOptions::default()).await.unwrap();

    assert_add_round_trip(&dialog);
    // The streamed header and deltas came back as one canonical call.
    assert_eq!(dialog[1].blocks.len(), 1);
    assert_eq!(
        serde_json::from_str::<Value>(&dialog[1].blocks[0].content).unwrap(),
        json!({"name": "add", "parameters": {"a": 2, "b": 3}})
    );
    // The two text fragments were merged.
    assert_eq!(dialog[3].blocks.len(), 1);
}

struct ScriptedFactory(Arc<Scripted>);

impl GeneratorFactory for ScriptedFactory {
    fn name(&self) -> &str {
        "scripted"
    }

    fn build(&self, _config: &GeneratorConfig) -> Result<Arc<dyn Generator>, LlmError> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn registry_built_backend_composes_with_a_stack() {
    let backend = Scripted::with_responses(vec![
        Err(rate_limited()),
        Ok(call_add()),
        Ok(answer("The answer is 5.")),
    ]);
    let registry = GeneratorRegistry::new();
    registry.register(Box::new(ScriptedFactory(backend.clone())));

    let base = registry
        .build(&GeneratorConfig::new("Scripted", "test-model"))
        .unwrap();
    let stack = GeneratorStack::new()
        .with(Logging::layer(LogLevel::Debug))
        .with(Retry::layer(ConstantBackoff::new(Duration::from_millis(1), 2)))
        .with(Timeout::layer(Duration::from_secs(5)));
    assert_eq!(stack.len(), 3);
    let generator = stack.build(base);

    // Middleware without a capability override reports the backend's set.
    assert!(generator.capabilities().contains(&Capability::Streaming));

    let tools = tools_over(generator);
    let dialog = tools.generate(ask(), |_| GenOptions::default()).await.unwrap();
    assert_add_round_trip(&dialog);
    assert_eq!(backend.calls(), 3);
}
