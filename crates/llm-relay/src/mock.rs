//! Mock generator for testing.
//!
//! [`MockGenerator`] is a queue-based fake that lets tests decide exactly
//! which responses, errors, streams and token counts a generator returns,
//! without touching the network. It implements every optional capability,
//! so it can sit underneath any wrapper in this crate.
//!
//! ```rust,no_run
//! use llm_relay::mock::{MockError, MockGenerator};
//! use llm_relay::{Dialog, GenOptions, Generator, Message, Response};
//! use llm_relay::chat::FinishReason;
//!
//! # async fn example() {
//! let mock = MockGenerator::new();
//! mock.queue_error(MockError::RateLimit("slow down".into()))
//!     .queue_response(Response::single(Message::assistant("hi"), FinishReason::EndTurn));
//!
//! let dialog = Dialog::from(vec![Message::user("hello")]);
//! assert!(mock.generate(&dialog, &GenOptions::default()).await.is_err());
//! assert!(mock.generate(&dialog, &GenOptions::default()).await.is_ok());
//! assert_eq!(mock.recorded_calls().len(), 2);
//! # }
//! ```
//!
//! # Why `MockError` instead of `LlmError`?
//!
//! [`LlmError`] holds boxed sources and is not `Clone`, so it can't be
//! stored in a queue that tests may inspect. [`MockError`] mirrors the
//! common variants in a cloneable form and converts when dequeued.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::chat::{Dialog, Response};
use crate::error::LlmError;
use crate::generator::{Capability, FragmentStream, Generator, Tool, validate_tool_name};
use crate::options::GenOptions;
use crate::stream::StreamFragment;

/// One recorded `generate` or `stream` invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// The dialog passed in.
    pub dialog: Dialog,
    /// The options passed in.
    pub options: GenOptions,
}

/// Cloneable error subset for mock queuing.
#[derive(Debug, Clone)]
pub enum MockError {
    /// Maps to [`LlmError::Auth`].
    Auth(String),
    /// Maps to [`LlmError::RateLimit`] with no retry-after hint.
    RateLimit(String),
    /// Maps to [`LlmError::Api`].
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
    },
    /// Maps to [`LlmError::Timeout`].
    Timeout {
        /// Elapsed milliseconds.
        elapsed_ms: u64,
    },
    /// Maps to [`LlmError::ContextLengthExceeded`].
    ContextLengthExceeded(String),
    /// Maps to [`LlmError::ContentPolicy`].
    ContentPolicy(String),
    /// Maps to [`LlmError::InvalidResponse`].
    InvalidResponse(String),
    /// Maps to [`LlmError::Cancelled`].
    Cancelled,
}

impl MockError {
    fn into_llm_error(self) -> LlmError {
        match self {
            Self::Auth(msg) => LlmError::Auth(msg),
            Self::RateLimit(message) => LlmError::RateLimit {
                message,
                retry_after: None,
            },
            Self::Api { status, message } => LlmError::Api {
                status: http::StatusCode::from_u16(status).ok(),
                kind: "api_error".into(),
                message,
            },
            Self::Timeout { elapsed_ms } => LlmError::Timeout { elapsed_ms },
            Self::ContextLengthExceeded(msg) => LlmError::ContextLengthExceeded(msg),
            Self::ContentPolicy(msg) => LlmError::ContentPolicy(msg),
            Self::InvalidResponse(msg) => LlmError::InvalidResponse(msg),
            Self::Cancelled => LlmError::Cancelled,
        }
    }
}

/// A queue-based mock generator for unit and integration tests.
///
/// Each call to `generate`, `stream` or `count_tokens` pops from the front
/// of its own queue. Every `generate` and `stream` call is recorded for
/// later assertion via [`recorded_calls`](Self::recorded_calls).
///
/// # Panics
///
/// `generate`, `stream` and `count_tokens` panic if their queue is empty.
pub struct MockGenerator {
    responses: Mutex<VecDeque<Result<Response, MockError>>>,
    streams: Mutex<VecDeque<Result<Vec<StreamFragment>, MockError>>>,
    token_counts: Mutex<VecDeque<Result<u64, MockError>>>,
    tools: Mutex<Vec<Tool>>,
    calls: Mutex<Vec<RecordedCall>>,
    token_count_calls: Mutex<u32>,
    capabilities: HashSet<Capability>,
    delay: Option<Duration>,
}

impl fmt::Debug for MockGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockGenerator")
            .field("queued_responses", &self.responses.lock().unwrap().len())
            .field("queued_streams", &self.streams.lock().unwrap().len())
            .field("recorded_calls", &self.calls.lock().unwrap().len())
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGenerator {
    /// Creates a mock with empty queues that advertises every capability.
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            streams: Mutex::new(VecDeque::new()),
            token_counts: Mutex::new(VecDeque::new()),
            tools: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            token_count_calls: Mutex::new(0),
            capabilities: HashSet::from([
                Capability::TokenCounting,
                Capability::ToolRegistration,
                Capability::Streaming,
            ]),
            delay: None,
        }
    }

    /// Overrides the advertised capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    /// Sleeps this long before answering each `generate` call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Enqueues a successful response for the next `generate` call.
    pub fn queue_response(&self, response: Response) -> &Self {
        self.responses.lock().unwrap().push_back(Ok(response));
        self
    }

    /// Enqueues an error for the next `generate` call.
    pub fn queue_error(&self, error: MockError) -> &Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    /// Enqueues fragments for the next `stream` call.
    pub fn queue_stream(&self, fragments: Vec<StreamFragment>) -> &Self {
        self.streams.lock().unwrap().push_back(Ok(fragments));
        self
    }

    /// Enqueues an error returned from `stream()` itself, before any
    /// fragment is yielded.
    pub fn queue_stream_error(&self, error: MockError) -> &Self {
        self.streams.lock().unwrap().push_back(Err(error));
        self
    }

    /// Enqueues the result of the next `count_tokens` call.
    pub fn queue_token_count(&self, count: Result<u64, MockError>) -> &Self {
        self.token_counts.lock().unwrap().push_back(count);
        self
    }

    /// Every `generate` and `stream` call so far, in order.
    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// How many times `count_tokens` was called.
    pub fn token_count_calls(&self) -> u32 {
        *self.token_count_calls.lock().unwrap()
    }

    /// Tools registered so far.
    pub fn registered_tools(&self) -> Vec<Tool> {
        self.tools.lock().unwrap().clone()
    }

    fn record_call(&self, dialog: &Dialog, options: &GenOptions) {
        self.calls.lock().unwrap().push(RecordedCall {
            dialog: dialog.clone(),
            options: options.clone(),
        });
    }
}

impl Generator for MockGenerator {
    fn generate<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<Response, LlmError>> {
        Box::pin(async move {
            self.record_call(dialog, options);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let result = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("MockGenerator: no queued responses remaining");
            result.map_err(MockError::into_llm_error)
        })
    }

    fn capabilities(&self) -> HashSet<Capability> {
        self.capabilities.clone()
    }

    fn count_tokens<'a>(&'a self, _dialog: &'a Dialog) -> BoxFuture<'a, Result<u64, LlmError>> {
        Box::pin(async move {
            *self.token_count_calls.lock().unwrap() += 1;
            let result = self
                .token_counts
                .lock()
                .unwrap()
                .pop_front()
                .expect("MockGenerator: no queued token counts remaining");
            result.map_err(MockError::into_llm_error)
        })
    }

    fn register_tool(&self, tool: Tool) -> Result<(), LlmError> {
        let mut tools = self.tools.lock().unwrap();
        validate_tool_name(&tool.name, tools.iter().map(|t| t.name.as_str()))?;
        tools.push(tool);
        Ok(())
    }

    fn stream<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<FragmentStream, LlmError>> {
        Box::pin(async move {
            self.record_call(dialog, options);
            let result = self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .expect("MockGenerator: no queued streams remaining");
            let fragments = result.map_err(MockError::into_llm_error)?;
            let stream: FragmentStream = Box::pin(futures::stream::iter(
                fragments.into_iter().map(Ok::<_, LlmError>),
            ));
            Ok(stream)
        })
    }
}
