//! Composable generator middleware.
//!
//! A middleware wraps one inner [`Generator`], overrides the operations
//! it cares about and forwards everything else unchanged. Implement
//! [`Middleware`] and the blanket impl turns the type into a full
//! [`Generator`]; any method left at its default delegates to
//! [`inner`](Middleware::inner).
//!
//! # Ordering
//!
//! ```text
//! wrap(base, vec![
//!     Logging::layer(LogLevel::Info),      // outermost: sees the call first
//!     Retry::layer(policy),                // retries everything inside it
//!     Timeout::layer(30s),                 // innermost: bounds each attempt
//! ])
//! ```
//!
//! The first factory becomes the outermost layer, so on the way in the
//! layers run in list order and on the way out in reverse.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use llm_relay::Generator;
//! use llm_relay::middleware::{GeneratorStack, LogLevel, Logging, Timeout};
//!
//! # fn example(my_provider: Arc<dyn Generator>) {
//! let generator = GeneratorStack::new()
//!     .with(Logging::layer(LogLevel::Debug))
//!     .with(Timeout::layer(Duration::from_secs(30)))
//!     .build(my_provider);
//! # let _ = generator;
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;

use crate::chat::{Dialog, Response};
use crate::error::LlmError;
use crate::generator::{Capability, FragmentStream, Generator, Tool};
use crate::options::GenOptions;

/// A generator decorator.
///
/// Only [`inner`](Self::inner) is required. Every `handle_*` method
/// defaults to forwarding to the inner generator, so a middleware that
/// overrides nothing is fully transparent.
pub trait Middleware: Send + Sync {
    /// The generator this middleware wraps.
    fn inner(&self) -> &dyn Generator;

    /// Handles [`Generator::generate`].
    fn handle_generate<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<Response, LlmError>> {
        self.inner().generate(dialog, options)
    }

    /// Handles [`Generator::capabilities`].
    fn handle_capabilities(&self) -> HashSet<Capability> {
        self.inner().capabilities()
    }

    /// Handles [`Generator::count_tokens`].
    fn handle_count_tokens<'a>(
        &'a self,
        dialog: &'a Dialog,
    ) -> BoxFuture<'a, Result<u64, LlmError>> {
        self.inner().count_tokens(dialog)
    }

    /// Handles [`Generator::register_tool`].
    fn handle_register_tool(&self, tool: Tool) -> Result<(), LlmError> {
        self.inner().register_tool(tool)
    }

    /// Handles [`Generator::stream`].
    fn handle_stream<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<FragmentStream, LlmError>> {
        self.inner().stream(dialog, options)
    }
}

impl<M: Middleware> Generator for M {
    fn generate<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<Response, LlmError>> {
        self.handle_generate(dialog, options)
    }

    fn capabilities(&self) -> HashSet<Capability> {
        self.handle_capabilities()
    }

    fn count_tokens<'a>(&'a self, dialog: &'a Dialog) -> BoxFuture<'a, Result<u64, LlmError>> {
        self.handle_count_tokens(dialog)
    }

    fn register_tool(&self, tool: Tool) -> Result<(), LlmError> {
        self.handle_register_tool(tool)
    }

    fn stream<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<FragmentStream, LlmError>> {
        self.handle_stream(dialog, options)
    }
}

/// Builds one middleware layer around a generator.
pub type MiddlewareFactory =
    Box<dyn FnOnce(Arc<dyn Generator>) -> Arc<dyn Generator> + Send>;

/// Boxes a closure as a [`MiddlewareFactory`].
pub fn layer<M, F>(build: F) -> MiddlewareFactory
where
    M: Generator + 'static,
    F: FnOnce(Arc<dyn Generator>) -> M + Send + 'static,
{
    Box::new(move |inner| Arc::new(build(inner)) as Arc<dyn Generator>)
}

/// Wraps `base` in the given layers. The first factory is outermost.
pub fn wrap(
    base: Arc<dyn Generator>,
    factories: impl IntoIterator<Item = MiddlewareFactory>,
) -> Arc<dyn Generator> {
    let factories: Vec<_> = factories.into_iter().collect();
    factories
        .into_iter()
        .rev()
        .fold(base, |inner, factory| factory(inner))
}

/// An ordered collection of middleware layers.
///
/// Layers added first wrap those added later.
#[derive(Default)]
pub struct GeneratorStack {
    layers: Vec<MiddlewareFactory>,
}

impl GeneratorStack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a layer inside the ones already added.
    #[must_use]
    pub fn with(mut self, factory: MiddlewareFactory) -> Self {
        self.layers.push(factory);
        self
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns `true` if there are no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Wraps `base` in every layer.
    pub fn build(self, base: Arc<dyn Generator>) -> Arc<dyn Generator> {
        wrap(base, self.layers)
    }
}

impl std::fmt::Debug for GeneratorStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorStack")
            .field("layers", &self.layers.len())
            .finish()
    }
}

// ── Logging ─────────────────────────────────────────────────────────

/// Verbosity of the [`Logging`] middleware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// One `info` line per completed call with its duration.
    #[default]
    Info,
    /// `debug` lines including success, finish reason and usage.
    Debug,
    /// Like `Debug`, plus a line when each call starts.
    Trace,
}

/// Logs every call through `tracing`.
pub struct Logging {
    inner: Arc<dyn Generator>,
    level: LogLevel,
}

impl Logging {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn Generator>, level: LogLevel) -> Self {
        Self { inner, level }
    }

    /// A factory for use with [`wrap`] or [`GeneratorStack`].
    pub fn layer(level: LogLevel) -> MiddlewareFactory {
        layer(move |inner| Self::new(inner, level))
    }
}

impl std::fmt::Debug for Logging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logging")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Middleware for Logging {
    fn inner(&self) -> &dyn Generator {
        self.inner.as_ref()
    }

    fn handle_generate<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<Response, LlmError>> {
        let level = self.level;
        Box::pin(async move {
            if level == LogLevel::Trace {
                tracing::debug!(messages = dialog.len(), "generate starting");
            }
            let start = Instant::now();
            let result = self.inner.generate(dialog, options).await;
            let duration_ms = millis(start.elapsed());

            match (&result, level) {
                (Ok(_), LogLevel::Info) => {
                    tracing::info!(duration_ms, "generate completed");
                }
                (Ok(response), LogLevel::Debug | LogLevel::Trace) => {
                    tracing::debug!(
                        duration_ms,
                        candidates = response.candidates.len(),
                        finish_reason = ?response.finish_reason,
                        input_tokens = response.usage.input_tokens,
                        output_tokens = response.usage.output_tokens,
                        "generate completed"
                    );
                }
                (Err(error), _) => {
                    tracing::warn!(duration_ms, %error, "generate failed");
                }
            }
            result
        })
    }

    fn handle_stream<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<FragmentStream, LlmError>> {
        Box::pin(async move {
            let start = Instant::now();
            let result = self.inner.stream(dialog, options).await;
            let duration_ms = millis(start.elapsed());
            match &result {
                Ok(_) => tracing::debug!(duration_ms, "stream opened"),
                Err(error) => tracing::warn!(duration_ms, %error, "stream failed to open"),
            }
            result
        })
    }
}

// ── Timeout ─────────────────────────────────────────────────────────

/// Bounds each call to the inner generator.
///
/// Expiry yields [`LlmError::Timeout`], which is retryable, so a
/// [`Retry`](crate::retry::Retry) layer outside this one retries slow
/// attempts. For streams only the opening is bounded.
pub struct Timeout {
    inner: Arc<dyn Generator>,
    duration: Duration,
}

impl Timeout {
    /// Wraps `inner` with a per-call deadline.
    pub fn new(inner: Arc<dyn Generator>, duration: Duration) -> Self {
        Self { inner, duration }
    }

    /// A factory for use with [`wrap`] or [`GeneratorStack`].
    pub fn layer(duration: Duration) -> MiddlewareFactory {
        layer(move |inner| Self::new(inner, duration))
    }

    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, LlmError>>,
    ) -> Result<T, LlmError> {
        match tokio::time::timeout(self.duration, operation).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                elapsed_ms: millis(self.duration),
            }),
        }
    }
}

impl std::fmt::Debug for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeout")
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

impl Middleware for Timeout {
    fn inner(&self) -> &dyn Generator {
        self.inner.as_ref()
    }

    fn handle_generate<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<Response, LlmError>> {
        Box::pin(self.bounded(self.inner.generate(dialog, options)))
    }

    fn handle_count_tokens<'a>(
        &'a self,
        dialog: &'a Dialog,
    ) -> BoxFuture<'a, Result<u64, LlmError>> {
        Box::pin(self.bounded(self.inner.count_tokens(dialog)))
    }

    fn handle_stream<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<FragmentStream, LlmError>> {
        Box::pin(self.bounded(self.inner.stream(dialog, options)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::JsonSchema;
    use crate::mock::MockGenerator;
    use crate::test_helpers::{text_response, user_dialog};
    use std::sync::Mutex;

    /// Records entry and exit of `generate` into a shared log.
    struct Tracer {
        inner: Arc<dyn Generator>,
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Tracer {
        fn inner(&self) -> &dyn Generator {
            self.inner.as_ref()
        }

        fn handle_generate<'a>(
            &'a self,
            dialog: &'a Dialog,
            options: &'a GenOptions,
        ) -> BoxFuture<'a, Result<Response, LlmError>> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("enter {}", self.name));
                let result = self.inner.generate(dialog, options).await;
                self.log.lock().unwrap().push(format!("exit {}", self.name));
                result
            })
        }
    }

    fn tracer(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> MiddlewareFactory {
        let log = Arc::clone(log);
        layer(move |inner| Tracer { inner, name, log })
    }

    #[tokio::test]
    async fn test_wrap_first_factory_is_outermost() {
        let mock = MockGenerator::new();
        mock.queue_response(text_response("ok"));
        let log = Arc::new(Mutex::new(Vec::new()));

        let generator = wrap(
            Arc::new(mock),
            vec![tracer("a", &log), tracer("b", &log), tracer("c", &log)],
        );
        generator
            .generate(&user_dialog("hi"), &GenOptions::default())
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["enter a", "enter b", "enter c", "exit c", "exit b", "exit a"]
        );
    }

    #[tokio::test]
    async fn test_stack_matches_wrap_order() {
        let mock = MockGenerator::new();
        mock.queue_response(text_response("ok"));
        let log = Arc::new(Mutex::new(Vec::new()));

        let stack = GeneratorStack::new()
            .with(tracer("outer", &log))
            .with(tracer("inner", &log));
        assert_eq!(stack.len(), 2);
        let generator = stack.build(Arc::new(mock));
        generator
            .generate(&user_dialog("hi"), &GenOptions::default())
            .await
            .unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log[0], "enter outer");
        assert_eq!(log[3], "exit outer");
    }

    #[tokio::test]
    async fn test_non_overridden_methods_are_transparent() {
        let mock = Arc::new(MockGenerator::new().with_capabilities([Capability::TokenCounting]));
        mock.queue_token_count(Ok(42));
        let log = Arc::new(Mutex::new(Vec::new()));

        let generator = wrap(mock.clone(), vec![tracer("t", &log)]);
        assert_eq!(generator.count_tokens(&user_dialog("hi")).await.unwrap(), 42);
        assert_eq!(
            generator.capabilities(),
            HashSet::from([Capability::TokenCounting])
        );
        generator
            .register_tool(Tool::new("search", "Search", JsonSchema::empty_object()))
            .unwrap();

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(mock.token_count_calls(), 1);
        assert_eq!(mock.registered_tools()[0].name, "search");
    }

    #[tokio::test]
    async fn test_empty_wrap_returns_base() {
        let mock = MockGenerator::new();
        mock.queue_response(text_response("plain"));
        let generator = wrap(Arc::new(mock), Vec::new());
        let response = generator
            .generate(&user_dialog("hi"), &GenOptions::default())
            .await
            .unwrap();
        assert_eq!(response.candidates[0].text(), "plain");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_expires() {
        let mock = MockGenerator::new().with_delay(Duration::from_secs(10));
        mock.queue_response(text_response("late"));
        let generator = Timeout::new(Arc::new(mock), Duration::from_secs(1));

        let err = generator
            .generate(&user_dialog("hi"), &GenOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout { elapsed_ms: 1000 }));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_passes_fast_calls() {
        let mock = MockGenerator::new().with_delay(Duration::from_millis(5));
        mock.queue_response(text_response("quick"));
        let generator = wrap(
            Arc::new(mock),
            vec![Timeout::layer(Duration::from_secs(1))],
        );
        let response = generator
            .generate(&user_dialog("hi"), &GenOptions::default())
            .await
            .unwrap();
        assert_eq!(response.candidates[0].text(), "quick");
    }

    #[tokio::test]
    async fn test_logging_passes_results_through() {
        let mock = MockGenerator::new();
        mock.queue_response(text_response("logged"))
            .queue_error(crate::mock::MockError::Auth("nope".into()));
        let generator = wrap(
            Arc::new(mock),
            vec![Logging::layer(LogLevel::Trace)],
        );
        let dialog = user_dialog("hi");

        let ok = generator.generate(&dialog, &GenOptions::default()).await;
        assert_eq!(ok.unwrap().candidates[0].text(), "logged");
        let err = generator.generate(&dialog, &GenOptions::default()).await;
        assert!(matches!(err.unwrap_err(), LlmError::Auth(_)));
    }
}
