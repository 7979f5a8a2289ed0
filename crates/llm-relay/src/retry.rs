//! Retry with backoff.
//!
//! [`Retry`] re-issues failed calls to its inner generator. Which errors
//! qualify is decided by [`LlmError::is_retryable`] unless a custom
//! classifier is supplied; how long to wait, and when to give up, is
//! decided by a [`BackoffPolicy`].
//!
//! When the policy gives up, the caller gets the *last* underlying error,
//! not a wrapper. Waits between attempts race the call's cancellation
//! token, so a cancelled call stops promptly with [`LlmError::Cancelled`].
//!
//! `generate`, `count_tokens` and the opening of a `stream` are retried.
//! Tool registration and capability queries pass straight through.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use llm_relay::retry::{ExponentialBackoff, Retry};
//! use llm_relay::{GeneratorStack, Generator, LlmError};
//!
//! # fn example(provider: Arc<dyn Generator>) {
//! let policy = ExponentialBackoff::new(Duration::from_millis(200))
//!     .with_max_attempts(4)
//!     .with_max_elapsed(Duration::from_secs(20));
//! let generator = Retry::new(Arc::clone(&provider), policy.clone());
//! # let _ = generator;
//!
//! // As a stack layer, retrying only rate limits.
//! let stack = GeneratorStack::new()
//!     .with(Retry::layer_with_classifier(policy, |e: &LlmError| {
//!         matches!(e, LlmError::RateLimit { .. })
//!     }))
//!     .build(provider);
//! # let _ = stack;
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::chat::{Dialog, Response};
use crate::error::LlmError;
use crate::generator::{FragmentStream, Generator};
use crate::middleware::{Middleware, MiddlewareFactory, layer};
use crate::options::GenOptions;

/// Decides how long to wait before the next attempt.
pub trait BackoffPolicy: Send + Sync {
    /// The wait after `failures` consecutive failed attempts, with
    /// `elapsed` time spent since the first attempt started. `None` stops
    /// retrying.
    fn next_delay(&self, failures: u32, elapsed: Duration) -> Option<Duration>;
}

/// Exponentially growing delays with optional jitter.
///
/// The `n`th wait is `initial_delay * multiplier^(n-1)`, capped at
/// `max_delay`, then scaled by a random factor in `1 ± jitter`. Retrying
/// stops once `max_attempts` attempts have been made or the next wait
/// would push past `max_elapsed`; at least one of the two should be set.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Wait after the first failure.
    pub initial_delay: Duration,
    /// Growth factor per failure.
    pub multiplier: f64,
    /// Upper bound on a single wait (before jitter).
    pub max_delay: Duration,
    /// Relative jitter, `0.0..=1.0`. Values outside the range are clamped.
    pub jitter: f64,
    /// Total attempts allowed, including the first.
    pub max_attempts: Option<u32>,
    /// Wall-clock budget across all attempts and waits.
    pub max_elapsed: Option<Duration>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            max_attempts: Some(3),
            max_elapsed: Some(Duration::from_secs(120)),
        }
    }
}

impl ExponentialBackoff {
    /// Default policy with the given initial delay.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..Self::default()
        }
    }

    /// Sets the attempt limit (including the first attempt).
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Sets the wall-clock budget.
    #[must_use]
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    /// Sets the growth factor.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the per-wait cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sets the relative jitter, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    fn base_delay(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_delay(&self, failures: u32, elapsed: Duration) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| failures >= max) {
            return None;
        }
        let mut delay = self.base_delay(failures);
        // The field is public, so out-of-range values can bypass `with_jitter`.
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
            delay = delay.mul_f64(factor);
        }
        if self
            .max_elapsed
            .is_some_and(|budget| elapsed.saturating_add(delay) > budget)
        {
            return None;
        }
        Some(delay)
    }
}

/// The same delay between every attempt.
#[derive(Debug, Clone)]
pub struct ConstantBackoff {
    /// Wait between attempts.
    pub delay: Duration,
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
}

impl ConstantBackoff {
    /// Waits `delay` between at most `max_attempts` attempts.
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }
}

impl BackoffPolicy for ConstantBackoff {
    fn next_delay(&self, failures: u32, _elapsed: Duration) -> Option<Duration> {
        (failures < self.max_attempts).then_some(self.delay)
    }
}

/// Decides whether an error is worth another attempt.
pub type RetryClassifier = Arc<dyn Fn(&LlmError) -> bool + Send + Sync>;

/// Retries transient failures of the inner generator.
#[derive(Clone)]
pub struct Retry {
    inner: Arc<dyn Generator>,
    policy: Arc<dyn BackoffPolicy>,
    classifier: Option<RetryClassifier>,
}

impl Retry {
    /// Wraps `inner` with the given policy and the default classifier.
    pub fn new(inner: Arc<dyn Generator>, policy: impl BackoffPolicy + 'static) -> Self {
        Self {
            inner,
            policy: Arc::new(policy),
            classifier: None,
        }
    }

    /// Replaces [`LlmError::is_retryable`] as the retry predicate.
    #[must_use]
    pub fn with_classifier(
        mut self,
        classifier: impl Fn(&LlmError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    /// A factory for use with [`wrap`](crate::middleware::wrap).
    pub fn layer(policy: impl BackoffPolicy + 'static) -> MiddlewareFactory {
        let policy: Arc<dyn BackoffPolicy> = Arc::new(policy);
        layer(move |inner| Self {
            inner,
            policy,
            classifier: None,
        })
    }

    /// Like [`layer`](Self::layer), with a custom retry predicate.
    pub fn layer_with_classifier(
        policy: impl BackoffPolicy + 'static,
        classifier: impl Fn(&LlmError) -> bool + Send + Sync + 'static,
    ) -> MiddlewareFactory {
        let policy: Arc<dyn BackoffPolicy> = Arc::new(policy);
        let classifier: RetryClassifier = Arc::new(classifier);
        layer(move |inner| Self {
            inner,
            policy,
            classifier: Some(classifier),
        })
    }

    fn should_retry(&self, error: &LlmError) -> bool {
        match &self.classifier {
            Some(classify) => classify(error),
            None => error.is_retryable(),
        }
    }

    async fn run<'a, T>(
        &'a self,
        operation: &'static str,
        cancel: Option<&'a CancellationToken>,
        mut attempt: impl FnMut() -> BoxFuture<'a, Result<T, LlmError>>,
    ) -> Result<T, LlmError> {
        let start = Instant::now();
        let mut failures = 0u32;
        loop {
            let error = match attempt().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            failures = failures.saturating_add(1);

            if !self.should_retry(&error) {
                return Err(error);
            }
            let Some(delay) = self.policy.next_delay(failures, start.elapsed()) else {
                tracing::debug!(operation, failures, %error, "retries exhausted");
                return Err(error);
            };

            tracing::debug!(
                operation,
                failures,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                %error,
                "retrying after transient error"
            );
            match cancel {
                Some(token) => {
                    tokio::select! {
                        () = token.cancelled() => return Err(LlmError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

impl std::fmt::Debug for Retry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry")
            .field("custom_classifier", &self.classifier.is_some())
            .finish_non_exhaustive()
    }
}

impl Middleware for Retry {
    fn inner(&self) -> &dyn Generator {
        self.inner.as_ref()
    }

    fn handle_generate<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<Response, LlmError>> {
        Box::pin(self.run("generate", options.cancel.as_ref(), move || {
            self.inner.generate(dialog, options)
        }))
    }

    fn handle_count_tokens<'a>(
        &'a self,
        dialog: &'a Dialog,
    ) -> BoxFuture<'a, Result<u64, LlmError>> {
        Box::pin(self.run("count_tokens", None, move || {
            self.inner.count_tokens(dialog)
        }))
    }

    fn handle_stream<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<FragmentStream, LlmError>> {
        Box::pin(self.run("stream", options.cancel.as_ref(), move || {
            self.inner.stream(dialog, options)
        }))
    }
}
