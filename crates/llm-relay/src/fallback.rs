//! Ordered fallback across generators.
//!
//! [`Fallback`] tries its generators in order. A failure moves on to the
//! next one only if the predicate (by default
//! [`LlmError::is_fallback_eligible`]) accepts the error; anything else is
//! returned unchanged. When the last generator fails, its error is what
//! the caller sees.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::chat::{Dialog, Response};
use crate::error::LlmError;
use crate::generator::{Capability, FragmentStream, Generator, Tool};
use crate::options::GenOptions;

/// Decides whether an error should move on to the next generator.
pub type FallbackPredicate = Arc<dyn Fn(&LlmError) -> bool + Send + Sync>;

/// Tries generators in order until one succeeds.
///
/// Tool registration is forwarded to every member, and the advertised
/// capabilities are those every member shares.
#[derive(Clone)]
pub struct Fallback {
    generators: Vec<Arc<dyn Generator>>,
    predicate: FallbackPredicate,
}

impl Fallback {
    /// Creates a fallback chain. The first generator is the primary.
    ///
    /// Returns [`LlmError::InvalidParameter`] if `generators` is empty.
    pub fn new(generators: Vec<Arc<dyn Generator>>) -> Result<Self, LlmError> {
        if generators.is_empty() {
            return Err(LlmError::InvalidParameter {
                parameter: "generators".into(),
                message: "a fallback chain needs at least one generator".into(),
            });
        }
        Ok(Self {
            generators,
            predicate: Arc::new(LlmError::is_fallback_eligible),
        })
    }

    /// Replaces the default eligibility predicate.
    #[must_use]
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&LlmError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    /// Number of generators in the chain.
    pub fn len(&self) -> usize {
        self.generators.len()
    }

    /// Always `false`; construction rejects empty chains.
    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    async fn run<'a, T>(
        &'a self,
        operation: &'static str,
        mut attempt: impl FnMut(&'a dyn Generator) -> BoxFuture<'a, Result<T, LlmError>>,
    ) -> Result<T, LlmError> {
        let Some((last, rest)) = self.generators.split_last() else {
            return Err(LlmError::InvalidParameter {
                parameter: "generators".into(),
                message: "a fallback chain needs at least one generator".into(),
            });
        };
        for (index, generator) in rest.iter().enumerate() {
            match attempt(generator.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(error) if (self.predicate)(&error) => {
                    tracing::info!(operation, index, %error, "falling back to next generator");
                }
                Err(error) => return Err(error),
            }
        }
        attempt(last.as_ref()).await
    }
}

impl std::fmt::Debug for Fallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fallback")
            .field("generators", &self.generators.len())
            .finish_non_exhaustive()
    }
}

impl Generator for Fallback {
    fn generate<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<Response, LlmError>> {
        Box::pin(self.run("generate", move |g| g.generate(dialog, options)))
    }

    fn capabilities(&self) -> HashSet<Capability> {
        let mut members = self.generators.iter().map(|g| g.capabilities());
        let first = members.next().unwrap_or_default();
        members.fold(first, |acc, caps| acc.intersection(&caps).copied().collect())
    }

    fn count_tokens<'a>(&'a self, dialog: &'a Dialog) -> BoxFuture<'a, Result<u64, LlmError>> {
        Box::pin(self.run("count_tokens", move |g| g.count_tokens(dialog)))
    }

    /// Registers `tool` with every member, stopping at the first failure.
    fn register_tool(&self, tool: Tool) -> Result<(), LlmError> {
        for generator in &self.generators {
            generator.register_tool(tool.clone())?;
        }
        Ok(())
    }

    fn stream<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<FragmentStream, LlmError>> {
        Box::pin(self.run("stream", move |g| g.stream(dialog, options)))
    }
}
