//! Tool callback trait and the closure-backed implementation.

use std::future::Future;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::chat::Message;

/// Error returned by a tool callback.
///
/// The two variants decide what the tool loop does next:
///
/// | Variant | Loop behavior |
/// |---------|---------------|
/// | [`Recoverable`](Self::Recoverable) | fed back to the model as an error-flagged tool result |
/// | [`Fatal`](Self::Fatal) | loop stops with [`LlmError::ToolExecution`](crate::LlmError::ToolExecution) |
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The model can fix this, e.g. by calling again with other arguments.
    #[error("{message}")]
    Recoverable {
        /// Shown to the model.
        message: String,
    },
    /// Something the model cannot fix.
    #[error("{source}")]
    Fatal {
        /// The underlying cause.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ToolError {
    /// A recoverable error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self::Recoverable {
            message: message.into(),
        }
    }

    /// A fatal error wrapping `source`.
    pub fn fatal(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Fatal {
            source: source.into(),
        }
    }

    /// Returns `true` for [`ToolError::Fatal`].
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// Executes one tool call.
///
/// Receives the parsed parameters and the call's correlation ID, and must
/// return a [`Role::ToolResult`](crate::chat::Role::ToolResult) message
/// whose blocks all carry that ID ([`Message::tool_result`] does this).
///
/// The trait is object-safe so callbacks can be stored as
/// `Arc<dyn ToolCallback>`. For simple tools use [`tool_fn`].
pub trait ToolCallback: Send + Sync {
    /// Runs the tool.
    fn call<'a>(
        &'a self,
        parameters: Value,
        call_id: &'a str,
    ) -> BoxFuture<'a, Result<Message, ToolError>>;
}

/// A tool callback backed by an async closure. Created by [`tool_fn`].
pub struct FnToolCallback<F> {
    handler: F,
}

impl<F> std::fmt::Debug for FnToolCallback<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnToolCallback").finish_non_exhaustive()
    }
}

impl<F, Fut, O> ToolCallback for FnToolCallback<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, ToolError>> + Send + 'static,
    O: Into<String> + Send + 'static,
{
    fn call<'a>(
        &'a self,
        parameters: Value,
        call_id: &'a str,
    ) -> BoxFuture<'a, Result<Message, ToolError>> {
        let fut = (self.handler)(parameters);
        Box::pin(async move { fut.await.map(|text| Message::tool_result(call_id, text)) })
    }
}

/// Wraps an async closure as a [`ToolCallback`].
///
/// The closure's text output becomes a single tool-result block bound to
/// the call's correlation ID.
///
/// ```rust
/// use std::sync::Arc;
/// use llm_relay::tool::{ToolCallback, ToolError, tool_fn};
/// use serde_json::Value;
///
/// let add: Arc<dyn ToolCallback> = Arc::new(tool_fn(|params: Value| async move {
///     let a = params["a"].as_f64().ok_or_else(|| ToolError::new("missing a"))?;
///     let b = params["b"].as_f64().ok_or_else(|| ToolError::new("missing b"))?;
///     Ok::<_, ToolError>(format!("{}", a + b))
/// }));
/// ```
pub fn tool_fn<F, Fut, O>(handler: F) -> FnToolCallback<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, ToolError>> + Send + 'static,
    O: Into<String> + Send + 'static,
{
    FnToolCallback { handler }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Role;
    use serde_json::json;

    #[tokio::test]
    async fn test_tool_fn_builds_result_message() {
        let echo = tool_fn(|params: Value| async move {
            Ok::<_, ToolError>(params["msg"].to_string())
        });
        let message = echo.call(json!({"msg": "hi"}), "call_7").await.unwrap();
        assert_eq!(message.role, Role::ToolResult);
        assert!(!message.is_error);
        assert_eq!(message.blocks[0].correlation_id(), Some("call_7"));
        assert_eq!(message.blocks[0].content, "\"hi\"");
    }

    #[tokio::test]
    async fn test_tool_fn_propagates_error() {
        let failing = tool_fn(|_: Value| async { Err::<String, _>(ToolError::new("bad input")) });
        let err = failing.call(json!({}), "c").await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "bad input");
    }

    #[test]
    fn test_fatal_keeps_source() {
        let err = ToolError::fatal(std::io::Error::other("socket closed"));
        assert!(err.is_fatal());
        match err {
            ToolError::Fatal { source } => {
                assert!(source.downcast_ref::<std::io::Error>().is_some());
            }
            ToolError::Recoverable { .. } => panic!("expected fatal"),
        }
    }
}
