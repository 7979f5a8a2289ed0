//! Unified error type for all generator operations.
//!
//! Provider adapters map their native failures into [`LlmError`], so
//! wrappers and callers can branch on the kind without caring which
//! backend is in use. Every variant carries structured fields rather than
//! a single opaque string.
//!
//! # Classification
//!
//! Retry and fallback decisions are allow-listed, never catch-all:
//!
//! ```rust
//! use llm_relay::LlmError;
//!
//! let err = LlmError::RateLimit { message: "slow down".into(), retry_after: None };
//! assert!(err.is_retryable());
//!
//! let err = LlmError::ContentPolicy("refused".into());
//! assert!(!err.is_retryable());
//! assert!(!err.is_fallback_eligible());
//! ```

use serde_json::Value;
use std::time::Duration;

use crate::chat::{BlockKind, Dialog, Modality, Response};
use crate::generator::Capability;

/// The unified error type returned by generators, wrappers and the tool
/// loop.
///
/// `#[non_exhaustive]`: always include a wildcard arm when matching.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LlmError {
    /// Credentials were missing or rejected.
    #[error("authentication error: {0}")]
    Auth(String),

    /// The provider throttled the request.
    #[error("rate limited: {message}")]
    RateLimit {
        /// Provider-supplied description.
        message: String,
        /// How long the provider asked us to wait, if it said.
        retry_after: Option<Duration>,
    },

    /// A provider API error that doesn't map to a more specific kind.
    #[error("API error (status={status:?}, type={kind}): {message}")]
    Api {
        /// HTTP status code, when one was received.
        status: Option<http::StatusCode>,
        /// Provider-defined error type (e.g. `"overloaded_error"`).
        kind: String,
        /// Human-readable description.
        message: String,
    },

    /// The dialog does not fit into the model's context window.
    #[error("context length exceeded: {0}")]
    ContextLengthExceeded(String),

    /// The provider refused the input or output on policy grounds.
    #[error("content policy violation: {0}")]
    ContentPolicy(String),

    /// The model cannot accept this input modality.
    #[error("unsupported input modality: {0:?}")]
    UnsupportedInputModality(Modality),

    /// The model cannot produce this output modality.
    #[error("unsupported output modality: {0:?}")]
    UnsupportedOutputModality(Modality),

    /// The requested tool choice is invalid (unknown tool, no tools
    /// registered, ...).
    #[error("invalid tool choice: {0}")]
    InvalidToolChoice(String),

    /// A generation option was out of range or unsupported.
    #[error("invalid parameter {parameter}: {message}")]
    InvalidParameter {
        /// Name of the offending option.
        parameter: String,
        /// What was wrong with it.
        message: String,
    },

    /// `generate` was called with no messages.
    #[error("empty dialog")]
    EmptyDialog,

    /// Generation stopped at the token limit. The partial response is
    /// preserved for callers that want to use it anyway.
    #[error("max generation limit reached")]
    MaxGenerationLimit {
        /// Whatever the model produced before hitting the limit.
        partial: Box<Response>,
    },

    /// The generator does not implement an optional capability.
    #[error("unsupported capability: {capability:?}")]
    Unsupported {
        /// The capability that was requested.
        capability: Capability,
    },

    /// The stream compressor received a fragment it cannot fold.
    #[error("unsupported block type: {kind}")]
    UnsupportedBlockType {
        /// The offending fragment kind.
        kind: BlockKind,
    },

    /// The model's response broke the conversation protocol (wrong role,
    /// wrong candidate count, orphan tool-call fragment).
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Structured content could not be parsed.
    #[error("response format error: {message}")]
    ResponseFormat {
        /// What went wrong during parsing.
        message: String,
        /// The raw text, for diagnostics.
        raw: String,
    },

    /// A value failed JSON Schema validation.
    #[error("schema validation error: {message}")]
    SchemaValidation {
        /// Concatenated validation messages.
        message: String,
        /// The schema validated against.
        schema: Value,
        /// The value that failed.
        actual: Value,
    },

    /// A tool could not be registered.
    #[error("cannot register tool {name:?}: {reason}")]
    ToolRegistration {
        /// The rejected tool name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The model called a tool that was never registered.
    #[error("tool not found: {name}")]
    ToolNotFound {
        /// The unknown tool name.
        name: String,
    },

    /// A tool callback returned a malformed result message.
    #[error("invalid result for tool call {call_id}: {message}")]
    InvalidToolResult {
        /// The tool call the result was produced for.
        call_id: String,
        /// What was wrong with it.
        message: String,
    },

    /// A tool callback signalled a hard failure. Terminates the tool loop;
    /// [`source`](std::error::Error::source) yields the original cause.
    #[error("tool execution error ({tool_name}, call {call_id}): {source}")]
    ToolExecution {
        /// The tool that failed.
        tool_name: String,
        /// The correlation ID of the failed call.
        call_id: String,
        /// The underlying cause.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The tool loop ran more model turns than allowed.
    #[error("tool loop exceeded {limit} iterations")]
    MaxIterations {
        /// The configured limit.
        limit: u32,
    },

    /// The operation exceeded its deadline.
    #[error("operation timed out after {elapsed_ms}ms")]
    Timeout {
        /// Milliseconds elapsed before the deadline fired.
        elapsed_ms: u64,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
}

impl LlmError {
    /// Returns `true` if the same request may succeed on retry.
    ///
    /// Only rate limits, 5xx API errors, and timeouts qualify.
    /// Cancellation never does.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimit { .. } | Self::Timeout { .. } => true,
            Self::Api {
                status: Some(status),
                ..
            } => status.is_server_error(),
            _ => false,
        }
    }

    /// Returns `true` if another generator should be tried after this
    /// error. Used as the default predicate of
    /// [`Fallback`](crate::fallback::Fallback).
    ///
    /// Everything retryable qualifies, plus authentication failures since
    /// a different provider has different credentials.
    pub fn is_fallback_eligible(&self) -> bool {
        self.is_retryable() || matches!(self, Self::Auth(_))
    }

    /// Shorthand for an [`LlmError::Unsupported`] error.
    pub fn unsupported(capability: Capability) -> Self {
        Self::Unsupported { capability }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        Self::ResponseFormat {
            message: err.to_string(),
            raw: String::new(),
        }
    }
}

/// A tool loop failure together with the dialog as far as it got.
///
/// For hard callback failures the dialog ends with the tool-call message
/// (no results). For protocol violations it ends at the last valid state.
#[derive(Debug, thiserror::Error)]
#[error("tool loop failed: {error}")]
pub struct ToolLoopError {
    /// The working dialog at the point of failure.
    pub dialog: Dialog,
    /// What went wrong.
    #[source]
    pub error: LlmError,
}

impl ToolLoopError {
    pub(crate) fn new(dialog: Dialog, error: LlmError) -> Self {
        Self { dialog, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    fn api(status: u16) -> LlmError {
        LlmError::Api {
            status: Some(http::StatusCode::from_u16(status).unwrap()),
            kind: "api_error".into(),
            message: "boom".into(),
        }
    }

    #[test]
    fn test_error_display_api() {
        let display = format!("{}", api(503));
        assert!(display.contains("503"));
        assert!(display.contains("api_error"));
        assert!(display.contains("boom"));
    }

    #[test]
    fn test_error_display_unsupported_block_type() {
        let err = LlmError::UnsupportedBlockType {
            kind: BlockKind::Metadata,
        };
        let display = format!("{err}");
        assert!(display.contains("unsupported"));
        assert!(display.contains("metadata"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(api(500).is_retryable());
        assert!(api(529).is_retryable());
        assert!(!api(400).is_retryable());
        assert!(
            LlmError::RateLimit {
                message: String::new(),
                retry_after: None
            }
            .is_retryable()
        );
        assert!(LlmError::Timeout { elapsed_ms: 10 }.is_retryable());
        assert!(!LlmError::Cancelled.is_retryable());
        assert!(!LlmError::Auth("bad".into()).is_retryable());
        assert!(!LlmError::EmptyDialog.is_retryable());
    }

    #[test]
    fn test_api_without_status_not_retryable() {
        let err = LlmError::Api {
            status: None,
            kind: "unknown".into(),
            message: "?".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_fallback_eligible_includes_auth() {
        assert!(LlmError::Auth("expired".into()).is_fallback_eligible());
        assert!(api(502).is_fallback_eligible());
        assert!(!LlmError::ContextLengthExceeded("too long".into()).is_fallback_eligible());
        assert!(!LlmError::Cancelled.is_fallback_eligible());
    }

    #[test]
    fn test_tool_execution_unwraps_to_cause() {
        let err = LlmError::ToolExecution {
            tool_name: "db".into(),
            call_id: "c1".into(),
            source: Box::new(std::io::Error::other("disk full")),
        };
        let source = err.source().expect("ToolExecution should have a source");
        assert!(format!("{source}").contains("disk full"));
        assert!(source.downcast_ref::<std::io::Error>().is_some());
    }

    #[test]
    fn test_max_generation_limit_keeps_partial() {
        let partial = Response::single(
            crate::chat::Message::assistant("half an ans"),
            crate::chat::FinishReason::MaxLength,
        );
        let err = LlmError::MaxGenerationLimit {
            partial: Box::new(partial),
        };
        match err {
            LlmError::MaxGenerationLimit { partial } => {
                assert_eq!(partial.candidates[0].text(), "half an ans");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_tool_loop_error_source_chain() {
        let err = ToolLoopError::new(Dialog::new(), LlmError::ToolNotFound { name: "x".into() });
        assert!(format!("{err}").contains("tool not found"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<Value>("nope").unwrap_err();
        let err: LlmError = json_err.into();
        assert!(matches!(err, LlmError::ResponseFormat { .. }));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LlmError>();
        assert_send_sync::<ToolLoopError>();
    }
}
