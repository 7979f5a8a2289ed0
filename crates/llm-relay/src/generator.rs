//! The generator contract and its optional capabilities.
//!
//! [`Generator`] is the one trait every model endpoint implements. Only
//! [`generate`](Generator::generate) is required. Token counting, tool
//! registration and streaming are optional: their default implementations
//! return [`LlmError::Unsupported`], and
//! [`capabilities`](Generator::capabilities) tells callers up front which
//! ones are real.
//!
//! The trait is object-safe (boxed futures), so generators compose as
//! `Arc<dyn Generator>` through the wrappers in [`retry`](crate::retry),
//! [`fallback`](crate::fallback) and [`middleware`](crate::middleware).
//!
//! # Implementing
//!
//! ```rust
//! use futures::future::BoxFuture;
//! use llm_relay::{Dialog, GenOptions, Generator, LlmError, Message, Response};
//! use llm_relay::chat::FinishReason;
//!
//! struct Echo;
//!
//! impl Generator for Echo {
//!     fn generate<'a>(
//!         &'a self,
//!         dialog: &'a Dialog,
//!         _options: &'a GenOptions,
//!     ) -> BoxFuture<'a, Result<Response, LlmError>> {
//!         Box::pin(async move {
//!             let last = dialog.last().ok_or(LlmError::EmptyDialog)?;
//!             Ok(Response::single(Message::assistant(last.text()), FinishReason::EndTurn))
//!         })
//!     }
//! }
//! ```

use std::collections::HashSet;
use std::pin::Pin;

use futures::Stream;
use futures::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::{Dialog, Response};
use crate::error::LlmError;
use crate::options::GenOptions;
use crate::stream::StreamFragment;

/// Tool names that collide with tool-choice keywords.
pub const RESERVED_TOOL_NAMES: [&str; 3] = ["auto", "required", "none"];

/// A finite, single-consumption stream of fragments.
///
/// Dropping the stream is the consumer's "stop" signal; producers must not
/// assume they can resume afterwards.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<StreamFragment, LlmError>> + Send>>;

/// An optional generator capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Capability {
    /// [`Generator::count_tokens`].
    TokenCounting,
    /// [`Generator::register_tool`].
    ToolRegistration,
    /// [`Generator::stream`].
    Streaming,
}

/// A model endpoint (or a wrapper around one).
pub trait Generator: Send + Sync {
    /// Runs one generation over `dialog`.
    fn generate<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<Response, LlmError>>;

    /// The optional capabilities this generator really implements.
    fn capabilities(&self) -> HashSet<Capability> {
        HashSet::new()
    }

    /// Counts the tokens `dialog` would consume as input.
    fn count_tokens<'a>(&'a self, dialog: &'a Dialog) -> BoxFuture<'a, Result<u64, LlmError>> {
        let _ = dialog;
        Box::pin(future::ready(Err(LlmError::unsupported(
            Capability::TokenCounting,
        ))))
    }

    /// Advertises a tool to the model for all subsequent calls.
    ///
    /// Implementations should reject invalid names with
    /// [`validate_tool_name`].
    fn register_tool(&self, tool: Tool) -> Result<(), LlmError> {
        let _ = tool;
        Err(LlmError::unsupported(Capability::ToolRegistration))
    }

    /// Starts a streaming generation.
    fn stream<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<FragmentStream, LlmError>> {
        let _ = (dialog, options);
        Box::pin(future::ready(Err(LlmError::unsupported(
            Capability::Streaming,
        ))))
    }
}

/// Checks a tool name against the registration rules.
///
/// Rejects empty names, the reserved tool-choice keywords, and names
/// already present in `existing`.
pub fn validate_tool_name<'a>(
    name: &str,
    mut existing: impl Iterator<Item = &'a str>,
) -> Result<(), LlmError> {
    let reject = |reason: &str| LlmError::ToolRegistration {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(reject("tool name must not be empty"));
    }
    if RESERVED_TOOL_NAMES.contains(&name) {
        return Err(reject("tool name is reserved"));
    }
    if existing.any(|n| n == name) {
        return Err(reject("tool already registered"));
    }
    Ok(())
}

/// A callable capability advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// The name the model uses to call the tool.
    pub name: String,
    /// Shown to the model so it knows when to use the tool.
    pub description: String,
    /// JSON Schema of the tool's parameters.
    pub input_schema: JsonSchema,
}

impl Tool {
    /// Creates a tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: JsonSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// A JSON Schema document.
///
/// Wraps a [`serde_json::Value`]. With the `schema` feature (on by
/// default) it can be derived from a Rust type and used to validate tool
/// arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonSchema(Value);

impl JsonSchema {
    /// Creates a schema from a raw JSON value.
    pub fn new(schema: Value) -> Self {
        Self(schema)
    }

    /// `{"type": "object"}`, for tools without parameters.
    pub fn empty_object() -> Self {
        Self(serde_json::json!({"type": "object"}))
    }

    /// The underlying JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Derives a schema from a type implementing [`schemars::JsonSchema`].
    #[cfg(feature = "schema")]
    pub fn from_type<T: schemars::JsonSchema>() -> Result<Self, serde_json::Error> {
        let schema = schemars::schema_for!(T);
        Ok(Self(serde_json::to_value(schema)?))
    }

    /// Validates `value` against this schema.
    ///
    /// Returns [`LlmError::SchemaValidation`] listing every violation, or
    /// [`LlmError::InvalidParameter`] if the schema itself is malformed.
    #[cfg(feature = "schema")]
    pub fn validate(&self, value: &Value) -> Result<(), LlmError> {
        let validator =
            jsonschema::validator_for(&self.0).map_err(|e| LlmError::InvalidParameter {
                parameter: "input_schema".into(),
                message: format!("invalid JSON schema: {e}"),
            })?;
        let errors: Vec<String> = validator
            .iter_errors(value)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(LlmError::SchemaValidation {
                message: errors.join("; "),
                schema: self.0.clone(),
                actual: value.clone(),
            })
        }
    }
}
