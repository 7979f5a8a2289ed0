//! Per-call generation options.
//!
//! [`GenOptions`] collects everything a caller can tune for a single
//! `generate` or `stream` call. It serializes cleanly to JSON (for logging
//! and replay) except for [`cancel`](GenOptions::cancel), which is a
//! runtime handle and is `#[serde(skip)]`'d.
//!
//! ```rust
//! use llm_relay::{GenOptions, ToolChoice};
//!
//! let options = GenOptions {
//!     temperature: Some(0.2),
//!     max_generation_tokens: Some(1024),
//!     tool_choice: Some(ToolChoice::Required),
//!     ..Default::default()
//! };
//! assert!(options.validate().is_ok());
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::chat::Modality;
use crate::error::LlmError;

/// Options for one generation call. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenOptions {
    /// Sampling temperature, `0.0..=2.0`.
    pub temperature: Option<f32>,
    /// Nucleus sampling mass, `0.0..=1.0`.
    pub top_p: Option<f32>,
    /// Frequency penalty, `-2.0..=2.0`.
    pub frequency_penalty: Option<f32>,
    /// Presence penalty, `-2.0..=2.0`.
    pub presence_penalty: Option<f32>,
    /// Upper bound on generated tokens.
    pub max_generation_tokens: Option<u32>,
    /// How many candidates to generate.
    pub candidate_count: Option<u32>,
    /// Sequences that stop generation when produced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    /// Whether and how the model should call tools.
    pub tool_choice: Option<ToolChoice>,
    /// Modalities the caller wants back. Empty means text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_modalities: Vec<Modality>,
    /// Provider-agnostic reasoning budget.
    pub thinking_budget: Option<ThinkingBudget>,
    /// Provider-specific passthrough parameters.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
    /// Cancellation signal for this call. Retry waits, tool callbacks and
    /// the tool loop all stop promptly once it fires.
    #[serde(skip)]
    pub cancel: Option<CancellationToken>,
}

impl GenOptions {
    /// Returns options carrying only a cancellation token.
    pub fn cancellable(token: CancellationToken) -> Self {
        Self {
            cancel: Some(token),
            ..Self::default()
        }
    }

    /// Returns `true` if the cancellation token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Checks value ranges.
    ///
    /// Provider adapters call this before building their request. Returns
    /// [`LlmError::InvalidParameter`] or [`LlmError::InvalidToolChoice`].
    pub fn validate(&self) -> Result<(), LlmError> {
        check_range("temperature", self.temperature, 0.0, 2.0)?;
        check_range("top_p", self.top_p, 0.0, 1.0)?;
        check_range("frequency_penalty", self.frequency_penalty, -2.0, 2.0)?;
        check_range("presence_penalty", self.presence_penalty, -2.0, 2.0)?;
        if self.max_generation_tokens == Some(0) {
            return Err(invalid("max_generation_tokens", "must be greater than zero"));
        }
        if self.candidate_count == Some(0) {
            return Err(invalid("candidate_count", "must be greater than zero"));
        }
        if let Some(ThinkingBudget::Tokens(0)) = self.thinking_budget {
            return Err(invalid("thinking_budget", "token budget must be greater than zero"));
        }
        if let Some(ToolChoice::Specific(name)) = &self.tool_choice {
            if name.is_empty() {
                return Err(LlmError::InvalidToolChoice(
                    "specific tool choice requires a tool name".into(),
                ));
            }
        }
        Ok(())
    }
}

fn invalid(parameter: &str, message: &str) -> LlmError {
    LlmError::InvalidParameter {
        parameter: parameter.into(),
        message: message.into(),
    }
}

fn check_range(parameter: &str, value: Option<f32>, min: f32, max: f32) -> Result<(), LlmError> {
    match value {
        Some(v) if !(min..=max).contains(&v) => Err(LlmError::InvalidParameter {
            parameter: parameter.into(),
            message: format!("{v} is outside {min}..={max}"),
        }),
        _ => Ok(()),
    }
}

/// Controls whether the model should use tools and, if so, which ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model decides.
    Auto,
    /// The model must call at least one tool.
    Required,
    /// The model must not call tools.
    None,
    /// The model must call this tool.
    Specific(String),
}

/// How much effort the model should spend reasoning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingBudget {
    /// Minimal reasoning.
    Low,
    /// Moderate reasoning.
    Medium,
    /// Extensive reasoning.
    High,
    /// An explicit token budget.
    Tokens(u32),
}
