//! Conversation vocabulary shared by every other module.
//!
//! A [`Dialog`] is an append-only list of [`Message`]s. Each message has a
//! [`Role`] and an ordered list of [`Block`]s, the smallest addressable
//! unit of model input or output. A single [`Generator::generate`] call
//! produces a [`Response`] holding one or more candidate messages.
//!
//! # Tool calls on the wire
//!
//! A finished tool call is a [`BlockKind::ToolCall`] block whose
//! `content` is the canonical JSON form of [`ToolCallInput`]:
//!
//! ```json
//! {"name": "get_weather", "parameters": {"city": "Paris"}}
//! ```
//!
//! and whose `id` is the correlation ID the matching tool result must
//! carry.
//!
//! [`Generator::generate`]: crate::generator::Generator::generate

use std::collections::HashMap;
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LlmError;
use crate::usage::Usage;

/// MIME type assigned to text blocks.
pub const TEXT_PLAIN: &str = "text/plain";

/// MIME type assigned to tool-call blocks and argument fragments.
pub const APPLICATION_JSON: &str = "application/json";

/// What a [`Block`] represents within a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Regular model or user content.
    Content,
    /// Chain-of-thought reasoning emitted by the model.
    Thinking,
    /// A request from the model to invoke a tool.
    ToolCall,
    /// The output of a tool invocation.
    ToolResult,
    /// Out-of-band information (usage, finish reason) carried in the
    /// block's extension map.
    Metadata,
}

impl BlockKind {
    /// Returns the `snake_case` tag for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Thinking => "thinking",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Metadata => "metadata",
        }
    }
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The medium of a block's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    /// Plain or structured text.
    #[default]
    Text,
    /// Image data (typically base64 or a URL).
    Image,
    /// Audio data.
    Audio,
    /// Video data.
    Video,
}

/// Atomic unit of conversational content.
///
/// `extra` is an open map for provider-specific annotations. Nothing in
/// this crate branches on it except the stream collector, which reads
/// usage keys from [`BlockKind::Metadata`] blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Correlation ID binding tool calls to their results. `None` (or an
    /// empty string) for blocks that don't need one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// What this block represents.
    pub kind: BlockKind,
    /// The medium of `content`.
    #[serde(default)]
    pub modality: Modality,
    /// MIME type of `content`.
    pub mime_type: String,
    /// Opaque string-like payload.
    pub content: String,
    /// Provider-specific passthrough annotations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

impl Block {
    fn new(kind: BlockKind, mime_type: &str, content: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            modality: Modality::Text,
            mime_type: mime_type.into(),
            content: content.into(),
            extra: HashMap::new(),
        }
    }

    /// A text content block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(BlockKind::Content, TEXT_PLAIN, text)
    }

    /// A thinking (reasoning) block.
    pub fn thinking(text: impl Into<String>) -> Self {
        Self::new(BlockKind::Thinking, TEXT_PLAIN, text)
    }

    /// A finished tool-call block in canonical form.
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, parameters: Value) -> Self {
        let input = ToolCallInput {
            name: name.into(),
            parameters,
        };
        Self::new(BlockKind::ToolCall, APPLICATION_JSON, input.to_json()).with_id(id)
    }

    /// The header fragment of a streamed tool call: carries the correlation
    /// ID and the tool name as content.
    pub fn tool_call_header(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(BlockKind::ToolCall, TEXT_PLAIN, name).with_id(id)
    }

    /// An argument-text fragment of a streamed tool call. Has no
    /// correlation ID; it belongs to the most recent header.
    pub fn tool_call_delta(json_chunk: impl Into<String>) -> Self {
        Self::new(BlockKind::ToolCall, APPLICATION_JSON, json_chunk)
    }

    /// A text tool-result block.
    pub fn tool_result(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(BlockKind::ToolResult, TEXT_PLAIN, text).with_id(id)
    }

    /// A metadata block whose payload lives entirely in `extra`.
    pub fn metadata(extra: HashMap<String, Value>) -> Self {
        Self {
            extra,
            ..Self::new(BlockKind::Metadata, APPLICATION_JSON, "")
        }
    }

    /// Sets the correlation ID.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the modality.
    #[must_use]
    pub fn with_modality(mut self, modality: Modality) -> Self {
        self.modality = modality;
        self
    }

    /// Adds a provider-specific annotation.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// The correlation ID, treating an empty string as absent.
    pub fn correlation_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Who authored a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The human (or calling application).
    User,
    /// The model.
    Assistant,
    /// The output of one tool execution.
    ToolResult,
}

/// An ordered list of blocks with a single author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who wrote this message.
    pub role: Role,
    /// The message body.
    pub blocks: Vec<Block>,
    /// Set on tool-result messages produced by a failed (but recoverable)
    /// tool execution.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    /// Creates a message with the given role and blocks.
    pub fn new(role: Role, blocks: Vec<Block>) -> Self {
        Self {
            role,
            blocks,
            is_error: false,
        }
    }

    /// A single-block user text message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Block::text(text)])
    }

    /// A single-block assistant text message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Block::text(text)])
    }

    /// A successful tool-result message for the call with `call_id`.
    pub fn tool_result(call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Role::ToolResult, vec![Block::tool_result(call_id, text)])
    }

    /// An error-flagged tool-result message, fed back to the model so it
    /// can recover.
    pub fn tool_error(call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::tool_result(call_id, text)
        }
    }

    /// Iterates over the tool-call blocks of this message.
    pub fn tool_calls(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.kind == BlockKind::ToolCall)
    }

    /// Concatenates all text content blocks.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter(|b| b.kind == BlockKind::Content && b.modality == Modality::Text)
            .map(|b| b.content.as_str())
            .collect()
    }
}

/// Full conversation history.
///
/// Append-only: messages can be pushed but never removed or edited
/// through this type. Read access goes through `Deref<Target = [Message]>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dialog(Vec<Message>);

impl Dialog {
    /// Creates an empty dialog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message.
    pub fn push(&mut self, message: Message) {
        self.0.push(message);
    }

    /// Consumes the dialog, returning its messages.
    pub fn into_messages(self) -> Vec<Message> {
        self.0
    }
}

impl Deref for Dialog {
    type Target = [Message];

    fn deref(&self) -> &[Message] {
        &self.0
    }
}

impl From<Vec<Message>> for Dialog {
    fn from(messages: Vec<Message>) -> Self {
        Self(messages)
    }
}

impl FromIterator<Message> for Dialog {
    fn from_iter<I: IntoIterator<Item = Message>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<Message> for Dialog {
    fn extend<I: IntoIterator<Item = Message>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl<'a> IntoIterator for &'a Dialog {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model finished its turn naturally.
    EndTurn,
    /// The model wants one or more tools executed.
    ToolUse,
    /// The generation hit the token limit.
    MaxLength,
    /// The provider reported something we don't recognize.
    #[default]
    Unknown,
}

/// The result of one `generate` call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Response {
    /// Alternative completions. Most calls produce exactly one.
    pub candidates: Vec<Message>,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
    /// Token accounting for this call.
    pub usage: Usage,
    /// Provider response identifiers and other passthrough data, e.g. a
    /// response ID used for multi-turn continuation.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Response {
    /// A response with no candidates.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single-candidate response.
    pub fn single(message: Message, finish_reason: FinishReason) -> Self {
        Self {
            candidates: vec![message],
            finish_reason,
            ..Self::default()
        }
    }
}

/// Parsed form of a finished tool-call block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallInput {
    /// Name of the tool to invoke.
    pub name: String,
    /// Structured arguments.
    #[serde(default = "empty_object")]
    pub parameters: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl ToolCallInput {
    /// Parses a finished tool-call block.
    pub fn from_block(block: &Block) -> Result<Self, LlmError> {
        if block.kind != BlockKind::ToolCall {
            return Err(LlmError::InvalidResponse(format!(
                "expected a tool_call block, got {}",
                block.kind
            )));
        }
        serde_json::from_str(&block.content).map_err(|e| LlmError::ResponseFormat {
            message: format!("malformed tool call: {e}"),
            raw: block.content.clone(),
        })
    }

    /// Serializes to the canonical block content.
    pub fn to_json(&self) -> String {
        serde_json::json!({ "name": self.name, "parameters": self.parameters }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_call_block_is_canonical() {
        let block = Block::tool_call("call_1", "search", json!({"q": "rust"}));
        assert_eq!(block.correlation_id(), Some("call_1"));
        assert_eq!(block.mime_type, APPLICATION_JSON);

        let input = ToolCallInput::from_block(&block).unwrap();
        assert_eq!(input.name, "search");
        assert_eq!(input.parameters, json!({"q": "rust"}));
    }

    #[test]
    fn test_tool_call_input_missing_parameters_defaults_to_object() {
        let block = Block {
            content: r#"{"name":"ping"}"#.into(),
            ..Block::tool_call_delta("")
        };
        let input = ToolCallInput::from_block(&block).unwrap();
        assert_eq!(input.parameters, json!({}));
    }

    #[test]
    fn test_tool_call_input_rejects_other_kinds() {
        let err = ToolCallInput::from_block(&Block::text("hi")).unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }

    #[test]
    fn test_tool_call_input_malformed_json() {
        let block = Block::tool_call_delta("{not json");
        let err = ToolCallInput::from_block(&block).unwrap_err();
        assert!(matches!(err, LlmError::ResponseFormat { .. }));
    }

    #[test]
    fn test_empty_id_is_not_a_correlation_id() {
        let block = Block::text("x").with_id("");
        assert_eq!(block.correlation_id(), None);
    }

    #[test]
    fn test_message_text_skips_other_kinds() {
        let msg = Message::new(
            Role::Assistant,
            vec![
                Block::thinking("hmm"),
                Block::text("Hello, "),
                Block::tool_call("c1", "noop", json!({})),
                Block::text("world"),
            ],
        );
        assert_eq!(msg.text(), "Hello, world");
        assert_eq!(msg.tool_calls().count(), 1);
    }

    #[test]
    fn test_tool_error_sets_flag() {
        let msg = Message::tool_error("c1", "boom");
        assert!(msg.is_error);
        assert_eq!(msg.role, Role::ToolResult);
        assert_eq!(msg.blocks[0].correlation_id(), Some("c1"));
    }

    #[test]
    fn test_dialog_is_append_only_view() {
        let mut dialog = Dialog::new();
        dialog.push(Message::user("hi"));
        dialog.push(Message::assistant("hello"));
        assert_eq!(dialog.len(), 2);
        assert_eq!(dialog.last().unwrap().role, Role::Assistant);
        assert_eq!(dialog.iter().filter(|m| m.role == Role::User).count(), 1);
    }

    #[test]
    fn test_block_serde_uses_snake_case_tags() {
        let block = Block::tool_result("c1", "42");
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["kind"], "tool_result");
        assert_eq!(value["modality"], "text");
        let back: Block = serde_json::from_value(value).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_message_serde_omits_false_error_flag() {
        let value = serde_json::to_value(Message::user("hi")).unwrap();
        assert!(value.get("is_error").is_none());
        let value = serde_json::to_value(Message::tool_error("c", "x")).unwrap();
        assert_eq!(value["is_error"], true);
    }
}
