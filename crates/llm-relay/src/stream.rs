//! Streaming fragments and their compression into finished blocks.
//!
//! A streaming generator yields [`StreamFragment`]s: partial blocks tagged
//! with the candidate they belong to. [`compress`] folds one candidate's
//! fragments into the blocks a non-streaming call would have returned,
//! and [`collect_stream`] drives a whole [`FragmentStream`] into a
//! [`Response`].
//!
//! # Folding rules
//!
//! - Consecutive text `content` fragments concatenate into one block, as
//!   do consecutive `thinking` fragments. A fragment of any other kind
//!   ends the run.
//! - Tool calls arrive as a header (non-empty correlation ID, tool name as
//!   content) followed by argument deltas (empty correlation ID). Deltas
//!   attach to the most recent header. On finalization the argument text
//!   is parsed and re-serialized as canonical [`ToolCallInput`] JSON.
//! - Anything else is rejected with [`LlmError::UnsupportedBlockType`].
//!
//! Output keeps first-seen order. Compressing an already-finished block
//! sequence returns it unchanged.
//!
//! ```rust
//! use llm_relay::chat::{Block, ToolCallInput};
//! use llm_relay::stream::compress;
//!
//! let blocks = compress(vec![
//!     Block::text("The answer "),
//!     Block::text("is"),
//!     Block::tool_call_header("call_1", "lookup"),
//!     Block::tool_call_delta(r#"{"key":"#),
//!     Block::tool_call_delta(r#""x"}"#),
//! ])
//! .unwrap();
//!
//! assert_eq!(blocks.len(), 2);
//! assert_eq!(blocks[0].content, "The answer is");
//! let call = ToolCallInput::from_block(&blocks[1]).unwrap();
//! assert_eq!(call.parameters["key"], "x");
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::StreamExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::{
    APPLICATION_JSON, Block, BlockKind, Dialog, FinishReason, Message, Modality, Response, Role,
    ToolCallInput,
};
use crate::error::LlmError;
use crate::generator::{FragmentStream, Generator};
use crate::middleware::Middleware;
use crate::options::GenOptions;
use crate::usage::Usage;

/// One step of a streaming generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFragment {
    /// Which candidate this fragment belongs to.
    pub candidate: u32,
    /// The partial block.
    pub block: Block,
}

impl StreamFragment {
    /// A fragment for candidate `0`.
    pub fn new(block: Block) -> Self {
        Self {
            candidate: 0,
            block,
        }
    }

    /// A fragment for the given candidate.
    pub fn for_candidate(candidate: u32, block: Block) -> Self {
        Self { candidate, block }
    }
}

/// A tool call being reassembled.
#[derive(Debug)]
struct CallState {
    header: Block,
    arguments: String,
}

impl CallState {
    fn finish(self) -> Result<Block, LlmError> {
        let CallState { header, arguments } = self;

        // A finished call with no deltas passes through untouched.
        if arguments.trim().is_empty()
            && header.mime_type == APPLICATION_JSON
            && ToolCallInput::from_block(&header).is_ok()
        {
            return Ok(header);
        }

        let parameters = if arguments.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(&arguments).map_err(|e| LlmError::ResponseFormat {
                message: format!("tool call {:?} has malformed arguments: {e}", header.id),
                raw: arguments.clone(),
            })?
        };
        let input = ToolCallInput {
            name: header.content,
            parameters,
        };
        Ok(Block {
            id: header.id,
            kind: BlockKind::ToolCall,
            modality: Modality::Text,
            mime_type: APPLICATION_JSON.into(),
            content: input.to_json(),
            extra: header.extra,
        })
    }
}

#[derive(Debug)]
enum Slot {
    Run(Block),
    Call(CallState),
}

/// Folds fragments into finished blocks.
///
/// Single pass, keyed by block kind and, for tool calls, by correlation
/// ID. A repeated header for an ID already seen re-targets subsequent
/// deltas to that call. Only text-modality blocks of the same kind merge;
/// images and other media pass through as separate blocks.
///
/// # Errors
///
/// - [`LlmError::UnsupportedBlockType`] for any kind other than content,
///   thinking or tool call. Nothing after it is processed.
/// - [`LlmError::InvalidResponse`] for an argument delta with no header.
/// - [`LlmError::ResponseFormat`] when a call's arguments aren't JSON.
pub fn compress(fragments: impl IntoIterator<Item = Block>) -> Result<Vec<Block>, LlmError> {
    let mut slots: Vec<Slot> = Vec::new();
    let mut open_run: Option<usize> = None;
    let mut active_call: Option<usize> = None;
    let mut calls_by_id: HashMap<String, usize> = HashMap::new();

    for block in fragments {
        match block.kind {
            BlockKind::Content | BlockKind::Thinking => {
                if let Some(Slot::Run(run)) = open_run.and_then(|i| slots.get_mut(i)) {
                    if run.kind == block.kind
                        && run.modality == Modality::Text
                        && block.modality == Modality::Text
                    {
                        run.content.push_str(&block.content);
                        for (key, value) in block.extra {
                            run.extra.entry(key).or_insert(value);
                        }
                        continue;
                    }
                }
                slots.push(Slot::Run(block));
                open_run = Some(slots.len() - 1);
            }
            BlockKind::ToolCall => {
                open_run = None;
                if let Some(id) = block.correlation_id() {
                    if let Some(&slot) = calls_by_id.get(id) {
                        active_call = Some(slot);
                    } else {
                        calls_by_id.insert(id.to_string(), slots.len());
                        active_call = Some(slots.len());
                        slots.push(Slot::Call(CallState {
                            header: block,
                            arguments: String::new(),
                        }));
                    }
                } else {
                    let Some(Slot::Call(call)) = active_call.and_then(|i| slots.get_mut(i)) else {
                        return Err(LlmError::InvalidResponse(
                            "tool call argument fragment without a preceding header".into(),
                        ));
                    };
                    call.arguments.push_str(&block.content);
                }
            }
            kind => return Err(LlmError::UnsupportedBlockType { kind }),
        }
    }

    slots
        .into_iter()
        .map(|slot| match slot {
            Slot::Run(block) => Ok(block),
            Slot::Call(call) => call.finish(),
        })
        .collect()
}

/// Drains a fragment stream into a [`Response`].
///
/// Fragments are grouped by candidate and each group is [`compress`]ed
/// into one assistant message. Metadata fragments are not compressed:
/// their `input_tokens`, `output_tokens`, `reasoning_tokens` and
/// `cache_read_tokens` keys are summed into [`Response::usage`], a
/// `finish_reason` key overrides the inferred finish reason, and any other
/// key is copied to [`Response::metadata`].
///
/// Without an explicit finish reason, the response finishes with
/// `tool_use` if any candidate called a tool and `end_turn` otherwise.
///
/// # Errors
///
/// Stream errors propagate unchanged. A `max_length` finish reason
/// yields [`LlmError::MaxGenerationLimit`] carrying the partial response.
pub async fn collect_stream(mut stream: FragmentStream) -> Result<Response, LlmError> {
    let mut by_candidate: BTreeMap<u32, Vec<Block>> = BTreeMap::new();
    let mut usage = Usage::default();
    let mut metadata: HashMap<String, Value> = HashMap::new();
    let mut finish_reason: Option<FinishReason> = None;

    while let Some(item) = stream.next().await {
        let fragment = item?;
        if fragment.block.kind == BlockKind::Metadata {
            absorb_metadata(fragment.block, &mut usage, &mut metadata, &mut finish_reason);
        } else {
            by_candidate
                .entry(fragment.candidate)
                .or_default()
                .push(fragment.block);
        }
    }

    let candidates = by_candidate
        .into_values()
        .map(|blocks| Ok(Message::new(Role::Assistant, compress(blocks)?)))
        .collect::<Result<Vec<_>, LlmError>>()?;

    let finish_reason = finish_reason.unwrap_or_else(|| {
        if candidates.iter().any(|c| c.tool_calls().next().is_some()) {
            FinishReason::ToolUse
        } else {
            FinishReason::EndTurn
        }
    });

    let response = Response {
        candidates,
        finish_reason,
        usage,
        metadata,
    };
    if finish_reason == FinishReason::MaxLength {
        return Err(LlmError::MaxGenerationLimit {
            partial: Box::new(response),
        });
    }
    Ok(response)
}

fn absorb_metadata(
    block: Block,
    usage: &mut Usage,
    metadata: &mut HashMap<String, Value>,
    finish_reason: &mut Option<FinishReason>,
) {
    for (key, value) in block.extra {
        let count = value.as_u64();
        let delta = match key.as_str() {
            "input_tokens" => Usage {
                input_tokens: count.unwrap_or(0),
                ..Usage::default()
            },
            "output_tokens" => Usage {
                output_tokens: count.unwrap_or(0),
                ..Usage::default()
            },
            "reasoning_tokens" => Usage {
                reasoning_tokens: count,
                ..Usage::default()
            },
            "cache_read_tokens" => Usage {
                cache_read_tokens: count,
                ..Usage::default()
            },
            "finish_reason" => {
                *finish_reason = serde_json::from_value(value).ok();
                continue;
            }
            _ => {
                metadata.insert(key, value);
                continue;
            }
        };
        *usage += &delta;
    }
}

/// Serves `generate` from the inner generator's `stream`.
///
/// For endpoints that only stream (or stream more cheaply), this gives
/// callers the plain request/response contract. Every other capability
/// passes through.
#[derive(Clone)]
pub struct StreamingAdapter {
    inner: Arc<dyn Generator>,
}

impl StreamingAdapter {
    /// Wraps a streaming-capable generator.
    pub fn new(inner: Arc<dyn Generator>) -> Self {
        Self { inner }
    }
}

impl std::fmt::Debug for StreamingAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingAdapter").finish_non_exhaustive()
    }
}

impl Middleware for StreamingAdapter {
    fn inner(&self) -> &dyn Generator {
        self.inner.as_ref()
    }

    fn handle_generate<'a>(
        &'a self,
        dialog: &'a Dialog,
        options: &'a GenOptions,
    ) -> BoxFuture<'a, Result<Response, LlmError>> {
        Box::pin(async move {
            let stream = self.inner.stream(dialog, options).await?;
            collect_stream(stream).await
        })
    }
}
