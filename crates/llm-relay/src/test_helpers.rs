//! Pre-built helpers for tests that use `llm-relay` types.
//!
//! Available with the `test-utils` feature so downstream crates can reuse
//! them, and always compiled for this crate's own tests.

use futures::StreamExt;

use crate::chat::{Block, Dialog, FinishReason, Message, Response, Role};
use crate::error::LlmError;
use crate::generator::FragmentStream;
use crate::mock::MockGenerator;
use crate::stream::StreamFragment;
use crate::usage::Usage;

/// A [`Usage`] with 100 input and 50 output tokens.
pub fn sample_usage() -> Usage {
    Usage {
        input_tokens: 100,
        output_tokens: 50,
        ..Usage::default()
    }
}

/// A one-message dialog from the user.
pub fn user_dialog(text: &str) -> Dialog {
    Dialog::from(vec![Message::user(text)])
}

/// A single-candidate text response that ends the turn.
pub fn text_response(text: &str) -> Response {
    Response {
        usage: sample_usage(),
        ..Response::single(Message::assistant(text), FinishReason::EndTurn)
    }
}

/// A single-candidate response whose message holds the given tool-call
/// blocks (see [`Block::tool_call`]).
pub fn tool_call_response(calls: Vec<Block>) -> Response {
    Response {
        usage: sample_usage(),
        ..Response::single(Message::new(Role::Assistant, calls), FinishReason::ToolUse)
    }
}

/// A fresh [`MockGenerator`] with every capability.
pub fn mock_generator() -> MockGenerator {
    MockGenerator::new()
}

/// Wraps fragments into an always-successful [`FragmentStream`].
pub fn fragment_stream(fragments: Vec<StreamFragment>) -> FragmentStream {
    Box::pin(futures::stream::iter(
        fragments.into_iter().map(Ok::<_, LlmError>),
    ))
}

/// Drains a stream, returning every item including errors.
pub async fn collect_fragment_results(
    stream: FragmentStream,
) -> Vec<Result<StreamFragment, LlmError>> {
    stream.collect::<Vec<_>>().await
}
