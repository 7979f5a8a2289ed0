//! Execution of one turn's tool calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::{StreamExt, TryStreamExt, stream};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::chat::{Message, Role};
use crate::error::LlmError;
use crate::generator::Tool;

use super::callback::{ToolCallback, ToolError};

/// A resolved tool call, ready to run.
pub(crate) struct PendingCall<'a> {
    pub call_id: String,
    pub parameters: Value,
    pub tool: &'a Tool,
    pub callback: Arc<dyn ToolCallback>,
}

/// Awaits `operation` unless `cancel` fires first.
pub(crate) async fn until_cancelled<T>(
    cancel: Option<&CancellationToken>,
    operation: impl Future<Output = Result<T, LlmError>>,
) -> Result<T, LlmError> {
    match cancel {
        Some(token) => {
            tokio::select! {
                () = token.cancelled() => Err(LlmError::Cancelled),
                result = operation => result,
            }
        }
        None => operation.await,
    }
}

/// Runs every call and returns one result message per call, in call order.
///
/// Stops at the first fatal error; results of calls that already finished
/// are discarded. In parallel mode the calls run concurrently but the
/// output order still follows the input.
pub(crate) async fn execute_calls<'a>(
    calls: Vec<PendingCall<'a>>,
    parallel: bool,
    validate_arguments: bool,
    cancel: Option<&'a CancellationToken>,
) -> Result<Vec<Message>, LlmError> {
    let call_count = calls.len();
    let run = |call: PendingCall<'a>| execute_one(call, validate_arguments, cancel);

    if parallel && call_count > 1 {
        stream::iter(calls)
            .map(run)
            .buffered(call_count)
            .try_collect()
            .await
    } else {
        stream::iter(calls).then(run).try_collect().await
    }
}

async fn execute_one(
    call: PendingCall<'_>,
    validate_arguments: bool,
    cancel: Option<&CancellationToken>,
) -> Result<Message, LlmError> {
    let PendingCall {
        call_id,
        parameters,
        tool,
        callback,
    } = call;

    if validate_arguments {
        if let Err(message) = check_arguments(tool, &parameters) {
            tracing::debug!(tool = %tool.name, %call_id, "tool arguments rejected by schema");
            return Ok(Message::tool_error(call_id, message));
        }
    }

    tracing::debug!(tool = %tool.name, %call_id, "executing tool");
    let start = Instant::now();
    let outcome = match cancel {
        Some(token) => {
            tokio::select! {
                () = token.cancelled() => return Err(LlmError::Cancelled),
                outcome = callback.call(parameters, &call_id) => outcome,
            }
        }
        None => callback.call(parameters, &call_id).await,
    };
    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    match outcome {
        Ok(message) => {
            check_result(&message, &call_id)?;
            tracing::debug!(tool = %tool.name, %call_id, duration_ms, "tool finished");
            Ok(message)
        }
        Err(ToolError::Recoverable { message }) => {
            tracing::debug!(tool = %tool.name, %call_id, %message, "tool reported a recoverable error");
            Ok(Message::tool_error(call_id, message))
        }
        Err(ToolError::Fatal { source }) => {
            tracing::warn!(tool = %tool.name, %call_id, error = %source, "tool failed");
            Err(LlmError::ToolExecution {
                tool_name: tool.name.clone(),
                call_id,
                source,
            })
        }
    }
}

#[cfg(feature = "schema")]
fn check_arguments(tool: &Tool, parameters: &Value) -> Result<(), String> {
    tool.input_schema
        .validate(parameters)
        .map_err(|e| format!("invalid arguments for tool {}: {e}", tool.name))
}

#[cfg(not(feature = "schema"))]
#[allow(clippy::unnecessary_wraps)]
fn check_arguments(_tool: &Tool, _parameters: &Value) -> Result<(), String> {
    Ok(())
}

fn check_result(message: &Message, call_id: &str) -> Result<(), LlmError> {
    let invalid = |message: &str| LlmError::InvalidToolResult {
        call_id: call_id.to_string(),
        message: message.to_string(),
    };
    if message.role != Role::ToolResult {
        return Err(invalid("result message must have the tool_result role"));
    }
    if message.blocks.is_empty() {
        return Err(invalid("result message has no blocks"));
    }
    if message
        .blocks
        .iter()
        .any(|block| block.correlation_id() != Some(call_id))
    {
        return Err(invalid("every result block must carry the call's correlation id"));
    }
    Ok(())
}
