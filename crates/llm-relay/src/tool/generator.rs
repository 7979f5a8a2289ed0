//! The tool-calling loop.

use std::collections::HashMap;
use std::sync::Arc;

use crate::chat::{Dialog, FinishReason, Message, Response, Role, ToolCallInput};
use crate::error::{LlmError, ToolLoopError};
use crate::generator::{Generator, Tool, validate_tool_name};
use crate::options::{GenOptions, ToolChoice};
use crate::usage::Usage;

use super::callback::ToolCallback;
use super::config::ToolLoopConfig;
use super::execution::{PendingCall, execute_calls, until_cancelled};

struct RegisteredTool {
    tool: Tool,
    /// `None` marks a stop tool.
    callback: Option<Arc<dyn ToolCallback>>,
}

/// Drives a generator through tool calls until the model finishes.
///
/// Each turn: build the options from the current dialog, call the model,
/// and either stop (any finish reason other than `tool_use`) or run the
/// requested tools, append their results, and go again.
///
/// Registering a tool with no callback creates a *stop tool*: when the
/// model calls it, the loop ends successfully with the tool-call message as
/// the last entry, without running any callback of that turn.
pub struct ToolGenerator {
    inner: Arc<dyn Generator>,
    tools: HashMap<String, RegisteredTool>,
    config: ToolLoopConfig,
}

impl std::fmt::Debug for ToolGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolGenerator")
            .field("tools", &names)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ToolGenerator {
    /// Wraps `inner` with the default [`ToolLoopConfig`].
    pub fn new(inner: Arc<dyn Generator>) -> Self {
        Self {
            inner,
            tools: HashMap::new(),
            config: ToolLoopConfig::default(),
        }
    }

    /// Replaces the loop configuration.
    #[must_use]
    pub fn with_config(mut self, config: ToolLoopConfig) -> Self {
        self.config = config;
        self
    }

    /// The loop configuration.
    pub fn config(&self) -> &ToolLoopConfig {
        &self.config
    }

    /// Registers a tool and advertises it to the inner generator.
    ///
    /// Pass `None` as the callback to register a stop tool.
    ///
    /// # Errors
    ///
    /// [`LlmError::ToolRegistration`] for an empty, reserved or duplicate
    /// name; anything the inner generator's `register_tool` returns.
    pub fn register(
        &mut self,
        tool: Tool,
        callback: Option<Arc<dyn ToolCallback>>,
    ) -> Result<(), LlmError> {
        validate_tool_name(&tool.name, self.tools.keys().map(String::as_str))?;
        self.inner.register_tool(tool.clone())?;
        self.tools
            .insert(tool.name.clone(), RegisteredTool { tool, callback });
        Ok(())
    }

    /// Definitions of every registered tool, in no particular order.
    pub fn tools(&self) -> impl Iterator<Item = &Tool> {
        self.tools.values().map(|r| &r.tool)
    }

    /// Runs the loop on `dialog`.
    ///
    /// `options_fn` is called before every model turn with the dialog so
    /// far, so options (tool choice, temperature, ...) can change between
    /// turns. A cancellation token in the returned options is honored for
    /// that turn.
    ///
    /// On success the returned dialog is the input followed by every
    /// message the loop appended. On failure the error carries the dialog
    /// as far as it got: for a fatal tool failure it ends with the
    /// tool-call message and holds no results for that turn.
    pub async fn generate<F>(&self, dialog: Dialog, options_fn: F) -> Result<Dialog, ToolLoopError>
    where
        F: Fn(&Dialog) -> GenOptions + Send + Sync,
    {
        let mut dialog = dialog;
        if dialog.is_empty() {
            return Err(ToolLoopError::new(dialog, LlmError::EmptyDialog));
        }

        let mut iterations: u32 = 0;
        let mut total_usage = Usage::default();
        loop {
            let options = options_fn(&dialog);
            if options.is_cancelled() {
                return Err(fail(dialog, LlmError::Cancelled));
            }
            if let Err(error) = self.check_options(&options) {
                return Err(fail(dialog, error));
            }
            if let Some(limit) = self.config.max_iterations {
                if iterations >= limit {
                    return Err(fail(dialog, LlmError::MaxIterations { limit }));
                }
            }
            iterations += 1;
            tracing::debug!(iteration = iterations, messages = dialog.len(), "tool loop turn");

            let cancel = options.cancel.as_ref();
            let outcome = until_cancelled(cancel, self.inner.generate(&dialog, &options)).await;
            let response = match outcome {
                Ok(response) => response,
                Err(error) => return Err(fail(dialog, error)),
            };
            total_usage += &response.usage;

            let (message, finish_reason) = match single_assistant_candidate(response) {
                Ok(parts) => parts,
                Err(error) => return Err(fail(dialog, error)),
            };

            if finish_reason != FinishReason::ToolUse {
                dialog.push(message);
                tracing::debug!(
                    iterations,
                    ?finish_reason,
                    input_tokens = total_usage.input_tokens,
                    output_tokens = total_usage.output_tokens,
                    "tool loop finished"
                );
                return Ok(dialog);
            }

            let calls = match requested_calls(&message) {
                Ok(calls) => calls,
                Err(error) => return Err(fail(dialog, error)),
            };
            dialog.push(message);

            let mut pending = Vec::with_capacity(calls.len());
            let mut stop_requested = false;
            for (call_id, input) in calls {
                let Some(registered) = self.tools.get(&input.name) else {
                    return Err(fail(dialog, LlmError::ToolNotFound { name: input.name }));
                };
                match &registered.callback {
                    Some(callback) => pending.push(PendingCall {
                        call_id,
                        parameters: input.parameters,
                        tool: &registered.tool,
                        callback: Arc::clone(callback),
                    }),
                    None => stop_requested = true,
                }
            }
            if stop_requested {
                tracing::debug!(iterations, "stop tool called, ending tool loop");
                return Ok(dialog);
            }

            let executed = execute_calls(
                pending,
                self.config.parallel_tool_execution,
                self.config.validate_arguments,
                cancel,
            )
            .await;
            match executed {
                Ok(results) => dialog.extend(results),
                Err(error) => return Err(fail(dialog, error)),
            }
        }
    }

    fn check_options(&self, options: &GenOptions) -> Result<(), LlmError> {
        options.validate()?;
        match &options.tool_choice {
            Some(ToolChoice::Specific(name)) if !self.tools.contains_key(name) => Err(
                LlmError::InvalidToolChoice(format!("tool {name:?} is not registered")),
            ),
            Some(ToolChoice::Required) if self.tools.is_empty() => Err(
                LlmError::InvalidToolChoice("tool use required but no tools are registered".into()),
            ),
            _ => Ok(()),
        }
    }
}

fn fail(dialog: Dialog, error: LlmError) -> ToolLoopError {
    tracing::warn!(messages = dialog.len(), %error, "tool loop failed");
    ToolLoopError::new(dialog, error)
}

fn single_assistant_candidate(response: Response) -> Result<(Message, FinishReason), LlmError> {
    let Response {
        candidates,
        finish_reason,
        ..
    } = response;
    let count = candidates.len();
    let [message] = <[Message; 1]>::try_from(candidates).map_err(|_| {
        LlmError::InvalidResponse(format!("expected exactly one candidate, got {count}"))
    })?;
    if message.role != Role::Assistant {
        return Err(LlmError::InvalidResponse(format!(
            "expected an assistant message, got {:?}",
            message.role
        )));
    }
    Ok((message, finish_reason))
}

fn requested_calls(message: &Message) -> Result<Vec<(String, ToolCallInput)>, LlmError> {
    let calls = message
        .tool_calls()
        .map(|block| {
            let call_id = block.correlation_id().ok_or_else(|| {
                LlmError::InvalidResponse("tool call without a correlation id".into())
            })?;
            Ok((call_id.to_string(), ToolCallInput::from_block(block)?))
        })
        .collect::<Result<Vec<_>, LlmError>>()?;
    if calls.is_empty() {
        return Err(LlmError::InvalidResponse(
            "finish reason is tool_use but the message has no tool calls".into(),
        ));
    }
    Ok(calls)
}
