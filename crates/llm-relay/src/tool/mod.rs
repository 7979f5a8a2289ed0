//! Tool calling.
//!
//! # Architecture
//!
//! ```text
//!   ToolCallback     : runs one tool call (trait object or tool_fn closure)
//!       │
//!   ToolGenerator    : owns the registered tools, drives
//!                      generate → execute → feed back until the model stops
//! ```
//!
//! A turn whose finish reason is `tool_use` has every tool-call block
//! resolved by correlation ID before the model is called again. Each call
//! gets exactly one result message, appended in call order even when
//! [`ToolLoopConfig::parallel_tool_execution`] runs the callbacks
//! concurrently.
//!
//! | Callback outcome | Effect |
//! |------------------|--------|
//! | `Ok(message)` | appended after validation |
//! | [`ToolError::Recoverable`] | error-flagged result appended, loop continues |
//! | [`ToolError::Fatal`] | loop fails with [`LlmError::ToolExecution`](crate::LlmError::ToolExecution) |
//! | tool not registered | loop fails with [`LlmError::ToolNotFound`](crate::LlmError::ToolNotFound) |
//! | stop tool (no callback) | loop ends successfully |
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use llm_relay::tool::{ToolError, ToolGenerator, tool_fn};
//! use llm_relay::{Dialog, GenOptions, Generator, JsonSchema, Message, Tool};
//! use serde_json::{Value, json};
//!
//! # async fn example(provider: Arc<dyn Generator>) -> Result<(), llm_relay::ToolLoopError> {
//! let mut tools = ToolGenerator::new(provider);
//! tools.register(
//!     Tool::new(
//!         "add",
//!         "Add two numbers",
//!         JsonSchema::new(json!({
//!             "type": "object",
//!             "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
//!             "required": ["a", "b"]
//!         })),
//!     ),
//!     Some(Arc::new(tool_fn(|input: Value| async move {
//!         let a = input["a"].as_f64().unwrap_or(0.0);
//!         let b = input["b"].as_f64().unwrap_or(0.0);
//!         Ok::<_, ToolError>(format!("{}", a + b))
//!     }))),
//! ).expect("valid tool");
//!
//! let dialog = Dialog::from(vec![Message::user("What is 2 + 3?")]);
//! let finished = tools.generate(dialog, |_| GenOptions::default()).await?;
//! println!("{}", finished.last().map(Message::text).unwrap_or_default());
//! # Ok(())
//! # }
//! ```

mod callback;
mod config;
mod execution;
mod generator;

pub use callback::{FnToolCallback, ToolCallback, ToolError, tool_fn};
pub use config::ToolLoopConfig;
pub use generator::ToolGenerator;
