//! # llm-relay
//!
//! Provider-agnostic orchestration for large language model generators.
//!
//! Backends implement one trait, [`Generator`]. Everything else in this
//! crate is built on that trait and knows nothing about any vendor:
//!
//! - a tool-calling loop ([`ToolGenerator`]) that runs requested tools and
//!   feeds their results back until the model is done,
//! - a stream compressor ([`compress`]) and collector that turn streamed
//!   fragments into the same blocks a non-streaming call returns,
//! - [`Retry`], [`Fallback`] and a [`Middleware`] trait with
//!   [`wrap`]/[`GeneratorStack`] for composing cross-cutting behavior.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────┐
//!                 │    ToolGenerator     │   tool loop
//!                 └──────────┬───────────┘
//!                            │ Arc<dyn Generator>
//!         ┌──────────────────┼──────────────────┐
//!         ▼                  ▼                  ▼
//!   ┌───────────┐     ┌─────────────┐    ┌─────────────┐
//!   │   Retry   │     │  Fallback   │    │ Middleware  │  wrappers, any order
//!   └─────┬─────┘     └──────┬──────┘    └──────┬──────┘
//!         └──────────────────┼──────────────────┘
//!                            ▼
//!                 ┌──────────────────────┐
//!                 │  backend Generator   │   vendor crate
//!                 └──────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use llm_relay::middleware::{GeneratorStack, LogLevel, Logging, Timeout};
//! use llm_relay::retry::{ExponentialBackoff, Retry};
//! use llm_relay::{Dialog, GenOptions, Generator, Message};
//!
//! # async fn example(backend: Arc<dyn Generator>) -> Result<(), llm_relay::LlmError> {
//! let generator = GeneratorStack::new()
//!     .with(Logging::layer(LogLevel::Info))
//!     .with(Retry::layer(ExponentialBackoff::default()))
//!     .with(Timeout::layer(Duration::from_secs(60)))
//!     .build(backend);
//!
//! let dialog = Dialog::from(vec![Message::user("Explain ownership in Rust")]);
//! let response = generator.generate(&dialog, &GenOptions::default()).await?;
//! println!("{}", response.candidates[0].text());
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`chat`] | Blocks, messages, dialogs and responses |
//! | [`error`] | [`LlmError`] and [`ToolLoopError`] |
//! | [`fallback`] | Ordered failover across generators |
//! | [`generator`] | The [`Generator`] trait, capabilities and tool definitions |
//! | [`middleware`] | [`Middleware`] trait, composition, logging and timeouts |
//! | [`options`] | [`GenOptions`] and [`ToolChoice`] |
//! | [`registry`] | Building generators from configuration |
//! | [`retry`] | Backoff policies and the [`Retry`] wrapper |
//! | [`stream`] | Fragment compression and stream collection |
//! | [`tool`] | The tool-calling loop |
//! | [`usage`] | Token accounting |

#![warn(missing_docs)]

pub mod chat;
pub mod error;
pub mod fallback;
pub mod generator;
pub mod middleware;
pub mod options;
pub mod registry;
pub mod retry;
pub mod stream;
pub mod tool;
pub mod usage;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_helpers;

// ── Core re-exports ────────────────────────────────────────────────
//
// Types used by nearly every program. The rest stay in their modules:
//
//   llm_relay::chat::*        : Block constructors, FinishReason, Role
//   llm_relay::middleware::*  : Logging, Timeout, GeneratorStack
//   llm_relay::retry::*       : ExponentialBackoff, ConstantBackoff
//   llm_relay::stream::*      : StreamingAdapter, collect_stream
//   llm_relay::tool::*        : ToolCallback, tool_fn, ToolLoopConfig
//   llm_relay::registry::*    : GeneratorRegistry, GeneratorFactory
//   llm_relay::mock::*        : MockGenerator (test-utils feature)

pub use chat::{Block, BlockKind, Dialog, FinishReason, Message, Modality, Response, Role};
pub use error::{LlmError, ToolLoopError};
pub use fallback::Fallback;
pub use generator::{Capability, FragmentStream, Generator, JsonSchema, Tool};
pub use middleware::{GeneratorStack, Middleware, wrap};
pub use options::{GenOptions, ToolChoice};
pub use retry::Retry;
pub use stream::{StreamFragment, compress};
pub use tool::ToolGenerator;
pub use usage::Usage;
