//! Tool loop configuration.

/// Configuration for [`ToolGenerator`](super::ToolGenerator).
///
/// ```rust
/// use llm_relay::tool::ToolLoopConfig;
///
/// let config = ToolLoopConfig {
///     max_iterations: Some(5),
///     parallel_tool_execution: true,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolLoopConfig {
    /// Maximum number of model turns. Exceeding it fails with
    /// [`LlmError::MaxIterations`](crate::LlmError::MaxIterations).
    /// `None` means no limit. Default: `Some(10)`.
    pub max_iterations: Option<u32>,
    /// Run the callbacks of one turn concurrently. Results are appended in
    /// call order either way. Default: `false`.
    pub parallel_tool_execution: bool,
    /// Check arguments against the tool's schema before calling it.
    /// Violations are fed back to the model as recoverable errors. Only
    /// effective with the `schema` feature. Default: `true`.
    pub validate_arguments: bool,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: Some(10),
            parallel_tool_execution: false,
            validate_arguments: true,
        }
    }
}
