use thiserror::Error;

/// Typed error hierarchy for taskmate.
///
/// Use at module boundaries (provider calls, sandbox validation, agent stack
/// operations). Internal/leaf functions can continue using `anyhow::Result` —
/// the `Internal` variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum TaskmateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Forbidden command: {0}")]
    ForbiddenCommand(String),

    #[error("Empty command")]
    EmptyCommand,

    #[error("Unterminated heredoc: no closing line for '{delimiter}'")]
    UnterminatedHeredoc { delimiter: String },

    #[error("Command too long: {line_count} lines (max {max_lines})")]
    CommandTooLong { line_count: usize, max_lines: usize },

    #[error("Command timed out after {timeout_secs}s")]
    ExecutionTimeout { timeout_secs: u64 },

    #[error("Command execution failed: {0}")]
    ExecutionRuntime(String),

    #[error("Model call failed: {message}")]
    ModelCallFailed { message: String, retryable: bool },

    #[error("Model call timed out")]
    ModelCallTimeout,

    #[error("Unknown agent: {0}")]
    AgentNotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using `TaskmateError`.
pub type TaskmateResult<T> = std::result::Result<T, TaskmateError>;

impl TaskmateError {
    /// Whether this error is retryable (transient provider failures).
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskmateError::ModelCallFailed { retryable, .. } => *retryable,
            TaskmateError::ModelCallTimeout => true,
            _ => false,
        }
    }
}
