//! Error types for the agent crate.

use thiserror::Error;

use braid_llm::{EnvelopeError, LlmError, TranslationError};

use crate::runtime::Interrupt;
use crate::state::AgentState;
use crate::validation::ValidationError;

/// Result type alias using the agent error type.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Error type for agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Model error.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// A recognized provider block is missing a mandatory field.
    #[error("Translation error: {0}")]
    Translation(#[from] TranslationError),

    /// A value failed schema validation.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A middleware refused to let the turn continue.
    #[error("Middleware '{middleware}' vetoed the run: {reason}")]
    MiddlewareVeto { middleware: String, reason: String },

    /// Tool execution error.
    #[error("Tool error: {0}")]
    Tool(String),

    /// A state field could not be reduced.
    #[error("State error: {0}")]
    State(String),

    /// The stored checkpoint changed underneath this run.
    #[error("Checkpoint for thread '{thread_id}' is inconsistent: {reason}")]
    CheckpointConsistency { thread_id: String, reason: String },

    /// Checkpoint store failure.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Control signal raised when the run must wait for outside input.
    #[error("Run interrupted with {} pending interrupt(s)", .0.len())]
    Interrupted(Vec<Interrupt>),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persisted envelope could not be decoded.
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Task was cancelled.
    #[error("Task cancelled")]
    Cancelled,

    /// The run took more steps than allowed.
    #[error("Recursion limit of {0} steps reached")]
    RecursionLimit(u32),

    /// A retry layer gave up.
    #[error("Gave up after {attempts} attempt(s): {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<AgentError>,
    },

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Create a tool error.
    pub fn tool(msg: impl Into<String>) -> Self {
        Self::Tool(msg.into())
    }

    /// Create a veto raised by `middleware`.
    pub fn veto(middleware: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MiddlewareVeto {
            middleware: middleware.into(),
            reason: reason.into(),
        }
    }

    /// Create a state error.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a checkpoint consistency error.
    pub fn inconsistent(thread_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CheckpointConsistency {
            thread_id: thread_id.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for cancellation, whether raised here or by the model.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Llm(LlmError::Cancelled))
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }

    /// Errors a tool call answers with an error message instead of failing
    /// the run.
    pub fn is_tool_recoverable(&self) -> bool {
        matches!(self, Self::Tool(_) | Self::Validation(_))
    }
}

impl From<braid_config::ConfigError> for AgentError {
    fn from(err: braid_config::ConfigError) -> Self {
        AgentError::Config(err.to_string())
    }
}

/// A failed run, carrying the state reached before the error.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: AgentError,
    pub state: AgentState,
}

impl RunFailure {
    pub fn new(error: AgentError, state: AgentState) -> Self {
        Self { error, state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::tool("failed to read file");
        assert!(err.to_string().contains("Tool error"));
        assert!(err.to_string().contains("failed to read file"));
    }

    #[test]
    fn test_veto_display() {
        let err = AgentError::veto("pii", "email address in input");
        assert_eq!(
            err.to_string(),
            "Middleware 'pii' vetoed the run: email address in input"
        );
    }

    #[test]
    fn test_cancellation_detection() {
        assert!(AgentError::Cancelled.is_cancelled());
        assert!(AgentError::Llm(LlmError::Cancelled).is_cancelled());
        assert!(!AgentError::internal("boom").is_cancelled());
    }

    #[test]
    fn test_interrupt_count_in_message() {
        let err = AgentError::Interrupted(vec![
            Interrupt::new("a", serde_json::json!(1)),
            Interrupt::new("b", serde_json::json!(2)),
        ]);
        assert!(err.is_interrupt());
        assert!(err.to_string().contains("2 pending"));
    }

    #[test]
    fn test_tool_recoverable_errors() {
        assert!(AgentError::tool("boom").is_tool_recoverable());
        assert!(AgentError::Validation(ValidationError::new("bad")).is_tool_recoverable());
        assert!(!AgentError::veto("pii", "email").is_tool_recoverable());
        assert!(!AgentError::Cancelled.is_tool_recoverable());
    }

    #[test]
    fn test_retry_exhausted_display() {
        let err = AgentError::RetryExhausted {
            attempts: 3,
            source: Box::new(AgentError::tool("flaky")),
        };
        assert_eq!(err.to_string(), "Gave up after 3 attempt(s): Tool error: flaky");
    }

    #[test]
    fn test_run_failure_keeps_state() {
        let failure = RunFailure::new(AgentError::Cancelled, AgentState::default());
        assert_eq!(failure.to_string(), "Task cancelled");
        assert!(failure.state.messages.is_empty());
    }
}
