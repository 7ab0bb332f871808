//! Error types for the LLM crate.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using the LLM error type.
pub type Result<T> = std::result::Result<T, LlmError>;

// ─────────────────────────────────────────────────────────────────────────────
// Rate Limit Info
// ─────────────────────────────────────────────────────────────────────────────

/// Information about a rate limit error.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    /// The error message from the provider.
    pub message: String,
    /// How long to wait before retrying (if the provider specified).
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    /// Create a new rate limit info with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Create a rate limit info with a retry duration.
    pub fn with_retry_after(message: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }
}

impl std::fmt::Display for RateLimitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(retry_after) = self.retry_after {
            write!(f, " (retry after {:.2}s)", retry_after.as_secs_f64())?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Translation Errors
// ─────────────────────────────────────────────────────────────────────────────

/// A provider payload violated the native schema a translator declares.
///
/// Raised only after a native tag matched a rule; unknown shapes never
/// produce this error, they become `non_standard` blocks instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TranslationError {
    /// A field the native schema marks mandatory is absent.
    #[error("{provider}: '{tag}' block is missing required field '{field}'")]
    MissingField {
        provider: &'static str,
        tag: String,
        field: &'static str,
    },

    /// A field is present but has the wrong shape.
    #[error("{provider}: '{tag}' block has invalid field '{field}': {reason}")]
    InvalidField {
        provider: &'static str,
        tag: String,
        field: &'static str,
        reason: String,
    },

    /// A canonical block has no native representation for this provider.
    #[error("{provider}: cannot express canonical '{block_type}' block: {reason}")]
    Unsupported {
        provider: &'static str,
        block_type: &'static str,
        reason: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Block Validation Errors
// ─────────────────────────────────────────────────────────────────────────────

/// A canonical content block violates a shape invariant.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BlockValidationError {
    /// Inline media without a mime type.
    #[error("{block_type} block with inline data must declare a mime type")]
    MissingMimeType { block_type: &'static str },

    /// A citation span whose start lies after its end.
    #[error("citation {index} has start_index {start} after end_index {end}")]
    InvalidCitationSpan { index: usize, start: u64, end: u64 },

    /// A tool call or tool result without an id.
    #[error("{block_type} block has an empty id")]
    EmptyId { block_type: &'static str },
}

// ─────────────────────────────────────────────────────────────────────────────
// Merge Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Two chunks could not be merged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MergeError {
    /// Chunks of different message kinds.
    #[error("cannot merge a {left} chunk with a {right} chunk")]
    KindMismatch {
        left: &'static str,
        right: &'static str,
    },

    /// Tool message chunks bound to different tool calls.
    #[error("cannot merge tool chunks for '{left}' and '{right}'")]
    ToolCallIdMismatch { left: String, right: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// LLM Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error type for model operations.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Backend/API error from the provider.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Network/connectivity error (retryable).
    #[error("Network error: {0}")]
    Network(String),

    /// Configuration error (API key missing, etc.).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid request parameters.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Rate limit exceeded (retryable with backoff).
    #[error("Rate limit exceeded: {0}")]
    RateLimit(RateLimitInfo),

    /// Authentication failed.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Provider content could not be translated.
    #[error("Translation error: {0}")]
    Translation(#[from] TranslationError),

    /// Streamed chunks could not be merged.
    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    /// The call was cancelled before it completed.
    #[error("Request cancelled")]
    Cancelled,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LlmError {
    /// Create a rate limit error from a message string.
    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::RateLimit(RateLimitInfo::new(message))
    }

    /// Create a rate limit error with retry timing.
    pub fn rate_limit_with_retry(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::RateLimit(RateLimitInfo::with_retry_after(message, retry_after))
    }

    /// Get the retry-after duration if this is a rate limit error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit(info) => info.retry_after,
            _ => None,
        }
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimit(_))
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::Serialization(err.to_string())
    }
}
