//! Error types for the MassGen coordination runtime.
//!
//! One crate-wide [`Error`] enum covers the full failure taxonomy: provider
//! failures (transient or not), context overflow, tool and hook failures,
//! protocol violations raised by workflow tools, broadcast rejections,
//! configuration errors, and cancellation. Classification helpers
//! ([`Error::is_retryable`], [`Error::is_context_overflow`]) drive the retry
//! and compression paths in the backends.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the runtime
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error (plan store, workspaces)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration; fails fast at session start
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Provider-side failure with explicit retryability
    #[error("Provider error: {message}")]
    Provider { message: String, retryable: bool },

    /// The provider rejected the request as too long
    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    /// Streaming error (malformed chunk, broken SSE frame)
    #[error("Streaming error: {0}")]
    Stream(String),

    /// Tool execution error; returned to the model, never fatal
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// A workflow-tool protocol violation (invalid vote target, answer cap, ...)
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Broadcast channel rejection (rate limit, deadlock guard, unknown request)
    #[error("Broadcast error: {0}")]
    Broadcast(String),

    /// A hook raised; absorbed by the fail-open policy and recorded
    #[error("Hook error: {0}")]
    Hook(String),

    /// The run was cancelled (restart token advanced or orchestrator shutdown)
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Timeout error
    #[error("Request timeout")]
    Timeout,

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a retryable provider error (network blip, 5xx, 429)
    pub fn provider_transient(msg: impl Into<String>) -> Self {
        Error::Provider {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (4xx, auth failure)
    pub fn provider_fatal(msg: impl Into<String>) -> Self {
        Error::Provider {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a context-overflow error
    pub fn context_overflow(msg: impl Into<String>) -> Self {
        Error::ContextOverflow(msg.into())
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a protocol-violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a broadcast error
    pub fn broadcast(msg: impl Into<String>) -> Self {
        Error::Broadcast(msg.into())
    }

    /// Create a hook error
    pub fn hook(msg: impl Into<String>) -> Self {
        Error::Hook(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Error::Cancelled(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Whether the failure is worth retrying with backoff.
    ///
    /// Transient provider errors, network failures, timeouts and stream
    /// hiccups are retryable. Context overflow is not retryable here: it is
    /// handled by the compression path, which retries exactly once after
    /// shrinking the history.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) => true,
            Error::Timeout => true,
            Error::Stream(_) => true,
            Error::Provider { retryable, .. } => *retryable,
            Error::Cancelled(_) => false,
            _ => false,
        }
    }

    /// Whether the failure is a context-window overflow.
    ///
    /// Providers phrase this differently, so in addition to the dedicated
    /// variant we recognise the common wordings inside provider messages.
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::ContextOverflow(_) => true,
            Error::Provider { message, .. } => is_overflow_message(message),
            _ => false,
        }
    }
}

/// Recognise context-overflow phrasing in a raw provider error message.
pub(crate) fn is_overflow_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("context length")
        || lower.contains("context window")
        || lower.contains("maximum context")
        || lower.contains("too many tokens")
        || lower.contains("prompt is too long")
        || lower.contains("input length")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_config() {
        let err = Error::config("missing model");
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.to_string(), "Invalid configuration: missing model");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_provider_retryability() {
        assert!(Error::provider_transient("503 upstream").is_retryable());
        assert!(!Error::provider_fatal("401 unauthorized").is_retryable());
    }

    #[test]
    fn test_context_overflow_detection() {
        assert!(Error::context_overflow("8192 tokens").is_context_overflow());
        assert!(
            Error::provider_fatal("This model's maximum context length is 8192 tokens")
                .is_context_overflow()
        );
        assert!(
            Error::provider_transient("Prompt is too long for this model").is_context_overflow()
        );
        assert!(!Error::provider_fatal("rate limited").is_context_overflow());
    }

    #[test]
    fn test_timeout_and_stream_retryable() {
        assert!(Error::timeout().is_retryable());
        assert!(Error::stream("connection reset").is_retryable());
        assert!(!Error::protocol("vote target has no answer").is_retryable());
        assert!(!Error::cancelled("restart token advanced").is_retryable());
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_protocol_error_display() {
        let err = Error::protocol("answer cap reached");
        assert_eq!(err.to_string(), "Protocol violation: answer cap reached");
    }

    #[test]
    fn test_broadcast_error_display() {
        let err = Error::broadcast("rate limit exceeded");
        assert_eq!(err.to_string(), "Broadcast error: rate limit exceeded");
    }
}
