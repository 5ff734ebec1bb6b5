//! Error types for wmhub
//!
//! Provides the unified error type used across all wmhub crates.

/// Main error type for wmhub operations
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // === Connection Errors ===

    /// Corrupt framing on the control connection. Fatal: the connection
    /// must be closed, there is no resynchronization.
    #[error("framing error: {0}")]
    Framing(String),

    /// The control connection went away while work was outstanding.
    #[error("connection to the window manager lost")]
    ConnectionLost,

    /// A command did not receive its reply in time. The connection stays
    /// open; the late reply is discarded when it arrives.
    #[error("command timed out after {ms}ms")]
    Timeout { ms: u64 },

    // === Dispatch Errors ===

    /// A handler returned an error. Contained at the task boundary, never
    /// propagated to sibling handlers.
    #[error("handler failure in extension \"{extension}\" for event \"{event}\": {message}")]
    Handler {
        extension: String,
        event: String,
        message: String,
    },

    /// Commands are refused once the hub starts draining.
    #[error("hub is shutting down")]
    ShuttingDown,

    // === Configuration Errors ===

    #[error("configuration error: {0}")]
    Config(String),

    // === Internal Errors ===

    #[error("internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Create a framing error
    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if reconnecting may resolve this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::Io(_) | Self::Framing(_))
    }
}

/// Result type alias using HubError
pub type Result<T> = std::result::Result<T, HubError>;
