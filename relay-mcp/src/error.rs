//! Error types for broker MCP operations

use std::time::Duration;
use thiserror::Error;

/// Result type for MCP operations
pub type McpResult<T> = Result<T, McpError>;

/// Error taxonomy surfaced by the router gate and its collaborators
#[derive(Error, Debug)]
pub enum McpError {
    /// Server/client/tool/token missing
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// Token unknown or malformed
    #[error("Unauthenticated: {message}")]
    Unauthenticated { message: String },

    /// Token lacks the target server
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// Policy resolution denies the call
    #[error("Tool disabled: {tool_name} on server {server_id}")]
    ToolDisabled {
        server_id: String,
        tool_name: String,
    },

    /// No live transport for the server
    #[error("Server not running: {server_id}")]
    ServerNotRunning { server_id: String },

    /// Error returned by the upstream transport or tool call
    #[error("Upstream error: {message}")]
    Upstream { message: String },

    /// Transport-level failure
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Connection could not be established
    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    /// Operation exceeded its deadline
    #[error("Timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Invalid server or transport configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// OAuth-layer failure, message passed through verbatim
    #[error("{message}")]
    OAuth { message: String },

    /// A governance rate limit rejected the operation
    #[error("Rate limited until {reset_at}")]
    RateLimited { reset_at: i64 },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store failure, surfaced with cause
    #[error(transparent)]
    Storage(#[from] relay_storage::StorageError),

    /// Crypto failure; never swallowed
    #[error(transparent)]
    Crypto(#[from] relay_crypto::CryptoError),
}

impl McpError {
    /// Create a not-found error
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Create an unauthenticated error
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Unauthenticated {
            message: message.into(),
        }
    }

    /// Create a forbidden error
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Create an upstream error
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a connection-failed error
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => McpError::Timeout {
                timeout: Duration::from_secs(30),
            },
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => McpError::ConnectionFailed {
                reason: err.to_string(),
            },
            _ => McpError::Transport {
                message: err.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            McpError::Timeout {
                timeout: Duration::from_secs(30),
            }
        } else if err.is_connect() {
            McpError::ConnectionFailed {
                reason: err.to_string(),
            }
        } else {
            McpError::Transport {
                message: err.to_string(),
            }
        }
    }
}
