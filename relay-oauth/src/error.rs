//! OAuth error types

use thiserror::Error;

/// Result type for OAuth operations
pub type OAuthResult<T> = Result<T, OAuthError>;

/// What went wrong during a browser-driven authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowErrorKind {
    /// The user closed the window or the provider reported access denied
    Cancelled,
    /// The redirect carried an unknown `state` value
    StateMismatch,
    /// The hard flow timeout elapsed
    Timeout,
    /// The provider returned an error, or the flow could not start
    ProviderError,
}

impl FlowErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowErrorKind::Cancelled => "cancelled",
            FlowErrorKind::StateMismatch => "state_mismatch",
            FlowErrorKind::Timeout => "timeout",
            FlowErrorKind::ProviderError => "provider_error",
        }
    }
}

/// What went wrong with stored token material
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenErrorKind {
    /// The token is expired and cannot be refreshed
    Expired,
    /// The provider rejected the refresh token; terminal
    InvalidGrant,
    /// Refresh failed after retries
    RefreshFailed,
}

impl TokenErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenErrorKind::Expired => "expired",
            TokenErrorKind::InvalidGrant => "invalid_grant",
            TokenErrorKind::RefreshFailed => "refresh_failed",
        }
    }
}

/// Errors surfaced by the OAuth subsystem
#[derive(Error, Debug)]
pub enum OAuthError {
    /// Endpoints incomplete or discovery failed
    #[error("OAuth configuration error: {message}")]
    Configuration { message: String },

    /// Browser-driven authorization failure
    #[error("OAuth flow failed ({}): {message}", kind.as_str())]
    Flow {
        kind: FlowErrorKind,
        message: String,
    },

    /// Token lifecycle failure
    #[error("OAuth token error ({}) for server {server_id}: {message}", kind.as_str())]
    Token {
        kind: TokenErrorKind,
        server_id: String,
        message: String,
    },

    /// A governance rate limit rejected the operation
    #[error("Rate limited until {reset_at}")]
    RateLimited { reset_at: i64 },

    /// Store failure
    #[error(transparent)]
    Storage(#[from] relay_storage::StorageError),

    /// Crypto failure; never swallowed
    #[error(transparent)]
    Crypto(#[from] relay_crypto::CryptoError),

    /// Outbound HTTP failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Governance file I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// OAuth dataset migration failure
    #[error("OAuth data migration failed: {message}")]
    Migration { message: String },
}

impl OAuthError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a flow error
    pub fn flow(kind: FlowErrorKind, message: impl Into<String>) -> Self {
        Self::Flow {
            kind,
            message: message.into(),
        }
    }

    /// Create a token error
    pub fn token(
        kind: TokenErrorKind,
        server_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Token {
            kind,
            server_id: server_id.into(),
            message: message.into(),
        }
    }

    /// Create a migration error
    pub fn migration(message: impl Into<String>) -> Self {
        Self::Migration {
            message: message.into(),
        }
    }
}
