//! Upstream server records

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// How an upstream server is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerType {
    /// Child process over stdio
    #[serde(rename = "local")]
    Local,

    /// Remote SSE endpoint
    #[serde(rename = "remote")]
    Remote,

    /// Remote streamable-HTTP endpoint
    #[serde(rename = "remote-streamable")]
    RemoteStreamable,
}

impl ServerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerType::Local => "local",
            ServerType::Remote => "remote",
            ServerType::RemoteStreamable => "remote-streamable",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StorageError> {
        match value {
            "local" => Ok(ServerType::Local),
            "remote" => Ok(ServerType::Remote),
            "remote-streamable" => Ok(ServerType::RemoteStreamable),
            other => Err(StorageError::Constraint(format!(
                "unknown server type '{}'",
                other
            ))),
        }
    }
}

/// Persisted upstream server definition.
///
/// `args_enc`, `env_enc`, `remote_url_enc`, `bearer_token_enc`, and
/// `input_params_enc` are encrypted JSON/string blobs; decryption happens in
/// the server manager, never here.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRecord {
    pub id: String,
    /// Unique display name; external systems may address by it
    pub name: String,
    pub server_type: ServerType,

    /// Executable for local servers
    pub command: Option<String>,
    /// Encrypted JSON array of command arguments
    pub args_enc: Option<String>,
    /// Encrypted JSON object of environment variables
    pub env_enc: Option<String>,

    /// Encrypted endpoint URL for remote variants
    pub remote_url_enc: Option<String>,
    /// Encrypted pre-configured bearer token for remote variants
    pub bearer_token_enc: Option<String>,

    /// Encrypted JSON object of named, typed, defaulted input parameters
    pub input_params_enc: Option<String>,

    pub auto_start: bool,
    pub disabled: bool,
    pub latest_known_version: Option<String>,
    /// JSON blob of per-tool permission hints
    pub tool_permissions: Option<serde_json::Value>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl ServerRecord {
    /// Construct a record with fresh timestamps and a random id
    pub fn new(name: impl Into<String>, server_type: ServerType) -> Self {
        let now = crate::now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            server_type,
            command: None,
            args_enc: None,
            env_enc: None,
            remote_url_enc: None,
            bearer_token_enc: None,
            input_params_enc: None,
            auto_start: false,
            disabled: false,
            latest_known_version: None,
            tool_permissions: None,
            created_at: now,
            updated_at: now,
        }
    }
}
