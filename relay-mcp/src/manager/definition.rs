//! Plaintext server definitions and their encrypted persistence form

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use relay_crypto::SecretCipher;
use relay_storage::entities::{ServerRecord, ServerType};

use crate::error::{McpError, McpResult};

/// A named, typed, defaulted input parameter for a local server
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InputParam {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// In-memory server definition with secrets in the clear.
///
/// Persistence encrypts `args`, `env`, `remote_url`, `bearer_token`, and
/// `input_params`; every one of them may carry credential material.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDefinition {
    pub id: String,
    pub name: String,
    pub server_type: ServerType,

    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,

    pub remote_url: Option<String>,
    pub bearer_token: Option<String>,

    pub input_params: HashMap<String, InputParam>,

    pub auto_start: bool,
    pub disabled: bool,
    pub latest_known_version: Option<String>,
    pub tool_permissions: Option<serde_json::Value>,
}

impl ServerDefinition {
    /// New definition with a random id
    pub fn new(name: impl Into<String>, server_type: ServerType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            server_type,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            remote_url: None,
            bearer_token: None,
            input_params: HashMap::new(),
            auto_start: false,
            disabled: false,
            latest_known_version: None,
            tool_permissions: None,
        }
    }

    /// Shape checks before persistence
    pub fn validate(&self) -> McpResult<()> {
        if self.name.trim().is_empty() {
            return Err(McpError::configuration("server name cannot be empty"));
        }
        match self.server_type {
            ServerType::Local => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err(McpError::configuration(
                        "local server requires a command",
                    ));
                }
            }
            ServerType::Remote | ServerType::RemoteStreamable => {
                let url = self.remote_url.as_deref().unwrap_or("");
                if url.is_empty() {
                    return Err(McpError::configuration("remote server requires a URL"));
                }
                url::Url::parse(url).map_err(|e| {
                    McpError::configuration(format!("invalid remote URL: {}", e))
                })?;
            }
        }
        Ok(())
    }

    /// Encrypt into the persistence form
    pub fn to_record(&self, cipher: &SecretCipher) -> McpResult<ServerRecord> {
        let now = relay_storage::now_millis();
        Ok(ServerRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            server_type: self.server_type,
            command: self.command.clone(),
            args_enc: encrypt_json(cipher, &self.args, Vec::is_empty)?,
            env_enc: encrypt_json(cipher, &self.env, HashMap::is_empty)?,
            remote_url_enc: self
                .remote_url
                .as_deref()
                .map(|v| cipher.encrypt(v))
                .transpose()?,
            bearer_token_enc: self
                .bearer_token
                .as_deref()
                .map(|v| cipher.encrypt(v))
                .transpose()?,
            input_params_enc: encrypt_json(cipher, &self.input_params, HashMap::is_empty)?,
            auto_start: self.auto_start,
            disabled: self.disabled,
            latest_known_version: self.latest_known_version.clone(),
            tool_permissions: self.tool_permissions.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Decrypt from the persistence form
    pub fn from_record(cipher: &SecretCipher, record: &ServerRecord) -> McpResult<Self> {
        Ok(Self {
            id: record.id.clone(),
            name: record.name.clone(),
            server_type: record.server_type,
            command: record.command.clone(),
            args: decrypt_json(cipher, record.args_enc.as_deref())?.unwrap_or_default(),
            env: decrypt_json(cipher, record.env_enc.as_deref())?.unwrap_or_default(),
            remote_url: record
                .remote_url_enc
                .as_deref()
                .map(|v| cipher.decrypt(v))
                .transpose()?,
            bearer_token: record
                .bearer_token_enc
                .as_deref()
                .map(|v| cipher.decrypt(v))
                .transpose()?,
            input_params: decrypt_json(cipher, record.input_params_enc.as_deref())?
                .unwrap_or_default(),
            auto_start: record.auto_start,
            disabled: record.disabled,
            latest_known_version: record.latest_known_version.clone(),
            tool_permissions: record.tool_permissions.clone(),
        })
    }
}

fn encrypt_json<T: Serialize>(
    cipher: &SecretCipher,
    value: &T,
    is_empty: impl Fn(&T) -> bool,
) -> McpResult<Option<String>> {
    if is_empty(value) {
        return Ok(None);
    }
    let json = serde_json::to_string(value)?;
    Ok(Some(cipher.encrypt(&json)?))
}

fn decrypt_json<T: for<'de> Deserialize<'de>>(
    cipher: &SecretCipher,
    ciphertext: Option<&str>,
) -> McpResult<Option<T>> {
    let Some(ciphertext) = ciphertext else {
        return Ok(None);
    };
    let json = cipher.decrypt(ciphertext)?;
    Ok(Some(serde_json::from_str(&json)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> SecretCipher {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        SecretCipher::new(key)
    }

    #[test]
    fn test_record_round_trip_preserves_secrets() {
        let cipher = cipher();
        let mut definition = ServerDefinition::new("github", ServerType::Local);
        definition.command = Some("npx".to_string());
        definition.args = vec!["--token=${GITHUB_TOKEN}".to_string()];
        definition
            .env
            .insert("GITHUB_TOKEN".to_string(), "ghp_secret".to_string());

        let record = definition.to_record(&cipher).unwrap();
        // Secrets never appear in the persisted columns
        assert!(!record.args_enc.as_deref().unwrap().contains("GITHUB_TOKEN"));
        assert!(!record.env_enc.as_deref().unwrap().contains("ghp_secret"));

        let restored = ServerDefinition::from_record(&cipher, &record).unwrap();
        assert_eq!(restored, definition);
    }

    #[test]
    fn test_validate_local_requires_command() {
        let definition = ServerDefinition::new("bad", ServerType::Local);
        assert!(definition.validate().is_err());
    }

    #[test]
    fn test_validate_remote_requires_valid_url() {
        let mut definition = ServerDefinition::new("bad", ServerType::Remote);
        assert!(definition.validate().is_err());
        definition.remote_url = Some("not a url".to_string());
        assert!(definition.validate().is_err());
        definition.remote_url = Some("https://mcp.example/sse".to_string());
        assert!(definition.validate().is_ok());
    }
}
