//! Repository types over the store tables

pub mod audit;
pub mod clients;
pub mod oauth;
pub mod servers;
pub mod tokens;
pub mod tool_preferences;

pub use audit::AuditRepository;
pub use clients::ClientRepository;
pub use oauth::{AuthStateRepository, OAuthConfigRepository, OAuthTokenRepository};
pub use servers::ServerRepository;
pub use tokens::TokenRepository;
pub use tool_preferences::ToolPreferenceRepository;

/// Serialize a string list into its JSON column form
pub(crate) fn to_json_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

/// Parse a JSON column back into a string list
pub(crate) fn from_json_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}
