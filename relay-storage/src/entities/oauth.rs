//! OAuth configuration, token, and in-flight authorization state records

use serde::{Deserialize, Serialize};

/// Per-server OAuth client configuration.
///
/// Endpoint fields are filled by metadata discovery where the provider
/// template or the operator left gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthConfigRecord {
    pub server_id: String,
    /// Provider tag: github|google|microsoft|slack|gitlab|bitbucket|custom
    pub provider: String,
    pub discovery_url: Option<String>,
    pub client_id: String,
    pub client_secret_enc: Option<String>,
    pub scopes: Vec<String>,
    pub grant_type: String,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub revocation_endpoint: Option<String>,
    pub introspection_endpoint: Option<String>,
    pub userinfo_endpoint: Option<String>,
    pub use_pkce: bool,
    pub dynamic_registration: bool,
    pub audience: Option<String>,
    /// Extra authorization-request parameters, JSON object
    pub additional_params: Option<serde_json::Value>,
    /// RFC 7591 management endpoint, when the provider returned one
    pub registration_client_uri: Option<String>,
    pub registration_access_token_enc: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Per-server OAuth token material; at most one row per server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokenRecord {
    pub server_id: String,
    pub access_token_enc: String,
    pub refresh_token_enc: Option<String>,
    pub id_token_enc: Option<String>,
    pub token_type: String,
    /// Absent means the token never auto-refreshes
    pub expires_at: Option<i64>,
    pub scopes: Option<Vec<String>>,
    pub refresh_count: i64,
    pub last_used: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Ephemeral record bridging an outgoing authorization request and its
/// redirect callback; garbage-collected after one hour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthStateRecord {
    /// Random `state` parameter, unique
    pub state: String,
    pub server_id: String,
    pub code_verifier_enc: Option<String>,
    pub code_challenge: Option<String>,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub created_at: i64,
}
