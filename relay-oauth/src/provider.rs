//! Well-known provider templates

use serde::{Deserialize, Serialize};

/// Supported OAuth providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    GitHub,
    Google,
    Microsoft,
    Slack,
    GitLab,
    Bitbucket,
    Custom,
}

/// Static endpoint and scope defaults for a provider
#[derive(Debug, Clone, Default)]
pub struct ProviderTemplate {
    pub authorization_endpoint: Option<&'static str>,
    pub token_endpoint: Option<&'static str>,
    pub revocation_endpoint: Option<&'static str>,
    pub default_scopes: &'static [&'static str],
    /// Whether the provider is known to support PKCE for public clients
    pub use_pkce: bool,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GitHub => "github",
            Provider::Google => "google",
            Provider::Microsoft => "microsoft",
            Provider::Slack => "slack",
            Provider::GitLab => "gitlab",
            Provider::Bitbucket => "bitbucket",
            Provider::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "github" => Provider::GitHub,
            "google" => Provider::Google,
            "microsoft" => Provider::Microsoft,
            "slack" => Provider::Slack,
            "gitlab" => Provider::GitLab,
            "bitbucket" => Provider::Bitbucket,
            _ => Provider::Custom,
        }
    }

    /// Template of well-known endpoints and default scopes
    pub fn template(&self) -> ProviderTemplate {
        match self {
            Provider::GitHub => ProviderTemplate {
                authorization_endpoint: Some("https://github.com/login/oauth/authorize"),
                token_endpoint: Some("https://github.com/login/oauth/access_token"),
                revocation_endpoint: None,
                default_scopes: &["read:user"],
                use_pkce: true,
            },
            Provider::Google => ProviderTemplate {
                authorization_endpoint: Some("https://accounts.google.com/o/oauth2/v2/auth"),
                token_endpoint: Some("https://oauth2.googleapis.com/token"),
                revocation_endpoint: Some("https://oauth2.googleapis.com/revoke"),
                default_scopes: &["openid", "email", "profile"],
                use_pkce: true,
            },
            Provider::Microsoft => ProviderTemplate {
                authorization_endpoint: Some(
                    "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
                ),
                token_endpoint: Some(
                    "https://login.microsoftonline.com/common/oauth2/v2.0/token",
                ),
                revocation_endpoint: None,
                default_scopes: &["openid", "profile", "offline_access"],
                use_pkce: true,
            },
            Provider::Slack => ProviderTemplate {
                authorization_endpoint: Some("https://slack.com/oauth/v2/authorize"),
                token_endpoint: Some("https://slack.com/api/oauth.v2.access"),
                revocation_endpoint: Some("https://slack.com/api/auth.revoke"),
                default_scopes: &[],
                use_pkce: false,
            },
            Provider::GitLab => ProviderTemplate {
                authorization_endpoint: Some("https://gitlab.com/oauth/authorize"),
                token_endpoint: Some("https://gitlab.com/oauth/token"),
                revocation_endpoint: Some("https://gitlab.com/oauth/revoke"),
                default_scopes: &["read_user"],
                use_pkce: true,
            },
            Provider::Bitbucket => ProviderTemplate {
                authorization_endpoint: Some("https://bitbucket.org/site/oauth2/authorize"),
                token_endpoint: Some("https://bitbucket.org/site/oauth2/access_token"),
                revocation_endpoint: None,
                default_scopes: &["account"],
                use_pkce: false,
            },
            Provider::Custom => ProviderTemplate {
                use_pkce: true,
                ..ProviderTemplate::default()
            },
        }
    }
}
