//! Adapter from the OAuth subsystem onto the transport header pull
//! interface
//!
//! Breaks the Server-Manager-needs-OAuth cycle: the manager pulls headers
//! through `relay_mcp::HeaderProvider`, and only this crate knows both
//! sides.

use async_trait::async_trait;
use std::sync::Arc;

use relay_mcp::error::{McpError, McpResult};
use relay_mcp::HeaderProvider;
use relay_oauth::{OAuthError, OAuthService};

/// `HeaderProvider` over the OAuth service
pub struct OAuthHeaderBridge {
    oauth: Arc<OAuthService>,
}

impl OAuthHeaderBridge {
    pub fn new(oauth: Arc<OAuthService>) -> Self {
        Self { oauth }
    }
}

/// OAuth errors cross the seam with their messages intact
fn map_oauth_error(error: OAuthError) -> McpError {
    match error {
        OAuthError::RateLimited { reset_at } => McpError::RateLimited { reset_at },
        other => McpError::OAuth {
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl HeaderProvider for OAuthHeaderBridge {
    async fn headers_for(&self, server_id: &str) -> McpResult<Option<(String, String)>> {
        self.oauth
            .headers_for(server_id)
            .await
            .map_err(map_oauth_error)
    }

    async fn refresh_headers(&self, server_id: &str) -> McpResult<Option<(String, String)>> {
        match self.oauth.refresh(server_id).await {
            Ok(access_token) => Ok(Some((
                "Authorization".to_string(),
                format!("Bearer {}", access_token),
            ))),
            Err(error) => Err(map_oauth_error(error)),
        }
    }
}
