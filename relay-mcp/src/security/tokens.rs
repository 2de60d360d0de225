//! Client bearer token issuance and validation
//!
//! The token id is the credential. This service is the single source of
//! truth for whether a token exists and which servers it can see.

use relay_crypto::hashing::constant_time_eq;
use relay_storage::entities::ClientToken;
use relay_storage::Store;

use crate::error::{McpError, McpResult};

/// Length in bytes of generated token ids
const TOKEN_BYTES: usize = 32;

/// Issues, lists, revokes, and validates client bearer tokens
pub struct TokenService {
    store: Store,
}

impl TokenService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Issue a token for a client over an explicit server set.
    ///
    /// An empty `server_ids` is allowed and grants access to nothing.
    pub async fn generate(
        &self,
        client_id: &str,
        server_ids: Vec<String>,
    ) -> McpResult<ClientToken> {
        if self.store.clients().get(client_id).await?.is_none() {
            return Err(McpError::not_found("client", client_id));
        }
        for server_id in &server_ids {
            if self.store.servers().get(server_id).await?.is_none() {
                return Err(McpError::not_found("server", server_id));
            }
        }

        let token = ClientToken {
            id: relay_crypto::random_token(TOKEN_BYTES),
            client_id: client_id.to_string(),
            server_ids,
            scopes: Vec::new(),
            issued_at: relay_storage::now_millis(),
        };
        self.store.tokens().insert(&token).await?;
        tracing::info!(client_id, "client token issued");
        Ok(token)
    }

    /// Revoke a token; returns whether it existed
    pub async fn revoke(&self, token_id: &str) -> McpResult<bool> {
        Ok(self.store.tokens().delete(token_id).await?)
    }

    /// List the tokens issued to one client
    pub async fn list_by_client(&self, client_id: &str) -> McpResult<Vec<ClientToken>> {
        Ok(self.store.tokens().list_by_client(client_id).await?)
    }

    /// Validate a presented credential.
    ///
    /// The stored id is compared in constant time; an unknown or malformed
    /// credential is `Unauthenticated`.
    pub async fn validate(&self, presented: &str) -> McpResult<ClientToken> {
        if presented.is_empty() {
            return Err(McpError::unauthenticated("empty token"));
        }

        let token = self
            .store
            .tokens()
            .get(presented)
            .await?
            .ok_or_else(|| McpError::unauthenticated("unknown token"))?;

        if !constant_time_eq(presented, &token.id) {
            return Err(McpError::unauthenticated("unknown token"));
        }
        Ok(token)
    }
}
