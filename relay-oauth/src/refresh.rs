//! Token refresh lifecycle
//!
//! Refreshes for a fixed server are at-most-one concurrent: callers join
//! an in-flight shared future instead of issuing a second token-endpoint
//! exchange. Terminal `invalid_grant` deletes the token row.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use std::time::Duration;

use relay_storage::entities::{AuditSeverity, OAuthTokenRecord};

use crate::audit::events;
use crate::error::{OAuthError, OAuthResult, TokenErrorKind};
use crate::rate_limit::Operation;
use crate::service::{OAuthService, OAuthStatus, RelayTokenResponse};

/// A refresh outcome shared between coalesced callers
pub(crate) type SharedRefresh =
    Shared<BoxFuture<'static, Result<String, Arc<OAuthError>>>>;

/// How long before expiry a token is refreshed proactively
fn refresh_due(record: &OAuthTokenRecord, margin: Duration) -> bool {
    match record.expires_at {
        Some(expires_at) => {
            expires_at - relay_storage::now_millis() <= margin.as_millis() as i64
        }
        // No expiry: never auto-refreshes, still callable
        None => false,
    }
}

impl OAuthService {
    /// Return a live access token for a server, or `None` when the server
    /// holds no token.
    ///
    /// A token inside the refresh margin (or past expiry) is refreshed
    /// first; an expired token is never handed out without a refresh
    /// attempt.
    pub async fn get_access_token(
        self: &Arc<Self>,
        server_id: &str,
    ) -> OAuthResult<Option<String>> {
        let Some(record) = self.store.oauth_tokens().get(server_id).await? else {
            return Ok(None);
        };

        if refresh_due(&record, self.settings.refresh_margin) {
            return self.refresh_coalesced(server_id).await.map(Some);
        }

        let access_token = self.cipher.decrypt(&record.access_token_enc)?;
        self.store.oauth_tokens().touch_last_used(server_id).await?;
        Ok(Some(access_token))
    }

    /// Explicit refresh, same coalescing path
    pub async fn refresh(self: &Arc<Self>, server_id: &str) -> OAuthResult<String> {
        self.refresh_coalesced(server_id).await
    }

    /// Join the in-flight refresh for this server, or install one
    ///
    /// Returns a boxed future (rather than `async fn`) because this method
    /// is mutually recursive with `arm_refresh_timer`'s spawned task, and
    /// rustc cannot infer the `Send`-ness of a recursive `impl Future`
    /// opaque type across that cycle.
    pub(crate) fn refresh_coalesced<'a>(
        self: &'a Arc<Self>,
        server_id: &'a str,
    ) -> BoxFuture<'a, OAuthResult<String>> {
        async move {
            let shared = {
                let mut inflight = self.inflight.lock().await;
                match inflight.get(server_id) {
                    Some(existing) => existing.clone(),
                    None => {
                        let service = self.clone();
                        let sid = server_id.to_string();
                        let future: SharedRefresh = async move {
                            service.do_refresh(&sid).await.map_err(Arc::new)
                        }
                        .boxed()
                        .shared();
                        inflight.insert(server_id.to_string(), future.clone());
                        future
                    }
                }
            };

            let outcome = shared.await;
            self.inflight.lock().await.remove(server_id);
            outcome.map_err(|error| unshare_error(&error, server_id))
        }
        .boxed()
    }

    /// One full refresh: rate-limit gate, token-endpoint exchange with
    /// bounded retries, row update, timer re-arm
    async fn do_refresh(self: &Arc<Self>, server_id: &str) -> OAuthResult<String> {
        self.limiter
            .check(Operation::Refresh, server_id, &self.audit)
            .await?;

        let record = self
            .store
            .oauth_tokens()
            .get(server_id)
            .await?
            .ok_or_else(|| {
                OAuthError::token(TokenErrorKind::RefreshFailed, server_id, "no token row")
            })?;

        let Some(refresh_token_enc) = record.refresh_token_enc.as_deref() else {
            // Without a refresh token an expired row is terminal
            self.audit
                .log(
                    events::TOKEN_EXPIRED,
                    AuditSeverity::Warning,
                    Some(server_id),
                    serde_json::json!({"reason": "no refresh token"}),
                )
                .await;
            return Err(OAuthError::token(
                TokenErrorKind::Expired,
                server_id,
                "token expired and no refresh token is stored",
            ));
        };
        let refresh_token = self.cipher.decrypt(refresh_token_enc)?;

        let config = self.require_config(server_id).await?;
        let token_endpoint = config
            .token_endpoint
            .clone()
            .ok_or_else(|| OAuthError::configuration("token endpoint missing"))?;
        let client_secret = config
            .client_secret_enc
            .as_deref()
            .map(|enc| self.cipher.decrypt(enc))
            .transpose()?;

        self.set_status(server_id, OAuthStatus::Refreshing).await;

        let mut last_error = String::new();
        for attempt in 1..=self.retry.max_attempts {
            match self
                .refresh_exchange(
                    &token_endpoint,
                    &config.client_id,
                    client_secret.as_deref(),
                    &refresh_token,
                )
                .await
            {
                Ok(response) => {
                    let updated =
                        self.token_record_from_response(server_id, &response, Some(&record))?;
                    self.store.oauth_tokens().upsert(&updated).await?;
                    self.set_status(server_id, OAuthStatus::Authenticated).await;
                    self.audit
                        .log(
                            events::TOKEN_REFRESHED,
                            AuditSeverity::Info,
                            Some(server_id),
                            serde_json::json!({
                                "refresh_count": updated.refresh_count,
                                "expires_at": updated.expires_at,
                            }),
                        )
                        .await;
                    self.arm_refresh_timer(server_id, updated.expires_at).await;
                    return self
                        .cipher
                        .decrypt(&updated.access_token_enc)
                        .map_err(Into::into);
                }
                Err(RefreshExchangeError::InvalidGrant(message)) => {
                    // Terminal: the provider will never honor this token again
                    self.cancel_timer(server_id).await;
                    self.store.oauth_tokens().delete(server_id).await?;
                    self.set_status(server_id, OAuthStatus::Failed).await;
                    self.audit
                        .log(
                            events::AUTHENTICATION_FAILED,
                            AuditSeverity::Error,
                            Some(server_id),
                            serde_json::json!({"error": "invalid_grant", "detail": message}),
                        )
                        .await;
                    return Err(OAuthError::token(
                        TokenErrorKind::InvalidGrant,
                        server_id,
                        message,
                    ));
                }
                Err(RefreshExchangeError::Transient(message)) => {
                    last_error = message;
                    if attempt < self.retry.max_attempts {
                        let delay = self.retry.delay_for_attempt(attempt);
                        tracing::warn!(
                            server_id,
                            attempt,
                            ?delay,
                            error = %last_error,
                            "token refresh attempt failed"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.set_status(server_id, OAuthStatus::Failed).await;
        self.audit
            .log(
                events::AUTHENTICATION_FAILED,
                AuditSeverity::Error,
                Some(server_id),
                serde_json::json!({"error": "refresh_failed", "detail": last_error}),
            )
            .await;
        Err(OAuthError::token(
            TokenErrorKind::RefreshFailed,
            server_id,
            format!(
                "refresh failed after {} attempts: {}",
                self.retry.max_attempts, last_error
            ),
        ))
    }

    async fn refresh_exchange(
        &self,
        token_endpoint: &str,
        client_id: &str,
        client_secret: Option<&str>,
        refresh_token: &str,
    ) -> Result<RelayTokenResponse, RefreshExchangeError> {
        let mut params: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
        ];
        if let Some(secret) = client_secret {
            params.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(token_endpoint)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| RefreshExchangeError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<RelayTokenResponse>()
                .await
                .map_err(|e| RefreshExchangeError::Transient(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() && body.contains("invalid_grant") {
            Err(RefreshExchangeError::InvalidGrant(body))
        } else {
            Err(RefreshExchangeError::Transient(format!(
                "status {}: {}",
                status, body
            )))
        }
    }

    /// Re-arm the proactive refresh timer five minutes before expiry
    pub(crate) async fn arm_refresh_timer(
        self: &Arc<Self>,
        server_id: &str,
        expires_at: Option<i64>,
    ) {
        self.cancel_timer(server_id).await;
        let Some(expires_at) = expires_at else {
            return;
        };

        let lead = self.settings.refresh_margin.as_millis() as i64;
        let delay_millis = (expires_at - relay_storage::now_millis() - lead).max(0);
        let service = self.clone();
        let sid = server_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_millis as u64)).await;
            // Deregister first: the refresh re-arms the timer, and the
            // cancel inside that path must not abort this very task
            service.timers.lock().await.remove(&sid);
            if let Err(error) = service.refresh_coalesced(&sid).await {
                tracing::warn!(server_id = %sid, %error, "scheduled refresh failed");
            }
        });

        self.timers.lock().await.insert(server_id.to_string(), handle);
    }
}

enum RefreshExchangeError {
    /// The provider rejected the refresh token; terminal
    InvalidGrant(String),
    /// Anything that might succeed on retry
    Transient(String),
}

/// Convert a shared (Arc-wrapped) refresh error back into an owned error
fn unshare_error(error: &Arc<OAuthError>, server_id: &str) -> OAuthError {
    match error.as_ref() {
        OAuthError::Token {
            kind,
            server_id,
            message,
        } => OAuthError::token(*kind, server_id.clone(), message.clone()),
        OAuthError::RateLimited { reset_at } => OAuthError::RateLimited {
            reset_at: *reset_at,
        },
        OAuthError::Configuration { message } => OAuthError::configuration(message.clone()),
        other => OAuthError::token(TokenErrorKind::RefreshFailed, server_id, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_due_margin() {
        let now = relay_storage::now_millis();
        let mut record = OAuthTokenRecord {
            server_id: "s".to_string(),
            access_token_enc: String::new(),
            refresh_token_enc: None,
            id_token_enc: None,
            token_type: "Bearer".to_string(),
            expires_at: Some(now + 10 * 60 * 1000),
            scopes: None,
            refresh_count: 0,
            last_used: now,
            created_at: now,
            updated_at: now,
        };
        assert!(!refresh_due(&record, Duration::from_secs(300)));

        record.expires_at = Some(now + 60 * 1000);
        assert!(refresh_due(&record, Duration::from_secs(300)));

        record.expires_at = Some(now - 1000);
        assert!(refresh_due(&record, Duration::from_secs(300)));

        record.expires_at = None;
        assert!(!refresh_due(&record, Duration::from_secs(300)));
    }
}
