//! OAuth service: configuration, authorization, and header injection

use oauth2::basic::BasicTokenType;
use oauth2::{ExtraTokenFields, StandardTokenResponse, TokenResponse};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use relay_config::domains::oauth::OAuthConfig as OAuthSettings;
use relay_crypto::SecretCipher;
use relay_storage::entities::{AuditSeverity, AuthStateRecord, OAuthConfigRecord, OAuthTokenRecord};
use relay_storage::Store;

use crate::audit::{events, AuditLogger};
use crate::discovery::DiscoveryClient;
use crate::error::{OAuthError, OAuthResult};
use crate::flow::{interpret_callback, BrowserOpener, CallbackListener};
use crate::provider::Provider;
use crate::rate_limit::{Operation, RateLimiter};
use crate::refresh::SharedRefresh;
use crate::registration;
use crate::retry::RetryPolicy;

/// Extra token-response fields beyond the standard set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl ExtraTokenFields for IdTokenFields {}

/// Token-endpoint response shape
pub(crate) type RelayTokenResponse = StandardTokenResponse<IdTokenFields, BasicTokenType>;

/// Lifecycle state of a server's OAuth relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthStatus {
    Unconfigured,
    Configured,
    Authorizing,
    Authenticated,
    Refreshing,
    Failed,
    Revoked,
}

/// Operator-supplied overrides merged over a provider template
#[derive(Debug, Clone, Default)]
pub struct OAuthSetup {
    pub discovery_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub revocation_endpoint: Option<String>,
    pub audience: Option<String>,
    pub additional_params: Option<serde_json::Value>,
    pub use_pkce: Option<bool>,
    pub dynamic_registration: Option<bool>,
}

/// OAuth core service.
///
/// Owns the per-server state map, the in-flight refresh map, and the
/// refresh timers. Constructed once at startup and shared as an `Arc`.
pub struct OAuthService {
    pub(crate) store: Store,
    pub(crate) cipher: Arc<SecretCipher>,
    pub(crate) http: reqwest::Client,
    pub(crate) settings: OAuthSettings,
    pub(crate) discovery: DiscoveryClient,
    pub(crate) audit: Arc<AuditLogger>,
    pub(crate) limiter: RateLimiter,
    pub(crate) browser: Arc<dyn BrowserOpener>,
    pub(crate) retry: RetryPolicy,
    pub(crate) status: RwLock<HashMap<String, OAuthStatus>>,
    pub(crate) inflight: Mutex<HashMap<String, SharedRefresh>>,
    pub(crate) timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl OAuthService {
    pub fn new(
        store: Store,
        cipher: Arc<SecretCipher>,
        settings: OAuthSettings,
        audit: Arc<AuditLogger>,
        limiter: RateLimiter,
        browser: Arc<dyn BrowserOpener>,
    ) -> OAuthResult<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .build()?;

        Ok(Arc::new(Self {
            store,
            cipher,
            discovery: DiscoveryClient::new(http.clone()),
            http,
            retry: RetryPolicy {
                max_attempts: settings.max_refresh_attempts,
                ..RetryPolicy::default()
            },
            settings,
            audit,
            limiter,
            browser,
            status: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
        }))
    }

    pub(crate) async fn set_status(&self, server_id: &str, status: OAuthStatus) {
        self.status
            .write()
            .await
            .insert(server_id.to_string(), status);
    }

    /// Current lifecycle state; derived from persisted rows when nothing
    /// transient is tracked in memory
    pub async fn status(&self, server_id: &str) -> OAuthResult<OAuthStatus> {
        if let Some(status) = self.status.read().await.get(server_id) {
            return Ok(*status);
        }
        if self.store.oauth_tokens().get(server_id).await?.is_some() {
            return Ok(OAuthStatus::Authenticated);
        }
        if self.store.oauth_configs().get(server_id).await?.is_some() {
            return Ok(OAuthStatus::Configured);
        }
        Ok(OAuthStatus::Unconfigured)
    }

    /// Merge a provider template with overrides, fill endpoint gaps via
    /// discovery, and register a client dynamically when asked and needed.
    /// Calling twice with the same input persists the same configuration.
    pub async fn configure(
        &self,
        server_id: &str,
        provider: Provider,
        setup: OAuthSetup,
    ) -> OAuthResult<OAuthConfigRecord> {
        self.limiter
            .check(Operation::General, server_id, &self.audit)
            .await?;

        let now = relay_storage::now_millis();
        let existing = self.store.oauth_configs().get(server_id).await?;
        let template = provider.template();

        let mut record = existing.unwrap_or(OAuthConfigRecord {
            server_id: server_id.to_string(),
            provider: provider.as_str().to_string(),
            discovery_url: None,
            client_id: String::new(),
            client_secret_enc: None,
            scopes: template
                .default_scopes
                .iter()
                .map(|s| s.to_string())
                .collect(),
            grant_type: "authorization_code".to_string(),
            authorization_endpoint: template.authorization_endpoint.map(String::from),
            token_endpoint: template.token_endpoint.map(String::from),
            revocation_endpoint: template.revocation_endpoint.map(String::from),
            introspection_endpoint: None,
            userinfo_endpoint: None,
            use_pkce: template.use_pkce,
            dynamic_registration: false,
            audience: None,
            additional_params: None,
            registration_client_uri: None,
            registration_access_token_enc: None,
            created_at: now,
            updated_at: now,
        });
        record.provider = provider.as_str().to_string();
        record.updated_at = now;

        if let Some(discovery_url) = setup.discovery_url {
            record.discovery_url = Some(discovery_url);
        }
        if let Some(client_id) = setup.client_id {
            record.client_id = client_id;
        }
        if let Some(client_secret) = setup.client_secret {
            record.client_secret_enc = Some(self.cipher.encrypt(&client_secret)?);
        }
        if let Some(scopes) = setup.scopes {
            record.scopes = scopes;
        }
        if let Some(endpoint) = setup.authorization_endpoint {
            record.authorization_endpoint = Some(endpoint);
        }
        if let Some(endpoint) = setup.token_endpoint {
            record.token_endpoint = Some(endpoint);
        }
        if let Some(endpoint) = setup.revocation_endpoint {
            record.revocation_endpoint = Some(endpoint);
        }
        if let Some(audience) = setup.audience {
            record.audience = Some(audience);
        }
        if let Some(params) = setup.additional_params {
            record.additional_params = Some(params);
        }
        if let Some(use_pkce) = setup.use_pkce {
            record.use_pkce = use_pkce;
        }
        if let Some(dynamic_registration) = setup.dynamic_registration {
            record.dynamic_registration = dynamic_registration;
        }

        // Discovery fills whatever is still missing
        let needs_discovery =
            record.authorization_endpoint.is_none() || record.token_endpoint.is_none();
        let mut registration_endpoint = None;
        if let Some(base) = record.discovery_url.clone() {
            if needs_discovery || record.dynamic_registration {
                match self.discovery.discover(&base).await {
                    Ok(metadata) => {
                        if record.authorization_endpoint.is_none() {
                            record.authorization_endpoint = metadata.authorization_endpoint;
                        }
                        if record.token_endpoint.is_none() {
                            record.token_endpoint = metadata.token_endpoint;
                        }
                        if record.revocation_endpoint.is_none() {
                            record.revocation_endpoint = metadata.revocation_endpoint;
                        }
                        if record.introspection_endpoint.is_none() {
                            record.introspection_endpoint = metadata.introspection_endpoint;
                        }
                        if record.userinfo_endpoint.is_none() {
                            record.userinfo_endpoint = metadata.userinfo_endpoint;
                        }
                        registration_endpoint = metadata.registration_endpoint;
                    }
                    Err(error) if needs_discovery => return Err(error),
                    Err(error) => {
                        tracing::debug!(%error, "optional discovery failed");
                    }
                }
            }
        }

        if record.authorization_endpoint.is_none() || record.token_endpoint.is_none() {
            return Err(OAuthError::configuration(format!(
                "endpoints incomplete for server {}: authorization or token endpoint missing",
                server_id
            )));
        }

        // Dynamic client registration mints credentials when none were given
        if record.dynamic_registration && record.client_id.is_empty() {
            let endpoint = registration_endpoint.ok_or_else(|| {
                OAuthError::configuration(
                    "dynamic registration requested but the provider announced no \
                     registration endpoint",
                )
            })?;
            let registered = registration::register(
                &self.http,
                &endpoint,
                "relay-broker",
                self.settings.callback_port,
                &record.scopes,
            )
            .await?;
            record.client_id = registered.client_id;
            if let Some(secret) = registered.client_secret {
                record.client_secret_enc = Some(self.cipher.encrypt(&secret)?);
            }
            record.registration_client_uri = registered.registration_client_uri;
            if let Some(token) = registered.registration_access_token {
                record.registration_access_token_enc = Some(self.cipher.encrypt(&token)?);
            }
        }

        self.store.oauth_configs().upsert(&record).await?;
        self.set_status(server_id, OAuthStatus::Configured).await;
        self.audit
            .log(
                events::CONFIGURATION_CHANGED,
                AuditSeverity::Info,
                Some(server_id),
                serde_json::json!({
                    "provider": record.provider,
                    "use_pkce": record.use_pkce,
                    "dynamic_registration": record.dynamic_registration,
                }),
            )
            .await;

        Ok(record)
    }

    /// Remove the OAuth configuration (and token) for a server
    pub async fn deconfigure(&self, server_id: &str) -> OAuthResult<()> {
        self.cancel_timer(server_id).await;
        self.store.oauth_tokens().delete(server_id).await?;
        self.store.oauth_configs().delete(server_id).await?;
        self.store.auth_states().delete_for_server(server_id).await?;
        self.set_status(server_id, OAuthStatus::Unconfigured).await;
        self.audit
            .log(
                events::CONFIGURATION_DELETED,
                AuditSeverity::Info,
                Some(server_id),
                serde_json::json!({}),
            )
            .await;
        Ok(())
    }

    /// Run the browser-driven authorization-code flow for a server.
    ///
    /// Returns once the redirect has been exchanged and the token row is
    /// persisted. Hard timeout, cancellation, and state mismatch surface
    /// as flow errors.
    pub async fn authenticate(
        self: &Arc<Self>,
        server_id: &str,
        scopes: Option<Vec<String>>,
    ) -> OAuthResult<()> {
        self.limiter
            .check(Operation::Auth, server_id, &self.audit)
            .await?;

        let config = self.require_config(server_id).await?;
        if config.client_id.is_empty() {
            return Err(OAuthError::configuration(format!(
                "server {} has no OAuth client id",
                server_id
            )));
        }

        let scopes = scopes.unwrap_or_else(|| config.scopes.clone());
        let state = relay_crypto::random_token(32);
        let redirect_uri = format!(
            "http://localhost:{}/oauth/callback",
            self.settings.callback_port
        );

        let (verifier, challenge) = if config.use_pkce {
            let verifier = relay_crypto::random_token(64);
            let challenge = relay_crypto::pkce_challenge(&verifier);
            (Some(verifier), Some(challenge))
        } else {
            (None, None)
        };

        let auth_state = AuthStateRecord {
            state: state.clone(),
            server_id: server_id.to_string(),
            code_verifier_enc: verifier
                .as_deref()
                .map(|v| self.cipher.encrypt(v))
                .transpose()?,
            code_challenge: challenge.clone(),
            redirect_uri: redirect_uri.clone(),
            scopes: scopes.clone(),
            created_at: relay_storage::now_millis(),
        };
        self.store.auth_states().insert(&auth_state).await?;

        self.set_status(server_id, OAuthStatus::Authorizing).await;
        self.audit
            .log(
                events::AUTHENTICATION_STARTED,
                AuditSeverity::Info,
                Some(server_id),
                serde_json::json!({"scopes": scopes}),
            )
            .await;

        let result = self
            .drive_authorization(server_id, &config, &state, &redirect_uri, &scopes, challenge)
            .await;

        match result {
            Ok(()) => {
                self.set_status(server_id, OAuthStatus::Authenticated).await;
                self.audit
                    .log(
                        events::AUTHENTICATION_COMPLETED,
                        AuditSeverity::Info,
                        Some(server_id),
                        serde_json::json!({}),
                    )
                    .await;
                Ok(())
            }
            Err(error) => {
                // The single-use state row may or may not have been taken
                self.store.auth_states().delete_for_server(server_id).await?;
                self.set_status(server_id, OAuthStatus::Failed).await;
                self.audit
                    .log(
                        events::AUTHENTICATION_FAILED,
                        AuditSeverity::Error,
                        Some(server_id),
                        serde_json::json!({"error": error.to_string()}),
                    )
                    .await;
                Err(error)
            }
        }
    }

    async fn drive_authorization(
        self: &Arc<Self>,
        server_id: &str,
        config: &OAuthConfigRecord,
        state: &str,
        redirect_uri: &str,
        scopes: &[String],
        challenge: Option<String>,
    ) -> OAuthResult<()> {
        let authorization_endpoint = config.authorization_endpoint.as_deref().ok_or_else(|| {
            OAuthError::configuration("authorization endpoint missing")
        })?;
        let url = build_authorization_url(
            authorization_endpoint,
            &config.client_id,
            redirect_uri,
            scopes,
            state,
            challenge.as_deref(),
            config.audience.as_deref(),
            config.additional_params.as_ref(),
        )?;

        // Bind before the browser opens so the redirect cannot race the
        // listener
        let listener = CallbackListener::bind(self.settings.callback_port).await?;
        self.browser.open(&url).await?;

        let params = listener.wait(self.settings.flow_timeout).await?;
        let code = interpret_callback(params, state)?;

        // The state row is single-use; taking it proves the redirect matched
        let auth_state = self
            .store
            .auth_states()
            .take(state)
            .await?
            .ok_or_else(|| {
                OAuthError::flow(
                    crate::error::FlowErrorKind::StateMismatch,
                    "pending authorization not found",
                )
            })?;

        let verifier = auth_state
            .code_verifier_enc
            .as_deref()
            .map(|enc| self.cipher.decrypt(enc))
            .transpose()?;

        let response = self
            .exchange_code(config, &code, redirect_uri, verifier.as_deref())
            .await?;
        let record = self.token_record_from_response(server_id, &response, None)?;
        self.store.oauth_tokens().upsert(&record).await?;

        self.audit
            .log(
                events::TOKEN_CREATED,
                AuditSeverity::Info,
                Some(server_id),
                serde_json::json!({"expires_at": record.expires_at}),
            )
            .await;

        self.arm_refresh_timer(server_id, record.expires_at).await;
        Ok(())
    }

    async fn exchange_code(
        &self,
        config: &OAuthConfigRecord,
        code: &str,
        redirect_uri: &str,
        verifier: Option<&str>,
    ) -> OAuthResult<RelayTokenResponse> {
        let token_endpoint = config
            .token_endpoint
            .as_deref()
            .ok_or_else(|| OAuthError::configuration("token endpoint missing"))?;
        let client_secret = config
            .client_secret_enc
            .as_deref()
            .map(|enc| self.cipher.decrypt(enc))
            .transpose()?;

        let mut params: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &config.client_id),
        ];
        if let Some(secret) = client_secret.as_deref() {
            params.push(("client_secret", secret));
        }
        if let Some(verifier) = verifier {
            params.push(("code_verifier", verifier));
        }

        let response = self
            .http
            .post(token_endpoint)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::flow(
                crate::error::FlowErrorKind::ProviderError,
                format!("token endpoint returned {}: {}", status, body),
            ));
        }

        Ok(response.json::<RelayTokenResponse>().await?)
    }

    /// Build a persisted token record from a token-endpoint response.
    /// The previous refresh token survives when the provider rotates
    /// nothing.
    pub(crate) fn token_record_from_response(
        &self,
        server_id: &str,
        response: &RelayTokenResponse,
        previous: Option<&OAuthTokenRecord>,
    ) -> OAuthResult<OAuthTokenRecord> {
        let now = relay_storage::now_millis();
        let access_token = response.access_token().secret();

        let refresh_token_enc = match response.refresh_token() {
            Some(token) => Some(self.cipher.encrypt(token.secret())?),
            None => previous.and_then(|p| p.refresh_token_enc.clone()),
        };
        let id_token_enc = response
            .extra_fields()
            .id_token
            .as_deref()
            .map(|t| self.cipher.encrypt(t))
            .transpose()?;

        let token_type = match response.token_type() {
            BasicTokenType::Bearer => "Bearer".to_string(),
            other => format!("{:?}", other),
        };

        Ok(OAuthTokenRecord {
            server_id: server_id.to_string(),
            access_token_enc: self.cipher.encrypt(access_token)?,
            refresh_token_enc,
            id_token_enc,
            token_type,
            expires_at: response
                .expires_in()
                .map(|d| now + d.as_millis() as i64),
            scopes: response
                .scopes()
                .map(|scopes| scopes.iter().map(|s| s.to_string()).collect()),
            refresh_count: previous.map(|p| p.refresh_count + 1).unwrap_or(0),
            last_used: now,
            created_at: previous.map(|p| p.created_at).unwrap_or(now),
            updated_at: now,
        })
    }

    /// Revoke a server's token: timer cancelled, revocation endpoint called
    /// best-effort, row deleted
    pub async fn revoke(&self, server_id: &str) -> OAuthResult<()> {
        self.cancel_timer(server_id).await;

        let token = self.store.oauth_tokens().get(server_id).await?;
        let config = self.store.oauth_configs().get(server_id).await?;

        if let (Some(token), Some(config)) = (token.as_ref(), config.as_ref()) {
            if let Some(endpoint) = config.revocation_endpoint.as_deref() {
                let access_token = self.cipher.decrypt(&token.access_token_enc)?;
                let params = [("token", access_token.as_str())];
                if let Err(error) = self.http.post(endpoint).form(&params).send().await {
                    tracing::warn!(server_id, %error, "revocation endpoint call failed");
                }
            }
        }

        self.store.oauth_tokens().delete(server_id).await?;
        self.set_status(server_id, OAuthStatus::Revoked).await;
        self.audit
            .log(
                events::TOKEN_REVOKED,
                AuditSeverity::Info,
                Some(server_id),
                serde_json::json!({}),
            )
            .await;
        Ok(())
    }

    /// Pull interface for transport header injection.
    ///
    /// Returns the `Authorization` header pair when the server holds a
    /// live token, refreshing first if needed.
    pub async fn headers_for(
        self: &Arc<Self>,
        server_id: &str,
    ) -> OAuthResult<Option<(String, String)>> {
        match self.get_access_token(server_id).await? {
            Some(token) => Ok(Some(("Authorization".to_string(), format!("Bearer {}", token)))),
            None => Ok(None),
        }
    }

    /// Discover authorization-server metadata for a base URL (24 h cache)
    pub async fn discover(
        &self,
        base_url: &str,
    ) -> OAuthResult<crate::discovery::AuthServerMetadata> {
        self.discovery.discover(base_url).await
    }

    /// Introspect the stored access token against the provider, when an
    /// introspection endpoint is configured
    pub async fn introspect(&self, server_id: &str) -> OAuthResult<serde_json::Value> {
        self.limiter
            .check(Operation::General, server_id, &self.audit)
            .await?;

        let config = self.require_config(server_id).await?;
        let endpoint = config.introspection_endpoint.as_deref().ok_or_else(|| {
            OAuthError::configuration(format!(
                "server {} has no introspection endpoint",
                server_id
            ))
        })?;
        let token = self
            .store
            .oauth_tokens()
            .get(server_id)
            .await?
            .ok_or_else(|| {
                OAuthError::token(
                    crate::error::TokenErrorKind::Expired,
                    server_id,
                    "no token stored",
                )
            })?;
        let access_token = self.cipher.decrypt(&token.access_token_enc)?;
        let client_secret = config
            .client_secret_enc
            .as_deref()
            .map(|enc| self.cipher.decrypt(enc))
            .transpose()?;

        let mut params: Vec<(&str, &str)> = vec![
            ("token", access_token.as_str()),
            ("client_id", &config.client_id),
        ];
        if let Some(secret) = client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(endpoint)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await?;
        Ok(response.json().await?)
    }

    /// Delete auth-state rows older than one hour
    pub async fn garbage_collect_auth_states(&self) -> OAuthResult<u64> {
        let cutoff = relay_storage::now_millis() - 3600 * 1000;
        let removed = self.store.auth_states().delete_older_than(cutoff).await?;
        if removed > 0 {
            tracing::debug!(removed, "expired auth states collected");
        }
        Ok(removed)
    }

    pub(crate) async fn require_config(&self, server_id: &str) -> OAuthResult<OAuthConfigRecord> {
        self.store
            .oauth_configs()
            .get(server_id)
            .await?
            .ok_or_else(|| {
                OAuthError::configuration(format!("server {} has no OAuth configuration", server_id))
            })
    }

    pub(crate) async fn cancel_timer(&self, server_id: &str) {
        if let Some(handle) = self.timers.lock().await.remove(server_id) {
            handle.abort();
        }
    }

    /// Cancel every timer; reverse-order teardown calls this first
    pub async fn shutdown(&self) {
        let mut timers = self.timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    /// Audit logger handle for sibling subsystems
    pub fn audit_logger(&self) -> Arc<AuditLogger> {
        self.audit.clone()
    }
}

/// Assemble the authorization URL with PKCE and extra parameters
#[allow(clippy::too_many_arguments)]
fn build_authorization_url(
    endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
    challenge: Option<&str>,
    audience: Option<&str>,
    additional_params: Option<&serde_json::Value>,
) -> OAuthResult<String> {
    let mut url = url::Url::parse(endpoint)
        .map_err(|e| OAuthError::configuration(format!("invalid authorization endpoint: {}", e)))?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("response_type", "code");
        query.append_pair("client_id", client_id);
        query.append_pair("redirect_uri", redirect_uri);
        query.append_pair("state", state);
        if !scopes.is_empty() {
            query.append_pair("scope", &scopes.join(" "));
        }
        if let Some(challenge) = challenge {
            query.append_pair("code_challenge", challenge);
            query.append_pair("code_challenge_method", "S256");
        }
        if let Some(audience) = audience {
            query.append_pair("audience", audience);
        }
        if let Some(serde_json::Value::Object(params)) = additional_params {
            for (key, value) in params {
                if let Some(value) = value.as_str() {
                    query.append_pair(key, value);
                }
            }
        }
    }

    Ok(url.to_string())
}
