//! End-to-end authorization flow against stub provider endpoints: the
//! browser collaborator is a mock that follows the redirect itself.

use axum::routing::{get, post};
use axum::{Form, Json, Router};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use relay_config::domains::oauth::OAuthConfig as OAuthSettings;
use relay_crypto::{KeyFile, SecretCipher};
use relay_storage::entities::{ServerRecord, ServerType};
use relay_storage::Store;

use crate::flow::MockBrowserOpener;
use crate::{
    AuditLogger, FlowErrorKind, OAuthError, OAuthService, OAuthSetup, OAuthStatus, Provider,
    RateLimiter, RateLimits,
};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A browser mock that immediately follows the authorization redirect.
/// `forged_state` simulates a forged callback; `deny` simulates the user
/// rejecting the consent screen.
fn redirecting_browser(forged_state: Option<&'static str>, deny: bool) -> MockBrowserOpener {
    let mut browser = MockBrowserOpener::new();
    browser.expect_open().returning(move |url| {
        let parsed = url::Url::parse(url).expect("authorization URL must parse");
        let params: HashMap<String, String> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let redirect_uri = params["redirect_uri"].clone();
        let state = forged_state
            .map(String::from)
            .unwrap_or_else(|| params["state"].clone());

        let callback = if deny {
            format!("{}?error=access_denied&state={}", redirect_uri, state)
        } else {
            format!("{}?code=auth-code-123&state={}", redirect_uri, state)
        };

        // The user "approves" shortly after the window opens
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let _ = reqwest::get(&callback).await;
        });
        Ok(())
    });
    browser
}

struct ProviderStub {
    base_url: String,
    token_requests: Arc<Mutex<Vec<HashMap<String, String>>>>,
    _server: tokio::task::JoinHandle<()>,
}

/// Stub provider with token, metadata, and registration endpoints
async fn spawn_provider() -> ProviderStub {
    let token_requests = Arc::new(Mutex::new(Vec::new()));
    let captured = token_requests.clone();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{}", addr);
    let metadata_base = base_url.clone();

    let router = Router::new()
        .route(
            "/token",
            post(move |Form(params): Form<HashMap<String, String>>| {
                let captured = captured.clone();
                async move {
                    captured.lock().await.push(params);
                    Json(serde_json::json!({
                        "access_token": "flow-access-token",
                        "refresh_token": "flow-refresh-token",
                        "token_type": "bearer",
                        "expires_in": 3600,
                        "scope": "repo",
                    }))
                }
            }),
        )
        .route(
            "/.well-known/oauth-authorization-server",
            get(move || {
                let base = metadata_base.clone();
                async move {
                    Json(serde_json::json!({
                        "issuer": base,
                        "authorization_endpoint": format!("{}/authorize", base),
                        "token_endpoint": format!("{}/token", base),
                        "registration_endpoint": format!("{}/register", base),
                    }))
                }
            }),
        )
        .route(
            "/register",
            post(|Json(_body): Json<serde_json::Value>| async move {
                Json(serde_json::json!({
                    "client_id": "registered-client",
                    "registration_client_uri": "https://provider.example/clients/registered-client",
                    "registration_access_token": "reg-access",
                }))
            }),
        );

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    ProviderStub {
        base_url,
        token_requests,
        _server: server,
    }
}

struct Fixture {
    store: Store,
    cipher: Arc<SecretCipher>,
    oauth: Arc<OAuthService>,
    server_id: String,
    _dir: tempfile::TempDir,
}

async fn fixture(browser: MockBrowserOpener, callback_port: u16) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory().await.unwrap();
    let key = KeyFile::new(dir.path().join(".oauth-key"))
        .load_or_create()
        .unwrap();
    let cipher = Arc::new(SecretCipher::new(key));
    let audit = Arc::new(
        AuditLogger::open(store.clone(), dir.path().join("audit.log"), 90)
            .await
            .unwrap(),
    );
    let settings = OAuthSettings {
        callback_port,
        ..OAuthSettings::default()
    };
    let oauth = OAuthService::new(
        store.clone(),
        cipher.clone(),
        settings,
        audit,
        RateLimiter::new(RateLimits::default()),
        Arc::new(browser),
    )
    .unwrap();

    let server = ServerRecord::new("flow-server", ServerType::Remote);
    store.servers().insert(&server).await.unwrap();

    Fixture {
        store,
        cipher,
        oauth,
        server_id: server.id,
        _dir: dir,
    }
}

fn explicit_setup(provider: &ProviderStub) -> OAuthSetup {
    OAuthSetup {
        client_id: Some("cid".to_string()),
        client_secret: Some("csecret".to_string()),
        authorization_endpoint: Some(format!("{}/authorize", provider.base_url)),
        token_endpoint: Some(format!("{}/token", provider.base_url)),
        scopes: Some(vec!["repo".to_string()]),
        ..OAuthSetup::default()
    }
}

#[tokio::test]
async fn test_full_pkce_flow_persists_encrypted_token() {
    let provider = spawn_provider().await;
    let f = fixture(redirecting_browser(None, false), free_port()).await;

    f.oauth
        .configure(&f.server_id, Provider::Custom, explicit_setup(&provider))
        .await
        .unwrap();
    f.oauth.authenticate(&f.server_id, None).await.unwrap();

    assert_eq!(
        f.oauth.status(&f.server_id).await.unwrap(),
        OAuthStatus::Authenticated
    );

    // The exchange carried the code and a PKCE verifier
    let requests = provider.token_requests.lock().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["grant_type"], "authorization_code");
    assert_eq!(requests[0]["code"], "auth-code-123");
    assert!(requests[0]["code_verifier"].len() >= 43);

    // Token row persisted with ciphertext only
    let record = f
        .store
        .oauth_tokens()
        .get(&f.server_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!record.access_token_enc.contains("flow-access-token"));
    assert_eq!(
        f.cipher.decrypt(&record.access_token_enc).unwrap(),
        "flow-access-token"
    );
    assert_eq!(record.scopes.as_deref(), Some(&["repo".to_string()][..]));

    // The single-use auth state is gone
    assert!(f.store.auth_states().list().await.unwrap().is_empty());

    f.oauth.shutdown().await;
}

#[tokio::test]
async fn test_pkce_disabled_flow_omits_verifier() {
    let provider = spawn_provider().await;
    let f = fixture(redirecting_browser(None, false), free_port()).await;

    let setup = OAuthSetup {
        use_pkce: Some(false),
        ..explicit_setup(&provider)
    };
    f.oauth
        .configure(&f.server_id, Provider::Custom, setup)
        .await
        .unwrap();
    f.oauth.authenticate(&f.server_id, None).await.unwrap();

    let requests = provider.token_requests.lock().await;
    assert!(!requests[0].contains_key("code_verifier"));

    f.oauth.shutdown().await;
}

#[tokio::test]
async fn test_forged_state_is_rejected() {
    let provider = spawn_provider().await;
    let f = fixture(
        redirecting_browser(Some("attacker-chosen"), false),
        free_port(),
    )
    .await;

    f.oauth
        .configure(&f.server_id, Provider::Custom, explicit_setup(&provider))
        .await
        .unwrap();

    let error = f.oauth.authenticate(&f.server_id, None).await.unwrap_err();
    assert!(matches!(
        error,
        OAuthError::Flow {
            kind: FlowErrorKind::StateMismatch,
            ..
        }
    ));
    assert!(f.store.oauth_tokens().get(&f.server_id).await.unwrap().is_none());
    assert!(f.store.auth_states().list().await.unwrap().is_empty());
    assert!(provider.token_requests.lock().await.is_empty());
}

#[tokio::test]
async fn test_user_denial_is_cancelled() {
    let provider = spawn_provider().await;
    let f = fixture(redirecting_browser(None, true), free_port()).await;

    f.oauth
        .configure(&f.server_id, Provider::Custom, explicit_setup(&provider))
        .await
        .unwrap();

    let error = f.oauth.authenticate(&f.server_id, None).await.unwrap_err();
    assert!(matches!(
        error,
        OAuthError::Flow {
            kind: FlowErrorKind::Cancelled,
            ..
        }
    ));
}

#[tokio::test]
async fn test_configure_is_idempotent() {
    let provider = spawn_provider().await;
    let f = fixture(MockBrowserOpener::new(), free_port()).await;

    let first = f
        .oauth
        .configure(&f.server_id, Provider::Custom, explicit_setup(&provider))
        .await
        .unwrap();
    let second = f
        .oauth
        .configure(&f.server_id, Provider::Custom, explicit_setup(&provider))
        .await
        .unwrap();

    // Same configuration modulo timestamps and fresh ciphertext
    assert_eq!(first.client_id, second.client_id);
    assert_eq!(first.authorization_endpoint, second.authorization_endpoint);
    assert_eq!(first.token_endpoint, second.token_endpoint);
    assert_eq!(first.scopes, second.scopes);
    assert_eq!(first.use_pkce, second.use_pkce);
    assert_eq!(
        f.cipher
            .decrypt(second.client_secret_enc.as_deref().unwrap())
            .unwrap(),
        "csecret"
    );
}

#[tokio::test]
async fn test_discovery_and_dynamic_registration_mint_client() {
    let provider = spawn_provider().await;
    let f = fixture(MockBrowserOpener::new(), free_port()).await;

    let setup = OAuthSetup {
        discovery_url: Some(provider.base_url.clone()),
        dynamic_registration: Some(true),
        ..OAuthSetup::default()
    };
    let record = f
        .oauth
        .configure(&f.server_id, Provider::Custom, setup)
        .await
        .unwrap();

    // Endpoints filled from metadata, credentials minted by registration
    assert_eq!(
        record.token_endpoint.as_deref(),
        Some(format!("{}/token", provider.base_url).as_str())
    );
    assert_eq!(record.client_id, "registered-client");
    // Public client: no secret was issued
    assert!(record.client_secret_enc.is_none());
    assert_eq!(
        record.registration_client_uri.as_deref(),
        Some("https://provider.example/clients/registered-client")
    );
    assert_eq!(
        f.cipher
            .decrypt(record.registration_access_token_enc.as_deref().unwrap())
            .unwrap(),
        "reg-access"
    );
}

#[tokio::test]
async fn test_revoke_deletes_token_row() {
    let provider = spawn_provider().await;
    let f = fixture(redirecting_browser(None, false), free_port()).await;

    f.oauth
        .configure(&f.server_id, Provider::Custom, explicit_setup(&provider))
        .await
        .unwrap();
    f.oauth.authenticate(&f.server_id, None).await.unwrap();
    assert!(f.store.oauth_tokens().get(&f.server_id).await.unwrap().is_some());

    f.oauth.revoke(&f.server_id).await.unwrap();
    assert!(f.store.oauth_tokens().get(&f.server_id).await.unwrap().is_none());
    assert_eq!(
        f.oauth.status(&f.server_id).await.unwrap(),
        OAuthStatus::Revoked
    );

    f.oauth.shutdown().await;
}
