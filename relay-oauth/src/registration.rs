//! RFC 7591 dynamic client registration

use serde::{Deserialize, Serialize};

use crate::error::{OAuthError, OAuthResult};

/// Out-of-band redirect value registered alongside the loopback callback
pub const OOB_REDIRECT: &str = "urn:ietf:wg:oauth:2.0:oob";

/// Registration request payload
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationRequest {
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Registration response; `client_secret` is absent for public clients
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationResponse {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub registration_client_uri: Option<String>,
    #[serde(default)]
    pub registration_access_token: Option<String>,
}

/// The fixed redirect URI set registered for a loopback callback port
pub fn redirect_uris(callback_port: u16) -> Vec<String> {
    vec![
        format!("http://localhost:{}/oauth/callback", callback_port),
        format!("http://127.0.0.1:{}/oauth/callback", callback_port),
        OOB_REDIRECT.to_string(),
    ]
}

/// Register a client with the authorization server
pub async fn register(
    http: &reqwest::Client,
    registration_endpoint: &str,
    client_name: &str,
    callback_port: u16,
    scopes: &[String],
) -> OAuthResult<RegistrationResponse> {
    let request = RegistrationRequest {
        client_name: client_name.to_string(),
        redirect_uris: redirect_uris(callback_port),
        grant_types: vec![
            "authorization_code".to_string(),
            "refresh_token".to_string(),
        ],
        response_types: vec!["code".to_string()],
        token_endpoint_auth_method: "client_secret_post".to_string(),
        scope: if scopes.is_empty() {
            None
        } else {
            Some(scopes.join(" "))
        },
    };

    let response = http
        .post(registration_endpoint)
        .json(&request)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::configuration(format!(
            "dynamic registration failed with status {}: {}",
            status, body
        )));
    }

    let registered: RegistrationResponse = response.json().await.map_err(|e| {
        OAuthError::configuration(format!("invalid registration response: {}", e))
    })?;

    tracing::info!(client_id = %registered.client_id, "dynamic client registered");
    Ok(registered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};

    #[tokio::test]
    async fn test_register_public_client() {
        let router = Router::new().route(
            "/register",
            post(|Json(body): Json<serde_json::Value>| async move {
                // Echo back a public-client registration
                assert_eq!(body["response_types"][0], "code");
                assert!(body["redirect_uris"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .any(|u| u == OOB_REDIRECT));
                Json(serde_json::json!({
                    "client_id": "generated-id"
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let response = register(
            &reqwest::Client::new(),
            &format!("http://{}/register", addr),
            "relay",
            42424,
            &[],
        )
        .await
        .unwrap();

        assert_eq!(response.client_id, "generated-id");
        assert!(response.client_secret.is_none());
        server.abort();
    }

    #[test]
    fn test_redirect_uri_set() {
        let uris = redirect_uris(42424);
        assert_eq!(uris.len(), 3);
        assert!(uris.contains(&"http://localhost:42424/oauth/callback".to_string()));
        assert!(uris.contains(&"http://127.0.0.1:42424/oauth/callback".to_string()));
    }
}
