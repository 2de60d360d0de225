//! Authorization-server metadata discovery

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::{OAuthError, OAuthResult};

/// Well-known paths tried in order
const WELL_KNOWN_PATHS: &[&str] = &[
    "/.well-known/oauth-authorization-server",
    "/.well-known/openid-configuration",
    "/.well-known/oauth2-metadata",
];

const CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Subset of RFC 8414 / OIDC discovery metadata the broker consumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    pub issuer: Option<String>,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub revocation_endpoint: Option<String>,
    pub introspection_endpoint: Option<String>,
    pub userinfo_endpoint: Option<String>,
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// Discovery client with a 24-hour in-memory cache keyed by base URL
pub struct DiscoveryClient {
    http: reqwest::Client,
    cache: RwLock<HashMap<String, (Instant, AuthServerMetadata)>>,
}

impl DiscoveryClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Discover metadata for a base URL, trying each well-known path in
    /// order. A 200 with invalid JSON falls through to the next path.
    pub async fn discover(&self, base_url: &str) -> OAuthResult<AuthServerMetadata> {
        let base = base_url.trim_end_matches('/').to_string();

        {
            let cache = self.cache.read().await;
            if let Some((fetched, metadata)) = cache.get(&base) {
                if fetched.elapsed() < CACHE_TTL {
                    return Ok(metadata.clone());
                }
            }
        }

        let mut last_error: Option<String> = None;
        for path in WELL_KNOWN_PATHS {
            let url = format!("{}{}", base, path);
            match self.try_fetch(&url).await {
                Ok(metadata) => {
                    tracing::debug!(%url, "authorization server metadata discovered");
                    let mut cache = self.cache.write().await;
                    cache.insert(base, (Instant::now(), metadata.clone()));
                    return Ok(metadata);
                }
                Err(message) => {
                    tracing::debug!(%url, %message, "discovery attempt failed");
                    last_error = Some(message);
                }
            }
        }

        Err(OAuthError::configuration(format!(
            "metadata discovery failed for {}: {}",
            base,
            last_error.unwrap_or_else(|| "no well-known endpoint responded".to_string())
        )))
    }

    async fn try_fetch(&self, url: &str) -> Result<AuthServerMetadata, String> {
        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }

        let body = response.text().await.map_err(|e| e.to_string())?;
        serde_json::from_str(&body).map_err(|e| format!("invalid JSON: {}", e))
    }

    /// Drop all cached entries (tests and forced re-discovery)
    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;

    async fn serve(router: Router) -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_discovers_first_path() {
        let router = Router::new().route(
            "/.well-known/oauth-authorization-server",
            get(|| async {
                axum::Json(serde_json::json!({
                    "issuer": "https://auth.example",
                    "authorization_endpoint": "https://auth.example/authorize",
                    "token_endpoint": "https://auth.example/token"
                }))
            }),
        );
        let (base, server) = serve(router).await;

        let client = DiscoveryClient::new(reqwest::Client::new());
        let metadata = client.discover(&base).await.unwrap();
        assert_eq!(
            metadata.token_endpoint.as_deref(),
            Some("https://auth.example/token")
        );
        server.abort();
    }

    #[tokio::test]
    async fn test_invalid_json_falls_through() {
        // First path returns 200 with garbage; second path has real metadata
        let router = Router::new()
            .route(
                "/.well-known/oauth-authorization-server",
                get(|| async { "this is not json" }),
            )
            .route(
                "/.well-known/openid-configuration",
                get(|| async {
                    axum::Json(serde_json::json!({
                        "token_endpoint": "https://auth.example/oidc/token"
                    }))
                }),
            );
        let (base, server) = serve(router).await;

        let client = DiscoveryClient::new(reqwest::Client::new());
        let metadata = client.discover(&base).await.unwrap();
        assert_eq!(
            metadata.token_endpoint.as_deref(),
            Some("https://auth.example/oidc/token")
        );
        server.abort();
    }

    #[tokio::test]
    async fn test_all_paths_fail() {
        let (base, server) = serve(Router::new()).await;
        let client = DiscoveryClient::new(reqwest::Client::new());
        let result = client.discover(&base).await;
        assert!(matches!(result, Err(OAuthError::Configuration { .. })));
        server.abort();
    }

    #[tokio::test]
    async fn test_cache_hit_avoids_refetch() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let hits = Arc::new(AtomicU32::new(0));
        let hits_clone = hits.clone();
        let router = Router::new().route(
            "/.well-known/oauth-authorization-server",
            get(move || {
                let hits = hits_clone.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    axum::Json(serde_json::json!({"token_endpoint": "https://t"}))
                }
            }),
        );
        let (base, server) = serve(router).await;

        let client = DiscoveryClient::new(reqwest::Client::new());
        client.discover(&base).await.unwrap();
        client.discover(&base).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        server.abort();
    }
}
