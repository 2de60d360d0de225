//! Browser-driven authorization flow plumbing
//!
//! The loopback listener is single-shot: it is bound for the lifetime of
//! one authorization, receives exactly one redirect, and is torn down on
//! completion, cancellation, or timeout. Binding happens before the
//! browser opens so the redirect cannot race the listener.

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::{FlowErrorKind, OAuthError, OAuthResult};

/// Opens the user's browser at an authorization URL. Substitutable in tests.
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait BrowserOpener: Send + Sync {
    async fn open(&self, url: &str) -> OAuthResult<()>;
}

/// Default opener shelling out to the platform launcher
pub struct SystemBrowser;

#[async_trait]
impl BrowserOpener for SystemBrowser {
    async fn open(&self, url: &str) -> OAuthResult<()> {
        #[cfg(target_os = "macos")]
        let launcher = "open";
        #[cfg(target_os = "windows")]
        let launcher = "explorer";
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        let launcher = "xdg-open";

        tokio::process::Command::new(launcher)
            .arg(url)
            .spawn()
            .map_err(|e| {
                OAuthError::flow(
                    FlowErrorKind::ProviderError,
                    format!("failed to open browser: {}", e),
                )
            })?;
        Ok(())
    }
}

/// Query parameters delivered to the redirect endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

type CallbackSlot = Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>;

async fn handle_callback(
    State(slot): State<CallbackSlot>,
    Query(params): Query<CallbackParams>,
) -> Html<&'static str> {
    if let Some(tx) = slot.lock().await.take() {
        let _ = tx.send(params);
    }
    Html(
        "<html><body><p>Authorization received. You can close this window \
         and return to the application.</p></body></html>",
    )
}

/// A bound single-shot loopback listener at `/oauth/callback`
pub(crate) struct CallbackListener {
    rx: oneshot::Receiver<CallbackParams>,
    shutdown_tx: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl CallbackListener {
    /// Bind the loopback port. A port already in use fails the flow
    /// immediately.
    pub async fn bind(port: u16) -> OAuthResult<Self> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| {
                OAuthError::flow(
                    FlowErrorKind::ProviderError,
                    format!("callback port {} unavailable: {}", port, e),
                )
            })?;

        let (tx, rx) = oneshot::channel::<CallbackParams>();
        let slot: CallbackSlot = Arc::new(Mutex::new(Some(tx)));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let router = Router::new()
            .route("/oauth/callback", get(handle_callback))
            .with_state(slot);

        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            rx,
            shutdown_tx,
            server,
        })
    }

    /// Await a single redirect; tears the listener down on every exit path
    pub async fn wait(self, timeout: Duration) -> OAuthResult<CallbackParams> {
        let outcome = tokio::time::timeout(timeout, self.rx).await;
        let _ = self.shutdown_tx.send(());
        self.server.abort();

        match outcome {
            Ok(Ok(params)) => Ok(params),
            Ok(Err(_)) => Err(OAuthError::flow(
                FlowErrorKind::Cancelled,
                "callback channel closed before a redirect arrived",
            )),
            Err(_) => Err(OAuthError::flow(
                FlowErrorKind::Timeout,
                format!("no redirect within {:?}", timeout),
            )),
        }
    }
}

/// Interpret redirect parameters against the expected `state`
pub(crate) fn interpret_callback(
    params: CallbackParams,
    expected_state: &str,
) -> OAuthResult<String> {
    if let Some(error) = params.error {
        let description = params.error_description.unwrap_or_default();
        let kind = if error == "access_denied" {
            FlowErrorKind::Cancelled
        } else {
            FlowErrorKind::ProviderError
        };
        return Err(OAuthError::flow(
            kind,
            format!("{}: {}", error, description),
        ));
    }

    match params.state.as_deref() {
        Some(state) if state == expected_state => {}
        _ => {
            return Err(OAuthError::flow(
                FlowErrorKind::StateMismatch,
                "redirect state does not match the pending authorization",
            ))
        }
    }

    params.code.ok_or_else(|| {
        OAuthError::flow(
            FlowErrorKind::ProviderError,
            "redirect carried no authorization code",
        )
    })
}
