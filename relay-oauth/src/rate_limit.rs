//! Fixed-window rate limiting for OAuth operations

use std::collections::HashMap;
use tokio::sync::Mutex;

use relay_storage::entities::AuditSeverity;

use crate::audit::{events, AuditLogger};
use crate::error::{OAuthError, OAuthResult};

/// Operation classes with distinct limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Browser-driven authorization flows
    Auth,
    /// Token refreshes
    Refresh,
    /// Everything else
    General,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Auth => "auth",
            Operation::Refresh => "refresh",
            Operation::General => "general",
        }
    }
}

/// Per-operation limits and window lengths
#[derive(Debug, Clone)]
pub struct RateLimits {
    pub auth_per_window: u32,
    pub auth_window_millis: i64,
    pub refresh_per_window: u32,
    pub refresh_window_millis: i64,
    pub general_per_window: u32,
    pub general_window_millis: i64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            auth_per_window: 10,
            auth_window_millis: 24 * 3600 * 1000,
            refresh_per_window: 30,
            refresh_window_millis: 3600 * 1000,
            general_per_window: 60,
            general_window_millis: 60 * 1000,
        }
    }
}

impl RateLimits {
    fn for_operation(&self, operation: Operation) -> (u32, i64) {
        match operation {
            Operation::Auth => (self.auth_per_window, self.auth_window_millis),
            Operation::Refresh => (self.refresh_per_window, self.refresh_window_millis),
            Operation::General => (self.general_per_window, self.general_window_millis),
        }
    }
}

#[derive(Debug)]
struct WindowBucket {
    window_start: i64,
    count: u32,
}

/// Fixed-start window rate limiter keyed by `(operation, server)`.
///
/// Exceeding a window logs `rate_limit_exceeded` and returns `RateLimited`
/// without any side effect on the guarded operation.
pub struct RateLimiter {
    limits: RateLimits,
    buckets: Mutex<HashMap<(Operation, String), WindowBucket>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record one attempt; `Err(RateLimited)` when the window is exhausted.
    /// `reset_at` is monotone within a window.
    pub async fn check(
        &self,
        operation: Operation,
        server_id: &str,
        audit: &AuditLogger,
    ) -> OAuthResult<()> {
        let (limit, window) = self.limits.for_operation(operation);
        let now = relay_storage::now_millis();

        let reset_at = {
            let mut buckets = self.buckets.lock().await;
            let bucket = buckets
                .entry((operation, server_id.to_string()))
                .or_insert(WindowBucket {
                    window_start: now,
                    count: 0,
                });

            if now - bucket.window_start >= window {
                bucket.window_start = now;
                bucket.count = 0;
            }

            if bucket.count < limit {
                bucket.count += 1;
                return Ok(());
            }
            bucket.window_start + window
        };

        audit
            .log(
                events::RATE_LIMIT_EXCEEDED,
                AuditSeverity::Warning,
                Some(server_id),
                serde_json::json!({
                    "operation": operation.as_str(),
                    "reset_at": reset_at,
                }),
            )
            .await;

        Err(OAuthError::RateLimited { reset_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_storage::Store;

    async fn fixture() -> (RateLimiter, AuditLogger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::in_memory().await.unwrap();
        let audit = AuditLogger::open(store, dir.path().join("audit.log"), 90)
            .await
            .unwrap();
        let limits = RateLimits {
            auth_per_window: 2,
            auth_window_millis: 60_000,
            ..Default::default()
        };
        (RateLimiter::new(limits), audit, dir)
    }

    #[tokio::test]
    async fn test_window_exhaustion() {
        let (limiter, audit, _dir) = fixture().await;

        assert!(limiter.check(Operation::Auth, "s", &audit).await.is_ok());
        assert!(limiter.check(Operation::Auth, "s", &audit).await.is_ok());
        let third = limiter.check(Operation::Auth, "s", &audit).await;
        assert!(matches!(third, Err(OAuthError::RateLimited { .. })));

        // A different server has its own bucket
        assert!(limiter.check(Operation::Auth, "other", &audit).await.is_ok());
    }

    #[tokio::test]
    async fn test_reset_at_is_monotone_within_window() {
        let (limiter, audit, _dir) = fixture().await;
        limiter.check(Operation::Auth, "s", &audit).await.unwrap();
        limiter.check(Operation::Auth, "s", &audit).await.unwrap();

        let first = match limiter.check(Operation::Auth, "s", &audit).await {
            Err(OAuthError::RateLimited { reset_at }) => reset_at,
            other => panic!("expected RateLimited, got {:?}", other.map(|_| ())),
        };
        let second = match limiter.check(Operation::Auth, "s", &audit).await {
            Err(OAuthError::RateLimited { reset_at }) => reset_at,
            other => panic!("expected RateLimited, got {:?}", other.map(|_| ())),
        };
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_exceeded_logs_audit_event() {
        let (limiter, audit, _dir) = fixture().await;
        limiter.check(Operation::Auth, "s", &audit).await.unwrap();
        limiter.check(Operation::Auth, "s", &audit).await.unwrap();
        let _ = limiter.check(Operation::Auth, "s", &audit).await;

        let recent = audit.recent(10).await;
        assert!(recent
            .iter()
            .any(|r| r.event_type == events::RATE_LIMIT_EXCEEDED));
    }
}
