//! Audit logging for OAuth operations
//!
//! Every entry goes to three sinks: a bounded in-memory ring, an
//! append-only NDJSON file, and the store's audit table. Critical entries
//! additionally surface on stderr.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::Mutex;

use relay_storage::entities::{AuditRecord, AuditSeverity};
use relay_storage::Store;

use crate::error::OAuthResult;

/// Audit event type constants
pub mod events {
    pub const TOKEN_CREATED: &str = "token_created";
    pub const TOKEN_REFRESHED: &str = "token_refreshed";
    pub const TOKEN_REVOKED: &str = "token_revoked";
    pub const TOKEN_EXPIRED: &str = "token_expired";
    pub const TOKEN_VALIDATION_FAILED: &str = "token_validation_failed";
    pub const KEY_ROTATED: &str = "key_rotated";
    pub const SUSPICIOUS_ACTIVITY: &str = "suspicious_activity";
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
    pub const AUTHENTICATION_STARTED: &str = "authentication_started";
    pub const AUTHENTICATION_COMPLETED: &str = "authentication_completed";
    pub const AUTHENTICATION_FAILED: &str = "authentication_failed";
    pub const CONFIGURATION_CHANGED: &str = "configuration_changed";
    pub const CONFIGURATION_DELETED: &str = "configuration_deleted";
    pub const BACKUP_CREATED: &str = "backup_created";
    pub const BACKUP_RESTORED: &str = "backup_restored";
    pub const MIGRATION_APPLIED: &str = "migration_applied";
    pub const MIGRATION_ROLLED_BACK: &str = "migration_rolled_back";
}

/// Capacity of the in-memory ring
const RING_CAPACITY: usize = 10_000;

/// Audit logger over ring, file, and store sinks
pub struct AuditLogger {
    store: Store,
    file_path: PathBuf,
    ring: Mutex<VecDeque<AuditRecord>>,
}

impl AuditLogger {
    /// Create a logger writing to `file_path` and trim file retention to
    /// `retention_days`
    pub async fn open(
        store: Store,
        file_path: impl Into<PathBuf>,
        retention_days: u32,
    ) -> OAuthResult<Self> {
        let logger = Self {
            store,
            file_path: file_path.into(),
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
        };
        logger.trim_file_retention(retention_days).await?;
        Ok(logger)
    }

    /// Append an audit entry to every sink
    pub async fn log(
        &self,
        event_type: &str,
        severity: AuditSeverity,
        server_id: Option<&str>,
        details: serde_json::Value,
    ) {
        let record = AuditRecord {
            id: 0,
            timestamp: relay_storage::now_millis(),
            event_type: event_type.to_string(),
            severity,
            server_id: server_id.map(|s| s.to_string()),
            details,
        };

        if severity == AuditSeverity::Critical {
            eprintln!(
                "[relay-oauth] CRITICAL {}: {}",
                record.event_type, record.details
            );
        }

        {
            let mut ring = self.ring.lock().await;
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }

        if let Err(error) = self.append_file(&record) {
            tracing::warn!(%error, "audit file append failed");
        }

        if let Err(error) = self.store.audit().append(&record).await {
            tracing::warn!(%error, "audit table append failed");
        }
    }

    fn append_file(&self, record: &AuditRecord) -> std::io::Result<()> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        let line = serde_json::to_string(record).unwrap_or_default();
        writeln!(file, "{}", line)
    }

    /// Drop file lines older than the retention window. Runs at startup.
    async fn trim_file_retention(&self, retention_days: u32) -> OAuthResult<()> {
        let content = match std::fs::read_to_string(&self.file_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let cutoff =
            relay_storage::now_millis() - (retention_days as i64) * 24 * 3600 * 1000;
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| {
                serde_json::from_str::<AuditRecord>(line)
                    .map(|record| record.timestamp >= cutoff)
                    .unwrap_or(false)
            })
            .collect();

        let dropped = content.lines().count() - kept.len();
        if dropped > 0 {
            let mut rewritten = kept.join("\n");
            if !rewritten.is_empty() {
                rewritten.push('\n');
            }
            std::fs::write(&self.file_path, rewritten)?;
            tracing::info!(dropped, "trimmed audit log retention");
        }
        Ok(())
    }

    /// Most recent in-memory entries, oldest first
    pub async fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let ring = self.ring.lock().await;
        ring.iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }
}
