//! Audit trail persistence

use sqlx::SqlitePool;

use crate::entities::{AuditRecord, AuditSeverity};
use crate::error::StorageResult;

/// Repository over the append-only `audit_log` table
#[derive(Clone)]
pub struct AuditRepository {
    pool: SqlitePool,
}

impl AuditRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one entry; returns the assigned row id
    pub async fn append(&self, record: &AuditRecord) -> StorageResult<i64> {
        let details = serde_json::to_string(&record.details)?;
        let result = sqlx::query(
            "INSERT INTO audit_log (timestamp, event_type, severity, server_id, details) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.timestamp)
        .bind(&record.event_type)
        .bind(record.severity.as_str())
        .bind(&record.server_id)
        .bind(details)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Most recent entries, newest first
    pub async fn recent(&self, limit: i64) -> StorageResult<Vec<AuditRecord>> {
        let rows = sqlx::query_as::<_, (i64, i64, String, String, Option<String>, String)>(
            "SELECT id, timestamp, event_type, severity, server_id, details \
             FROM audit_log ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, timestamp, event_type, severity, server_id, details) in rows {
            records.push(AuditRecord {
                id,
                timestamp,
                event_type,
                severity: AuditSeverity::parse(&severity),
                server_id,
                details: serde_json::from_str(&details)?,
            });
        }
        Ok(records)
    }

    pub async fn count(&self) -> StorageResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM audit_log")
            .fetch_one(&self.pool)
            .await?)
    }
}
