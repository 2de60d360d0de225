//! Upstream server persistence

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::entities::{ServerRecord, ServerType};
use crate::error::{StorageError, StorageResult};

/// Repository over the `servers` table
#[derive(Clone)]
pub struct ServerRepository {
    pool: SqlitePool,
}

impl ServerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_row(row: &SqliteRow) -> StorageResult<ServerRecord> {
        let tool_permissions = match row.get::<Option<String>, _>("tool_permissions") {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        Ok(ServerRecord {
            id: row.get("id"),
            name: row.get("name"),
            server_type: ServerType::parse(row.get::<String, _>("server_type").as_str())?,
            command: row.get("command"),
            args_enc: row.get("args_enc"),
            env_enc: row.get("env_enc"),
            remote_url_enc: row.get("remote_url_enc"),
            bearer_token_enc: row.get("bearer_token_enc"),
            input_params_enc: row.get("input_params_enc"),
            auto_start: row.get("auto_start"),
            disabled: row.get("disabled"),
            latest_known_version: row.get("latest_known_version"),
            tool_permissions,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    /// Insert a new server record
    pub async fn insert(&self, record: &ServerRecord) -> StorageResult<()> {
        let tool_permissions = record
            .tool_permissions
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO servers (
                id, name, server_type, command, args_enc, env_enc,
                remote_url_enc, bearer_token_enc, input_params_enc,
                auto_start, disabled, latest_known_version, tool_permissions,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(record.server_type.as_str())
        .bind(&record.command)
        .bind(&record.args_enc)
        .bind(&record.env_enc)
        .bind(&record.remote_url_enc)
        .bind(&record.bearer_token_enc)
        .bind(&record.input_params_enc)
        .bind(record.auto_start)
        .bind(record.disabled)
        .bind(&record.latest_known_version)
        .bind(tool_permissions)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update an existing server record in place
    pub async fn update(&self, record: &ServerRecord) -> StorageResult<()> {
        let tool_permissions = record
            .tool_permissions
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE servers SET
                name = ?, server_type = ?, command = ?, args_enc = ?,
                env_enc = ?, remote_url_enc = ?, bearer_token_enc = ?,
                input_params_enc = ?, auto_start = ?, disabled = ?,
                latest_known_version = ?, tool_permissions = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&record.name)
        .bind(record.server_type.as_str())
        .bind(&record.command)
        .bind(&record.args_enc)
        .bind(&record.env_enc)
        .bind(&record.remote_url_enc)
        .bind(&record.bearer_token_enc)
        .bind(&record.input_params_enc)
        .bind(record.auto_start)
        .bind(record.disabled)
        .bind(&record.latest_known_version)
        .bind(tool_permissions)
        .bind(crate::now_millis())
        .bind(&record.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("server", &record.id));
        }
        Ok(())
    }

    /// Fetch one server by id
    pub async fn get(&self, id: &str) -> StorageResult<Option<ServerRecord>> {
        let row = sqlx::query("SELECT * FROM servers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    /// Fetch one server by its unique name
    pub async fn get_by_name(&self, name: &str) -> StorageResult<Option<ServerRecord>> {
        let row = sqlx::query("SELECT * FROM servers WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    /// List all servers, name order
    pub async fn list(&self) -> StorageResult<Vec<ServerRecord>> {
        let rows = sqlx::query("SELECT * FROM servers ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_row).collect()
    }

    /// Delete a server. Foreign keys cascade: token grants, tool
    /// preferences, OAuth configuration/token/state rows all go with it.
    pub async fn delete(&self, id: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM servers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::entities::{ServerRecord, ServerType};
    use crate::Store;

    #[tokio::test]
    async fn test_insert_get_round_trip() {
        let store = Store::in_memory().await.unwrap();
        let mut record = ServerRecord::new("github", ServerType::Local);
        record.command = Some("npx".to_string());
        record.auto_start = true;

        store.servers().insert(&record).await.unwrap();
        let loaded = store.servers().get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);

        let by_name = store.servers().get_by_name("github").await.unwrap();
        assert_eq!(by_name.unwrap().id, record.id);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let store = Store::in_memory().await.unwrap();
        store
            .servers()
            .insert(&ServerRecord::new("dup", ServerType::Local))
            .await
            .unwrap();
        let second = store
            .servers()
            .insert(&ServerRecord::new("dup", ServerType::Remote))
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = Store::in_memory().await.unwrap();
        let record = ServerRecord::new("ghost", ServerType::Local);
        assert!(store.servers().update(&record).await.is_err());
    }
}
