//! Tool preference persistence

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::entities::ToolPreference;
use crate::error::StorageResult;

/// Repository over the `tool_preferences` table.
///
/// A `None` client id addresses the global scope throughout.
#[derive(Clone)]
pub struct ToolPreferenceRepository {
    pool: SqlitePool,
}

fn map_row(row: &SqliteRow) -> ToolPreference {
    ToolPreference {
        id: row.get("id"),
        server_id: row.get("server_id"),
        tool_name: row.get("tool_name"),
        client_id: row.get("client_id"),
        enabled: row.get("enabled"),
        original_description: row.get("original_description"),
        custom_name: row.get("custom_name"),
        custom_description: row.get("custom_description"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

impl ToolPreferenceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch one row for an exact scope, if present
    pub async fn get(
        &self,
        server_id: &str,
        tool_name: &str,
        client_id: Option<&str>,
    ) -> StorageResult<Option<ToolPreference>> {
        let row = sqlx::query(
            "SELECT * FROM tool_preferences \
             WHERE server_id = ? AND tool_name = ? AND COALESCE(client_id, '') = COALESCE(?, '')",
        )
        .bind(server_id)
        .bind(tool_name)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(map_row))
    }

    /// Fetch every row for one `(server, client?)` scope
    pub async fn list_scope(
        &self,
        server_id: &str,
        client_id: Option<&str>,
    ) -> StorageResult<Vec<ToolPreference>> {
        let rows = sqlx::query(
            "SELECT * FROM tool_preferences \
             WHERE server_id = ? AND COALESCE(client_id, '') = COALESCE(?, '') \
             ORDER BY tool_name",
        )
        .bind(server_id)
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(map_row).collect())
    }

    /// Distinct tool names that have a global row for a server
    pub async fn known_tools(&self, server_id: &str) -> StorageResult<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT tool_name FROM tool_preferences \
             WHERE server_id = ? AND client_id IS NULL ORDER BY tool_name",
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    /// Insert a row for a scope; the caller guarantees absence
    pub async fn insert(
        &self,
        server_id: &str,
        tool_name: &str,
        client_id: Option<&str>,
        enabled: bool,
        original_description: Option<&str>,
        custom_name: Option<&str>,
        custom_description: Option<&str>,
    ) -> StorageResult<()> {
        let now = crate::now_millis();
        sqlx::query(
            "INSERT INTO tool_preferences (
                server_id, tool_name, client_id, enabled, original_description,
                custom_name, custom_description, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(server_id)
        .bind(tool_name)
        .bind(client_id)
        .bind(enabled)
        .bind(original_description)
        .bind(custom_name)
        .bind(custom_description)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update only the stored discovery-time description
    pub async fn update_original_description(
        &self,
        server_id: &str,
        tool_name: &str,
        description: Option<&str>,
    ) -> StorageResult<()> {
        sqlx::query(
            "UPDATE tool_preferences SET original_description = ?, updated_at = ? \
             WHERE server_id = ? AND tool_name = ? AND client_id IS NULL",
        )
        .bind(description)
        .bind(crate::now_millis())
        .bind(server_id)
        .bind(tool_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update the policy fields of an existing row
    pub async fn update_policy(
        &self,
        server_id: &str,
        tool_name: &str,
        client_id: Option<&str>,
        enabled: bool,
        custom_name: Option<&str>,
        custom_description: Option<&str>,
    ) -> StorageResult<()> {
        sqlx::query(
            "UPDATE tool_preferences SET enabled = ?, custom_name = ?, \
             custom_description = ?, updated_at = ? \
             WHERE server_id = ? AND tool_name = ? AND COALESCE(client_id, '') = COALESCE(?, '')",
        )
        .bind(enabled)
        .bind(custom_name)
        .bind(custom_description)
        .bind(crate::now_millis())
        .bind(server_id)
        .bind(tool_name)
        .bind(client_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove rows (global and client-specific alike) for tools a server no
    /// longer announces
    pub async fn delete_missing(
        &self,
        server_id: &str,
        announced: &[String],
    ) -> StorageResult<u64> {
        // Bind-by-list is awkward in SQLite; announced sets are small, so a
        // JSON containment check keeps this one statement.
        let announced_json = serde_json::to_string(announced)?;
        let result = sqlx::query(
            "DELETE FROM tool_preferences WHERE server_id = ? AND tool_name NOT IN \
             (SELECT value FROM json_each(?))",
        )
        .bind(server_id)
        .bind(announced_json)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Set `enabled` for every row in one scope
    pub async fn set_enabled_all(
        &self,
        server_id: &str,
        client_id: Option<&str>,
        enabled: bool,
    ) -> StorageResult<u64> {
        let result = sqlx::query(
            "UPDATE tool_preferences SET enabled = ?, updated_at = ? \
             WHERE server_id = ? AND COALESCE(client_id, '') = COALESCE(?, '')",
        )
        .bind(enabled)
        .bind(crate::now_millis())
        .bind(server_id)
        .bind(client_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Reset a scope: client rows are deleted (falling back to global),
    /// global rows return to enabled with no overrides
    pub async fn reset_scope(
        &self,
        server_id: &str,
        client_id: Option<&str>,
    ) -> StorageResult<u64> {
        let result = match client_id {
            Some(client_id) => {
                sqlx::query("DELETE FROM tool_preferences WHERE server_id = ? AND client_id = ?")
                    .bind(server_id)
                    .bind(client_id)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(
                    "UPDATE tool_preferences SET enabled = 1, custom_name = NULL, \
                     custom_description = NULL, updated_at = ? \
                     WHERE server_id = ? AND client_id IS NULL",
                )
                .bind(crate::now_millis())
                .bind(server_id)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use crate::entities::{Client, ServerRecord, ServerType};
    use crate::Store;

    async fn seed(store: &Store) -> (ServerRecord, Client) {
        let server = ServerRecord::new("srv", ServerType::Local);
        store.servers().insert(&server).await.unwrap();
        let client = Client::new("app", None);
        store.clients().insert(&client).await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_global_and_client_rows_coexist() {
        let store = Store::in_memory().await.unwrap();
        let (server, client) = seed(&store).await;
        let prefs = store.tool_preferences();

        prefs
            .insert(&server.id, "search", None, true, Some("find things"), None, None)
            .await
            .unwrap();
        prefs
            .insert(&server.id, "search", Some(&client.id), false, None, None, None)
            .await
            .unwrap();

        let global = prefs.get(&server.id, "search", None).await.unwrap().unwrap();
        assert!(global.enabled);
        let scoped = prefs
            .get(&server.id, "search", Some(&client.id))
            .await
            .unwrap()
            .unwrap();
        assert!(!scoped.enabled);
    }

    #[tokio::test]
    async fn test_duplicate_global_row_rejected() {
        let store = Store::in_memory().await.unwrap();
        let (server, _) = seed(&store).await;
        let prefs = store.tool_preferences();

        prefs
            .insert(&server.id, "t", None, true, None, None, None)
            .await
            .unwrap();
        assert!(prefs
            .insert(&server.id, "t", None, true, None, None, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_missing_removes_client_rows_too() {
        let store = Store::in_memory().await.unwrap();
        let (server, client) = seed(&store).await;
        let prefs = store.tool_preferences();

        for tool in ["keep", "drop"] {
            prefs
                .insert(&server.id, tool, None, true, None, None, None)
                .await
                .unwrap();
        }
        prefs
            .insert(&server.id, "drop", Some(&client.id), false, None, None, None)
            .await
            .unwrap();

        let removed = prefs
            .delete_missing(&server.id, &["keep".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(prefs.get(&server.id, "drop", None).await.unwrap().is_none());
        assert!(prefs
            .get(&server.id, "drop", Some(&client.id))
            .await
            .unwrap()
            .is_none());
        assert!(prefs.get(&server.id, "keep", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reset_scope() {
        let store = Store::in_memory().await.unwrap();
        let (server, client) = seed(&store).await;
        let prefs = store.tool_preferences();

        prefs
            .insert(&server.id, "t", None, false, Some("orig"), Some("alias"), None)
            .await
            .unwrap();
        prefs
            .insert(&server.id, "t", Some(&client.id), false, None, None, None)
            .await
            .unwrap();

        prefs.reset_scope(&server.id, Some(&client.id)).await.unwrap();
        assert!(prefs
            .get(&server.id, "t", Some(&client.id))
            .await
            .unwrap()
            .is_none());

        prefs.reset_scope(&server.id, None).await.unwrap();
        let global = prefs.get(&server.id, "t", None).await.unwrap().unwrap();
        assert!(global.enabled);
        assert_eq!(global.custom_name, None);
        // The discovery-time description survives a reset
        assert_eq!(global.original_description.as_deref(), Some("orig"));
    }
}
