//! API client persistence

use sqlx::SqlitePool;

use crate::entities::Client;
use crate::error::{StorageError, StorageResult};

/// Repository over the `clients` table
#[derive(Clone)]
pub struct ClientRepository {
    pool: SqlitePool,
}

impl ClientRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, client: &Client) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO clients (id, name, description, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&client.id)
        .bind(&client.name)
        .bind(&client.description)
        .bind(client.created_at)
        .bind(client.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> StorageResult<Option<Client>> {
        let row = sqlx::query_as::<_, (String, String, Option<String>, i64, i64)>(
            "SELECT id, name, description, created_at, updated_at FROM clients WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, name, description, created_at, updated_at)| Client {
            id,
            name,
            description,
            created_at,
            updated_at,
        }))
    }

    pub async fn list(&self) -> StorageResult<Vec<Client>> {
        let rows = sqlx::query_as::<_, (String, String, Option<String>, i64, i64)>(
            "SELECT id, name, description, created_at, updated_at FROM clients ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name, description, created_at, updated_at)| Client {
                id,
                name,
                description,
                created_at,
                updated_at,
            })
            .collect())
    }

    pub async fn rename(&self, id: &str, name: &str, description: Option<&str>) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE clients SET name = ?, description = ?, updated_at = ? WHERE id = ?",
        )
        .bind(name)
        .bind(description)
        .bind(crate::now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("client", id));
        }
        Ok(())
    }

    /// Delete a client; its tokens cascade away
    pub async fn delete(&self, id: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM clients WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
