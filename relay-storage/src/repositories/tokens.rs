//! Client bearer token persistence

use sqlx::SqlitePool;

use crate::entities::ClientToken;
use crate::error::StorageResult;
use crate::repositories::{from_json_list, to_json_list};

/// Repository over the `tokens` and `token_servers` tables
#[derive(Clone)]
pub struct TokenRepository {
    pool: SqlitePool,
}

impl TokenRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a token and its server grants atomically
    pub async fn insert(&self, token: &ClientToken) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO tokens (id, client_id, scopes, issued_at) VALUES (?, ?, ?, ?)")
            .bind(&token.id)
            .bind(&token.client_id)
            .bind(to_json_list(&token.scopes))
            .bind(token.issued_at)
            .execute(&mut *tx)
            .await?;

        for server_id in &token.server_ids {
            sqlx::query("INSERT INTO token_servers (token_id, server_id) VALUES (?, ?)")
                .bind(&token.id)
                .bind(server_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Fetch a token with its current server grants
    pub async fn get(&self, id: &str) -> StorageResult<Option<ClientToken>> {
        let row = sqlx::query_as::<_, (String, String, String, i64)>(
            "SELECT id, client_id, scopes, issued_at FROM tokens WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, client_id, scopes, issued_at)) = row else {
            return Ok(None);
        };

        let server_ids: Vec<String> = sqlx::query_scalar(
            "SELECT server_id FROM token_servers WHERE token_id = ? ORDER BY server_id",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(ClientToken {
            id,
            client_id,
            server_ids,
            scopes: from_json_list(&scopes),
            issued_at,
        }))
    }

    /// List all tokens issued to one client
    pub async fn list_by_client(&self, client_id: &str) -> StorageResult<Vec<ClientToken>> {
        let rows = sqlx::query_as::<_, (String, String, String, i64)>(
            "SELECT id, client_id, scopes, issued_at FROM tokens \
             WHERE client_id = ? ORDER BY issued_at",
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;

        let mut tokens = Vec::with_capacity(rows.len());
        for (id, client_id, scopes, issued_at) in rows {
            let server_ids: Vec<String> = sqlx::query_scalar(
                "SELECT server_id FROM token_servers WHERE token_id = ? ORDER BY server_id",
            )
            .bind(&id)
            .fetch_all(&self.pool)
            .await?;
            tokens.push(ClientToken {
                id,
                client_id,
                server_ids,
                scopes: from_json_list(&scopes),
                issued_at,
            });
        }
        Ok(tokens)
    }

    /// Delete a token; grants cascade
    pub async fn delete(&self, id: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM tokens WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
