//! OAuth configuration, token, and auth-state persistence

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::entities::{AuthStateRecord, OAuthConfigRecord, OAuthTokenRecord};
use crate::error::StorageResult;
use crate::repositories::{from_json_list, to_json_list};

/// Repository over the `oauth_configs` table
#[derive(Clone)]
pub struct OAuthConfigRepository {
    pool: SqlitePool,
}

fn map_config(row: &SqliteRow) -> StorageResult<OAuthConfigRecord> {
    let additional_params = match row.get::<Option<String>, _>("additional_params") {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };
    Ok(OAuthConfigRecord {
        server_id: row.get("server_id"),
        provider: row.get("provider"),
        discovery_url: row.get("discovery_url"),
        client_id: row.get("client_id"),
        client_secret_enc: row.get("client_secret_enc"),
        scopes: from_json_list(row.get::<String, _>("scopes").as_str()),
        grant_type: row.get("grant_type"),
        authorization_endpoint: row.get("authorization_endpoint"),
        token_endpoint: row.get("token_endpoint"),
        revocation_endpoint: row.get("revocation_endpoint"),
        introspection_endpoint: row.get("introspection_endpoint"),
        userinfo_endpoint: row.get("userinfo_endpoint"),
        use_pkce: row.get("use_pkce"),
        dynamic_registration: row.get("dynamic_registration"),
        audience: row.get("audience"),
        additional_params,
        registration_client_uri: row.get("registration_client_uri"),
        registration_access_token_enc: row.get("registration_access_token_enc"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

impl OAuthConfigRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the configuration for a server
    pub async fn upsert(&self, config: &OAuthConfigRecord) -> StorageResult<()> {
        let additional_params = config
            .additional_params
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO oauth_configs (
                server_id, provider, discovery_url, client_id, client_secret_enc,
                scopes, grant_type, authorization_endpoint, token_endpoint,
                revocation_endpoint, introspection_endpoint, userinfo_endpoint,
                use_pkce, dynamic_registration, audience, additional_params,
                registration_client_uri, registration_access_token_enc,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (server_id) DO UPDATE SET
                provider = excluded.provider,
                discovery_url = excluded.discovery_url,
                client_id = excluded.client_id,
                client_secret_enc = excluded.client_secret_enc,
                scopes = excluded.scopes,
                grant_type = excluded.grant_type,
                authorization_endpoint = excluded.authorization_endpoint,
                token_endpoint = excluded.token_endpoint,
                revocation_endpoint = excluded.revocation_endpoint,
                introspection_endpoint = excluded.introspection_endpoint,
                userinfo_endpoint = excluded.userinfo_endpoint,
                use_pkce = excluded.use_pkce,
                dynamic_registration = excluded.dynamic_registration,
                audience = excluded.audience,
                additional_params = excluded.additional_params,
                registration_client_uri = excluded.registration_client_uri,
                registration_access_token_enc = excluded.registration_access_token_enc,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&config.server_id)
        .bind(&config.provider)
        .bind(&config.discovery_url)
        .bind(&config.client_id)
        .bind(&config.client_secret_enc)
        .bind(to_json_list(&config.scopes))
        .bind(&config.grant_type)
        .bind(&config.authorization_endpoint)
        .bind(&config.token_endpoint)
        .bind(&config.revocation_endpoint)
        .bind(&config.introspection_endpoint)
        .bind(&config.userinfo_endpoint)
        .bind(config.use_pkce)
        .bind(config.dynamic_registration)
        .bind(&config.audience)
        .bind(additional_params)
        .bind(&config.registration_client_uri)
        .bind(&config.registration_access_token_enc)
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, server_id: &str) -> StorageResult<Option<OAuthConfigRecord>> {
        let row = sqlx::query("SELECT * FROM oauth_configs WHERE server_id = ?")
            .bind(server_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_config).transpose()
    }

    pub async fn list(&self) -> StorageResult<Vec<OAuthConfigRecord>> {
        let rows = sqlx::query("SELECT * FROM oauth_configs ORDER BY server_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_config).collect()
    }

    pub async fn delete(&self, server_id: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM oauth_configs WHERE server_id = ?")
            .bind(server_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Repository over the `oauth_tokens` table
#[derive(Clone)]
pub struct OAuthTokenRepository {
    pool: SqlitePool,
}

fn map_token(row: &SqliteRow) -> OAuthTokenRecord {
    OAuthTokenRecord {
        server_id: row.get("server_id"),
        access_token_enc: row.get("access_token_enc"),
        refresh_token_enc: row.get("refresh_token_enc"),
        id_token_enc: row.get("id_token_enc"),
        token_type: row.get("token_type"),
        expires_at: row.get("expires_at"),
        scopes: row
            .get::<Option<String>, _>("scopes")
            .map(|raw| from_json_list(&raw)),
        refresh_count: row.get("refresh_count"),
        last_used: row.get("last_used"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

impl OAuthTokenRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the token row for a server
    pub async fn upsert(&self, token: &OAuthTokenRecord) -> StorageResult<()> {
        let scopes = token.scopes.as_ref().map(|s| to_json_list(s));
        sqlx::query(
            r#"
            INSERT INTO oauth_tokens (
                server_id, access_token_enc, refresh_token_enc, id_token_enc,
                token_type, expires_at, scopes, refresh_count, last_used,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (server_id) DO UPDATE SET
                access_token_enc = excluded.access_token_enc,
                refresh_token_enc = excluded.refresh_token_enc,
                id_token_enc = excluded.id_token_enc,
                token_type = excluded.token_type,
                expires_at = excluded.expires_at,
                scopes = excluded.scopes,
                refresh_count = excluded.refresh_count,
                last_used = excluded.last_used,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&token.server_id)
        .bind(&token.access_token_enc)
        .bind(&token.refresh_token_enc)
        .bind(&token.id_token_enc)
        .bind(&token.token_type)
        .bind(token.expires_at)
        .bind(scopes)
        .bind(token.refresh_count)
        .bind(token.last_used)
        .bind(token.created_at)
        .bind(token.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, server_id: &str) -> StorageResult<Option<OAuthTokenRecord>> {
        let row = sqlx::query("SELECT * FROM oauth_tokens WHERE server_id = ?")
            .bind(server_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_token))
    }

    pub async fn list(&self) -> StorageResult<Vec<OAuthTokenRecord>> {
        let rows = sqlx::query("SELECT * FROM oauth_tokens ORDER BY server_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(map_token).collect())
    }

    /// Record usage without touching the token material
    pub async fn touch_last_used(&self, server_id: &str) -> StorageResult<()> {
        sqlx::query("UPDATE oauth_tokens SET last_used = ? WHERE server_id = ?")
            .bind(crate::now_millis())
            .bind(server_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, server_id: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM oauth_tokens WHERE server_id = ?")
            .bind(server_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Repository over the `oauth_auth_states` table
#[derive(Clone)]
pub struct AuthStateRepository {
    pool: SqlitePool,
}

fn map_state(row: &SqliteRow) -> AuthStateRecord {
    AuthStateRecord {
        state: row.get("state"),
        server_id: row.get("server_id"),
        code_verifier_enc: row.get("code_verifier_enc"),
        code_challenge: row.get("code_challenge"),
        redirect_uri: row.get("redirect_uri"),
        scopes: from_json_list(row.get::<String, _>("scopes").as_str()),
        created_at: row.get("created_at"),
    }
}

impl AuthStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, record: &AuthStateRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO oauth_auth_states (
                state, server_id, code_verifier_enc, code_challenge,
                redirect_uri, scopes, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.state)
        .bind(&record.server_id)
        .bind(&record.code_verifier_enc)
        .bind(&record.code_challenge)
        .bind(&record.redirect_uri)
        .bind(to_json_list(&record.scopes))
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch and delete in one step; an auth state is single-use
    pub async fn take(&self, state: &str) -> StorageResult<Option<AuthStateRecord>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM oauth_auth_states WHERE state = ?")
            .bind(state)
            .fetch_optional(&mut *tx)
            .await?;
        let record = row.as_ref().map(map_state);
        if record.is_some() {
            sqlx::query("DELETE FROM oauth_auth_states WHERE state = ?")
                .bind(state)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(record)
    }

    pub async fn list(&self) -> StorageResult<Vec<AuthStateRecord>> {
        let rows = sqlx::query("SELECT * FROM oauth_auth_states ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(map_state).collect())
    }

    /// Garbage-collect states created before the cutoff
    pub async fn delete_older_than(&self, cutoff_millis: i64) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM oauth_auth_states WHERE created_at < ?")
            .bind(cutoff_millis)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_for_server(&self, server_id: &str) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM oauth_auth_states WHERE server_id = ?")
            .bind(server_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Replace every encrypted OAuth column in a single transaction.
///
/// Used by key rotation: all rows re-encrypted under the new key are written
/// atomically, so a failure leaves the old key authoritative.
pub async fn replace_encrypted_material(
    pool: &SqlitePool,
    tokens: &[OAuthTokenRecord],
    states: &[AuthStateRecord],
    configs: &[OAuthConfigRecord],
) -> StorageResult<()> {
    let mut tx = pool.begin().await?;

    for token in tokens {
        sqlx::query(
            "UPDATE oauth_tokens SET access_token_enc = ?, refresh_token_enc = ?, \
             id_token_enc = ?, updated_at = ? WHERE server_id = ?",
        )
        .bind(&token.access_token_enc)
        .bind(&token.refresh_token_enc)
        .bind(&token.id_token_enc)
        .bind(crate::now_millis())
        .bind(&token.server_id)
        .execute(&mut *tx)
        .await?;
    }

    for state in states {
        sqlx::query("UPDATE oauth_auth_states SET code_verifier_enc = ? WHERE state = ?")
            .bind(&state.code_verifier_enc)
            .bind(&state.state)
            .execute(&mut *tx)
            .await?;
    }

    for config in configs {
        sqlx::query(
            "UPDATE oauth_configs SET client_secret_enc = ?, \
             registration_access_token_enc = ?, updated_at = ? WHERE server_id = ?",
        )
        .bind(&config.client_secret_enc)
        .bind(&config.registration_access_token_enc)
        .bind(crate::now_millis())
        .bind(&config.server_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}
