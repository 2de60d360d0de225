//! Schema migration management
//!
//! Migrations are named, ordered, and applied inside transactions. Forward
//! steps introspect the schema before altering so a re-run against a
//! partially-applied or up-to-date database makes no changes. A failed
//! forward step with a reverse attempts the reverse, then aborts startup.

use async_trait::async_trait;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::error::{StorageError, StorageResult};

/// One named schema migration
#[async_trait]
pub trait SchemaMigration: Send + Sync {
    /// Unique, ordered identifier (lexicographic order is application order)
    fn id(&self) -> &'static str;

    /// Human-readable description
    fn description(&self) -> &'static str;

    /// Apply the migration
    async fn up(&self, conn: &mut SqliteConnection) -> StorageResult<()>;

    /// Reverse the migration, when reversible
    async fn down(&self, _conn: &mut SqliteConnection) -> StorageResult<()> {
        Err(StorageError::MigrationFailed(format!(
            "migration {} has no reverse step",
            self.id()
        )))
    }

    /// Whether a reverse step exists
    fn reversible(&self) -> bool {
        false
    }
}

/// Check whether a table exists
pub async fn table_exists(conn: &mut SqliteConnection, name: &str) -> StorageResult<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_one(conn)
            .await?;
    Ok(count > 0)
}

/// Check whether a column exists on a table
pub async fn column_exists(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
) -> StorageResult<bool> {
    let rows = sqlx::query("SELECT name FROM pragma_table_info(?)")
        .bind(table)
        .fetch_all(conn)
        .await?;
    Ok(rows
        .iter()
        .any(|row| row.get::<String, _>("name") == column))
}

/// Applies pending migrations in order at startup
pub struct MigrationRunner {
    migrations: Vec<Box<dyn SchemaMigration>>,
}

impl MigrationRunner {
    /// Runner over the built-in migration set
    pub fn new() -> Self {
        Self {
            migrations: builtin_migrations(),
        }
    }

    /// Runner over an explicit migration set (tests)
    pub fn with_migrations(migrations: Vec<Box<dyn SchemaMigration>>) -> Self {
        Self { migrations }
    }

    /// Apply all pending migrations; returns how many were applied.
    /// Any failure is fatal to startup.
    pub async fn run(&self, pool: &SqlitePool) -> StorageResult<usize> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migrations (
                id TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        let applied: Vec<String> = sqlx::query_scalar("SELECT id FROM migrations ORDER BY id")
            .fetch_all(pool)
            .await?;

        let mut count = 0usize;
        for migration in &self.migrations {
            if applied.iter().any(|id| id == migration.id()) {
                continue;
            }
            self.apply(pool, migration.as_ref()).await?;
            count += 1;
        }

        if count > 0 {
            tracing::info!(applied = count, "schema migrations applied");
        }
        Ok(count)
    }

    async fn apply(&self, pool: &SqlitePool, migration: &dyn SchemaMigration) -> StorageResult<()> {
        tracing::info!(id = migration.id(), "applying schema migration");

        let mut tx = pool.begin().await?;
        match migration.up(&mut *tx).await {
            Ok(()) => {
                sqlx::query("INSERT INTO migrations (id, description, applied_at) VALUES (?, ?, ?)")
                    .bind(migration.id())
                    .bind(migration.description())
                    .bind(crate::now_millis())
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(())
            }
            Err(error) => {
                tx.rollback().await?;
                if migration.reversible() {
                    // Best-effort cleanup of any partially-applied DDL that
                    // escaped the transaction; startup still aborts.
                    let mut conn = pool.acquire().await?;
                    if let Err(reverse_error) = migration.down(&mut *conn).await {
                        tracing::error!(
                            id = migration.id(),
                            %reverse_error,
                            "reverse step also failed"
                        );
                    }
                }
                Err(StorageError::MigrationFailed(format!(
                    "migration {} failed: {}",
                    migration.id(),
                    error
                )))
            }
        }
    }
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// The ordered built-in migration set
pub fn builtin_migrations() -> Vec<Box<dyn SchemaMigration>> {
    vec![
        Box::new(CoreTables),
        Box::new(OAuthTables),
        Box::new(AuditLog),
        Box::new(ServerVersionTracking),
    ]
}

struct CoreTables;

#[async_trait]
impl SchemaMigration for CoreTables {
    fn id(&self) -> &'static str {
        "0001_core_tables"
    }

    fn description(&self) -> &'static str {
        "servers, clients, tokens, tool preferences"
    }

    async fn up(&self, conn: &mut SqliteConnection) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                server_type TEXT NOT NULL,
                command TEXT,
                args_enc TEXT,
                env_enc TEXT,
                remote_url_enc TEXT,
                bearer_token_enc TEXT,
                input_params_enc TEXT,
                auto_start INTEGER NOT NULL DEFAULT 0,
                disabled INTEGER NOT NULL DEFAULT 0,
                tool_permissions TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS clients (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
                scopes TEXT NOT NULL DEFAULT '[]',
                issued_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS token_servers (
                token_id TEXT NOT NULL REFERENCES tokens(id) ON DELETE CASCADE,
                server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                PRIMARY KEY (token_id, server_id)
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tool_preferences (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                tool_name TEXT NOT NULL,
                client_id TEXT REFERENCES clients(id) ON DELETE CASCADE,
                enabled INTEGER NOT NULL DEFAULT 1,
                original_description TEXT,
                custom_name TEXT,
                custom_description TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        // NULL client_id is the global scope; COALESCE makes the triple unique
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS ux_tool_preferences_scope \
             ON tool_preferences (server_id, tool_name, COALESCE(client_id, ''))",
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_tokens_client ON tokens (client_id)",
        )
        .execute(&mut *conn)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_token_servers_server ON token_servers (server_id)",
        )
        .execute(&mut *conn)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_tool_preferences_server \
             ON tool_preferences (server_id)",
        )
        .execute(&mut *conn)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_tool_preferences_client \
             ON tool_preferences (client_id)",
        )
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn down(&self, conn: &mut SqliteConnection) -> StorageResult<()> {
        for table in [
            "tool_preferences",
            "token_servers",
            "tokens",
            "clients",
            "servers",
        ] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    fn reversible(&self) -> bool {
        true
    }
}

struct OAuthTables;

#[async_trait]
impl SchemaMigration for OAuthTables {
    fn id(&self) -> &'static str {
        "0002_oauth_tables"
    }

    fn description(&self) -> &'static str {
        "OAuth configs, tokens, and in-flight auth states"
    }

    async fn up(&self, conn: &mut SqliteConnection) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_configs (
                server_id TEXT PRIMARY KEY REFERENCES servers(id) ON DELETE CASCADE,
                provider TEXT NOT NULL,
                discovery_url TEXT,
                client_id TEXT NOT NULL DEFAULT '',
                client_secret_enc TEXT,
                scopes TEXT NOT NULL DEFAULT '[]',
                grant_type TEXT NOT NULL DEFAULT 'authorization_code',
                authorization_endpoint TEXT,
                token_endpoint TEXT,
                revocation_endpoint TEXT,
                introspection_endpoint TEXT,
                userinfo_endpoint TEXT,
                use_pkce INTEGER NOT NULL DEFAULT 1,
                dynamic_registration INTEGER NOT NULL DEFAULT 0,
                audience TEXT,
                additional_params TEXT,
                registration_client_uri TEXT,
                registration_access_token_enc TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_tokens (
                server_id TEXT PRIMARY KEY REFERENCES servers(id) ON DELETE CASCADE,
                access_token_enc TEXT NOT NULL,
                refresh_token_enc TEXT,
                id_token_enc TEXT,
                token_type TEXT NOT NULL DEFAULT 'Bearer',
                expires_at INTEGER,
                scopes TEXT,
                refresh_count INTEGER NOT NULL DEFAULT 0,
                last_used INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_auth_states (
                state TEXT PRIMARY KEY,
                server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                code_verifier_enc TEXT,
                code_challenge TEXT,
                redirect_uri TEXT NOT NULL,
                scopes TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_oauth_tokens_expires_at \
             ON oauth_tokens (expires_at)",
        )
        .execute(&mut *conn)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_oauth_auth_states_state \
             ON oauth_auth_states (state)",
        )
        .execute(&mut *conn)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_oauth_auth_states_server \
             ON oauth_auth_states (server_id)",
        )
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn down(&self, conn: &mut SqliteConnection) -> StorageResult<()> {
        for table in ["oauth_auth_states", "oauth_tokens", "oauth_configs"] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    fn reversible(&self) -> bool {
        true
    }
}

struct AuditLog;

#[async_trait]
impl SchemaMigration for AuditLog {
    fn id(&self) -> &'static str {
        "0003_audit_log"
    }

    fn description(&self) -> &'static str {
        "append-only audit trail"
    }

    async fn up(&self, conn: &mut SqliteConnection) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                severity TEXT NOT NULL DEFAULT 'info',
                server_id TEXT,
                details TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_audit_log_timestamp ON audit_log (timestamp)",
        )
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn down(&self, conn: &mut SqliteConnection) -> StorageResult<()> {
        sqlx::query("DROP TABLE IF EXISTS audit_log")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    fn reversible(&self) -> bool {
        true
    }
}

struct ServerVersionTracking;

#[async_trait]
impl SchemaMigration for ServerVersionTracking {
    fn id(&self) -> &'static str {
        "0004_server_version_tracking"
    }

    fn description(&self) -> &'static str {
        "track the latest known upstream version per server"
    }

    async fn up(&self, conn: &mut SqliteConnection) -> StorageResult<()> {
        if !column_exists(conn, "servers", "latest_known_version").await? {
            sqlx::query("ALTER TABLE servers ADD COLUMN latest_known_version TEXT")
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    async fn down(&self, conn: &mut SqliteConnection) -> StorageResult<()> {
        if column_exists(conn, "servers", "latest_known_version").await? {
            sqlx::query("ALTER TABLE servers DROP COLUMN latest_known_version")
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    fn reversible(&self) -> bool {
        true
    }
}
