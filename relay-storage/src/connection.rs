//! Store bootstrap and pooled connection handling

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::StorageResult;
use crate::migrations::MigrationRunner;
use crate::repositories::{
    AuditRepository, AuthStateRepository, ClientRepository, OAuthConfigRepository,
    OAuthTokenRepository, ServerRepository, TokenRepository, ToolPreferenceRepository,
};

/// Handle to the single-file relational store.
///
/// Cloning is cheap; all clones share the same pool. The pool enforces the
/// single-writer serialization boundary of SQLite, and every cross-component
/// consistency guarantee goes through its transactions.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the store at `path` and run pending
    /// schema migrations. Migration failure aborts startup.
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_with(path, 5, Duration::from_secs(5)).await
    }

    /// Open with explicit pool sizing
    pub async fn open_with(
        path: impl AsRef<Path>,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> StorageResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        MigrationRunner::new().run(&store.pool).await?;
        Ok(store)
    }

    /// Open an in-memory store for tests
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // A second connection would see a different in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        MigrationRunner::new().run(&store.pool).await?;
        Ok(store)
    }

    /// Access the underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Server records
    pub fn servers(&self) -> ServerRepository {
        ServerRepository::new(self.pool.clone())
    }

    /// API client records
    pub fn clients(&self) -> ClientRepository {
        ClientRepository::new(self.pool.clone())
    }

    /// Client bearer tokens
    pub fn tokens(&self) -> TokenRepository {
        TokenRepository::new(self.pool.clone())
    }

    /// Tool visibility preferences
    pub fn tool_preferences(&self) -> ToolPreferenceRepository {
        ToolPreferenceRepository::new(self.pool.clone())
    }

    /// Per-server OAuth configuration
    pub fn oauth_configs(&self) -> OAuthConfigRepository {
        OAuthConfigRepository::new(self.pool.clone())
    }

    /// Per-server OAuth token material
    pub fn oauth_tokens(&self) -> OAuthTokenRepository {
        OAuthTokenRepository::new(self.pool.clone())
    }

    /// In-flight authorization states
    pub fn auth_states(&self) -> AuthStateRepository {
        AuthStateRepository::new(self.pool.clone())
    }

    /// Audit trail
    pub fn audit(&self) -> AuditRepository {
        AuditRepository::new(self.pool.clone())
    }

    /// Close the pool, flushing WAL state
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
