//! Application context: construction and teardown of the dependency graph

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use relay_config::RelayConfig;
use relay_crypto::{KeyFile, SecretCipher};
use relay_mcp::transport::DefaultTransportFactory;
use relay_mcp::{Gateway, ServerManager, TokenService, ToolFilterService};
use relay_oauth::{
    AuditLogger, BackupManager, BrowserOpener, KeyRotationManager, OAuthDataMigrator,
    OAuthService, RateLimiter, RateLimits, SystemBrowser,
};
use relay_storage::Store;

use crate::bridge::OAuthHeaderBridge;
use crate::paths::DataPaths;

/// Startup and wiring failures
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] relay_config::ConfigError),

    #[error(transparent)]
    Storage(#[from] relay_storage::StorageError),

    #[error(transparent)]
    Crypto(#[from] relay_crypto::CryptoError),

    #[error(transparent)]
    OAuth(#[from] relay_oauth::OAuthError),

    #[error(transparent)]
    Mcp(#[from] relay_mcp::McpError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The assembled broker
pub struct AppContext {
    pub config: RelayConfig,
    pub paths: DataPaths,
    pub store: Store,
    pub cipher: Arc<SecretCipher>,
    pub audit: Arc<AuditLogger>,
    pub oauth: Arc<OAuthService>,
    pub rotation: Arc<KeyRotationManager>,
    pub backups: Arc<BackupManager>,
    pub migrator: Arc<OAuthDataMigrator>,
    pub tokens: Arc<TokenService>,
    pub filters: Arc<ToolFilterService>,
    pub manager: Arc<ServerManager>,
    pub gateway: Arc<Gateway>,

    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl AppContext {
    /// Build the full dependency graph:
    /// Store → Crypto → {Tokens, Filter, OAuth} → Manager → Gateway.
    ///
    /// Startup order matters: schema migrations run inside `Store::open`,
    /// OAuth dataset migrations run before anything consumes the rows,
    /// and both are fatal on failure.
    pub async fn init(config: RelayConfig) -> Result<Arc<Self>, ServerError> {
        Self::init_with_browser(config, Arc::new(SystemBrowser)).await
    }

    /// Same, with the browser collaborator substituted (tests)
    pub async fn init_with_browser(
        config: RelayConfig,
        browser: Arc<dyn BrowserOpener>,
    ) -> Result<Arc<Self>, ServerError> {
        config.validate_all()?;
        let paths = DataPaths::resolve(config.storage.data_dir.as_deref());
        std::fs::create_dir_all(paths.root())?;

        // Store (schema migrations run here; failure aborts startup)
        let store = Store::open_with(
            paths.store(),
            config.storage.max_connections,
            config.storage.connect_timeout,
        )
        .await?;

        // Crypto
        let key = KeyFile::new(paths.key_file()).load_or_create()?;
        let cipher = Arc::new(SecretCipher::new(key));

        // Governance plumbing
        let audit = Arc::new(
            AuditLogger::open(
                store.clone(),
                paths.audit_log(),
                config.oauth.audit_retention_days,
            )
            .await?,
        );
        let limiter = RateLimiter::new(RateLimits {
            auth_per_window: config.oauth.auth_limit_per_day,
            refresh_per_window: config.oauth.refresh_limit_per_hour,
            general_per_window: config.oauth.general_limit_per_minute,
            ..RateLimits::default()
        });

        // OAuth core
        let oauth = OAuthService::new(
            store.clone(),
            cipher.clone(),
            config.oauth.clone(),
            audit.clone(),
            limiter,
            browser,
        )?;

        let backups = Arc::new(BackupManager::new(
            store.clone(),
            cipher.clone(),
            paths.backups(),
            config.oauth.backup_keep,
            audit.clone(),
        ));
        let migrator = Arc::new(OAuthDataMigrator::new(
            store.clone(),
            paths.migration_state(),
            backups.clone(),
            audit.clone(),
        ));
        migrator.migrate().await?;

        let rotation = Arc::new(KeyRotationManager::new(
            store.clone(),
            cipher.clone(),
            KeyFile::new(paths.key_file()),
            paths.key_metadata(),
            audit.clone(),
            config.oauth.rotation_interval_days,
        ));

        // Stale in-flight authorizations from previous runs
        oauth.garbage_collect_auth_states().await?;

        // Broker core
        let tokens = Arc::new(TokenService::new(store.clone()));
        let filters = Arc::new(ToolFilterService::new(store.clone()));
        let factory = Arc::new(DefaultTransportFactory::new(Arc::new(
            OAuthHeaderBridge::new(oauth.clone()),
        )));
        let manager = ServerManager::new(
            store.clone(),
            cipher.clone(),
            filters.clone(),
            factory,
            config.manager.clone(),
        )
        .await?;
        let gateway = Arc::new(Gateway::new(
            tokens.clone(),
            filters.clone(),
            manager.clone(),
        ));

        let context = Arc::new(Self {
            config,
            paths,
            store,
            cipher,
            audit,
            oauth,
            rotation,
            backups,
            migrator,
            tokens,
            filters,
            manager,
            gateway,
            scheduler: Mutex::new(None),
        });

        context.spawn_scheduler().await;
        Ok(context)
    }

    /// Hourly governance tick: auth-state GC, key rotation when due, and
    /// at most one automatic backup per day
    async fn spawn_scheduler(self: &Arc<Self>) {
        let context = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3600));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if let Err(error) = context.oauth.garbage_collect_auth_states().await {
                    tracing::warn!(%error, "auth-state GC failed");
                }
                if let Err(error) = context.rotation.rotate_if_due().await {
                    tracing::warn!(%error, "scheduled key rotation failed");
                }
                if let Err(error) = context.daily_backup_if_due().await {
                    tracing::warn!(%error, "automatic backup failed");
                }
            }
        });
        *self.scheduler.lock().await = Some(handle);
    }

    async fn daily_backup_if_due(&self) -> Result<(), ServerError> {
        let last_automatic = self
            .backups
            .history()?
            .into_iter()
            .filter(|entry| !entry.manual)
            .map(|entry| entry.created_at)
            .max();
        let day = 24 * 3600 * 1000;
        let due = last_automatic
            .map(|at| relay_storage::now_millis() - at >= day)
            .unwrap_or(true);
        if due {
            self.backups.create(None, false).await?;
        }
        Ok(())
    }

    /// Launch every auto-start server; failures are logged, not fatal
    pub async fn auto_start(&self) -> usize {
        if !self.config.manager.auto_start {
            return 0;
        }
        let manager = self.manager.clone();
        manager.auto_start_all().await
    }

    /// Reverse-order teardown: gateway has no resources, the manager
    /// stops upstreams, OAuth cancels its timers, the store flushes last
    pub async fn shutdown(&self) {
        if let Some(handle) = self.scheduler.lock().await.take() {
            handle.abort();
        }
        self.manager.clear_all().await;
        self.oauth.shutdown().await;
        self.store.close().await;
        tracing::info!("broker shut down");
    }
}
