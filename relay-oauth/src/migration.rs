//! Versioned migrations over the OAuth dataset
//!
//! Distinct from the store's schema migrations: these transform the OAuth
//! configuration/token rows as a JSON dataset. Every step stores the
//! pre-image snapshot in the rollback history, and a pre-migration backup
//! is created unconditionally.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use relay_storage::entities::{AuditSeverity, OAuthConfigRecord, OAuthTokenRecord};
use relay_storage::Store;

use crate::audit::{events, AuditLogger};
use crate::backup::BackupManager;
use crate::error::{OAuthError, OAuthResult};

/// The initial dataset version
pub const BASE_VERSION: &str = "1.0.0";

/// One dataset migration step
struct DataMigration {
    /// Version reached after this step
    to: &'static str,
    description: &'static str,
    forward: fn(&mut Value) -> OAuthResult<()>,
}

/// Ordered migration chain from `BASE_VERSION` to the latest version
fn migration_chain() -> Vec<DataMigration> {
    vec![
        DataMigration {
            to: "1.1.0",
            description: "normalize provider tags to lowercase",
            forward: |dataset| {
                for config in configs_mut(dataset) {
                    if let Some(provider) = config.get("provider").and_then(Value::as_str) {
                        let normalized = provider.to_lowercase();
                        config["provider"] = Value::String(normalized);
                    }
                }
                Ok(())
            },
        },
        DataMigration {
            to: "1.2.0",
            description: "represent scopes as arrays",
            forward: |dataset| {
                for config in configs_mut(dataset) {
                    if let Some(scope) = config.get("scopes").and_then(Value::as_str) {
                        let scopes: Vec<Value> = scope
                            .split_whitespace()
                            .map(|s| Value::String(s.to_string()))
                            .collect();
                        config["scopes"] = Value::Array(scopes);
                    }
                }
                Ok(())
            },
        },
        DataMigration {
            to: "1.3.0",
            description: "track refresh counters on tokens",
            forward: |dataset| {
                for token in tokens_mut(dataset) {
                    if token.get("refresh_count").map_or(true, Value::is_null) {
                        token["refresh_count"] = Value::from(0);
                    }
                }
                Ok(())
            },
        },
        DataMigration {
            to: "1.4.0",
            description: "default missing grant types",
            forward: |dataset| {
                for config in configs_mut(dataset) {
                    let missing = config
                        .get("grant_type")
                        .and_then(Value::as_str)
                        .map_or(true, str::is_empty);
                    if missing {
                        config["grant_type"] = Value::String("authorization_code".to_string());
                    }
                }
                Ok(())
            },
        },
        DataMigration {
            to: "2.0.0",
            description: "additional parameters become structured objects",
            forward: |dataset| {
                for config in configs_mut(dataset) {
                    if let Some(raw) = config.get("additional_params").and_then(Value::as_str) {
                        let parsed: Value =
                            serde_json::from_str(raw).unwrap_or(Value::Null);
                        config["additional_params"] = parsed;
                    }
                }
                Ok(())
            },
        },
    ]
}

fn configs_mut(dataset: &mut Value) -> impl Iterator<Item = &mut Value> {
    dataset["configs"]
        .as_array_mut()
        .map(|a| a.iter_mut())
        .unwrap_or_default()
}

fn tokens_mut(dataset: &mut Value) -> impl Iterator<Item = &mut Value> {
    dataset["tokens"]
        .as_array_mut()
        .map(|a| a.iter_mut())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RollbackEntry {
    /// Version this entry can roll back *to* (the pre-image version)
    version: String,
    applied_at: i64,
    snapshot: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MigrationState {
    current_version: String,
    applied_migrations: Vec<String>,
    rollback_history: Vec<RollbackEntry>,
}

impl Default for MigrationState {
    fn default() -> Self {
        Self {
            current_version: BASE_VERSION.to_string(),
            applied_migrations: Vec::new(),
            rollback_history: Vec::new(),
        }
    }
}

/// Migrator over the OAuth dataset, state persisted in
/// `oauth-migration-state.json`
pub struct OAuthDataMigrator {
    store: Store,
    state_path: PathBuf,
    backups: Arc<BackupManager>,
    audit: Arc<AuditLogger>,
}

impl OAuthDataMigrator {
    pub fn new(
        store: Store,
        state_path: impl Into<PathBuf>,
        backups: Arc<BackupManager>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            store,
            state_path: state_path.into(),
            backups,
            audit,
        }
    }

    fn load_state(&self) -> OAuthResult<MigrationState> {
        match std::fs::read_to_string(&self.state_path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MigrationState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_state(&self, state: &MigrationState) -> OAuthResult<()> {
        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.state_path, serde_json::to_string_pretty(state)?)?;
        Ok(())
    }

    /// Current dataset version
    pub fn current_version(&self) -> OAuthResult<String> {
        Ok(self.load_state()?.current_version)
    }

    /// Applied migration versions, in order
    pub fn applied_migrations(&self) -> OAuthResult<Vec<String>> {
        Ok(self.load_state()?.applied_migrations)
    }

    async fn load_dataset(&self) -> OAuthResult<Value> {
        let configs = self.store.oauth_configs().list().await?;
        let tokens = self.store.oauth_tokens().list().await?;
        Ok(serde_json::json!({
            "configs": configs,
            "tokens": tokens,
        }))
    }

    async fn write_dataset(&self, dataset: &Value) -> OAuthResult<()> {
        let configs: Vec<OAuthConfigRecord> =
            serde_json::from_value(dataset["configs"].clone())?;
        let tokens: Vec<OAuthTokenRecord> = serde_json::from_value(dataset["tokens"].clone())?;

        for config in &configs {
            self.store.oauth_configs().upsert(config).await?;
        }
        for token in &tokens {
            self.store.oauth_tokens().upsert(token).await?;
        }
        Ok(())
    }

    /// Apply every pending migration; returns the versions applied.
    /// A pre-migration backup is created unconditionally.
    pub async fn migrate(&self) -> OAuthResult<Vec<String>> {
        let mut state = self.load_state()?;
        let chain = migration_chain();

        let start_index = chain
            .iter()
            .position(|m| !state.applied_migrations.iter().any(|a| a == m.to))
            .unwrap_or(chain.len());
        if start_index == chain.len() {
            return Ok(Vec::new());
        }

        self.backups.create(None, false).await?;

        let mut dataset = self.load_dataset().await?;
        let mut applied = Vec::new();

        for migration in &chain[start_index..] {
            let snapshot = dataset.clone();
            let pre_version = state.current_version.clone();

            (migration.forward)(&mut dataset).map_err(|e| {
                OAuthError::migration(format!(
                    "step to {} ({}) failed: {}",
                    migration.to, migration.description, e
                ))
            })?;
            self.write_dataset(&dataset).await?;

            state.rollback_history.push(RollbackEntry {
                version: pre_version,
                applied_at: relay_storage::now_millis(),
                snapshot,
            });
            state.applied_migrations.push(migration.to.to_string());
            state.current_version = migration.to.to_string();
            self.save_state(&state)?;

            self.audit
                .log(
                    events::MIGRATION_APPLIED,
                    AuditSeverity::Info,
                    None,
                    serde_json::json!({
                        "version": migration.to,
                        "description": migration.description,
                    }),
                )
                .await;
            applied.push(migration.to.to_string());
        }

        tracing::info!(
            version = %state.current_version,
            steps = applied.len(),
            "OAuth dataset migrated"
        );
        Ok(applied)
    }

    /// Roll the dataset back to `target_version` using stored snapshots
    pub async fn rollback(&self, target_version: &str) -> OAuthResult<()> {
        let mut state = self.load_state()?;

        if state.current_version == target_version {
            return Ok(());
        }
        let reachable = target_version == BASE_VERSION
            || state.applied_migrations.iter().any(|v| v == target_version);
        if !reachable {
            return Err(OAuthError::migration(format!(
                "version {} was never applied; cannot roll back to it",
                target_version
            )));
        }

        while state.current_version != target_version {
            let Some(entry) = state.rollback_history.pop() else {
                return Err(OAuthError::migration(format!(
                    "rollback history exhausted before reaching {}",
                    target_version
                )));
            };

            self.write_dataset(&entry.snapshot).await?;
            let undone = state.current_version.clone();
            state.applied_migrations.retain(|v| v != &undone);
            state.current_version = entry.version.clone();
            self.save_state(&state)?;

            self.audit
                .log(
                    events::MIGRATION_ROLLED_BACK,
                    AuditSeverity::Warning,
                    None,
                    serde_json::json!({"from": undone, "to": entry.version}),
                )
                .await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_crypto::{KeyFile, SecretCipher};
    use relay_storage::entities::{ServerRecord, ServerType};

    async fn fixture() -> (Store, OAuthDataMigrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::in_memory().await.unwrap();
        let key = KeyFile::new(dir.path().join(".oauth-key"))
            .load_or_create()
            .unwrap();
        let cipher = Arc::new(SecretCipher::new(key));
        let audit = Arc::new(
            AuditLogger::open(store.clone(), dir.path().join("audit.log"), 90)
                .await
                .unwrap(),
        );
        let backups = Arc::new(BackupManager::new(
            store.clone(),
            cipher.clone(),
            dir.path().join("oauth-backups"),
            7,
            audit.clone(),
        ));
        let migrator = OAuthDataMigrator::new(
            store.clone(),
            dir.path().join("oauth-migration-state.json"),
            backups,
            audit,
        );
        (store, migrator, dir)
    }

    async fn seed_config(store: &Store) -> String {
        let server = ServerRecord::new("github", ServerType::Remote);
        store.servers().insert(&server).await.unwrap();
        let now = relay_storage::now_millis();
        store
            .oauth_configs()
            .upsert(&OAuthConfigRecord {
                server_id: server.id.clone(),
                provider: "github".to_string(),
                discovery_url: None,
                client_id: "cid".to_string(),
                client_secret_enc: None,
                scopes: vec!["repo".to_string()],
                grant_type: "authorization_code".to_string(),
                authorization_endpoint: Some("https://a".to_string()),
                token_endpoint: Some("https://t".to_string()),
                revocation_endpoint: None,
                introspection_endpoint: None,
                userinfo_endpoint: None,
                use_pkce: true,
                dynamic_registration: false,
                audience: None,
                additional_params: None,
                registration_client_uri: None,
                registration_access_token_enc: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        server.id
    }

    fn strip_timestamps(mut value: Value) -> Value {
        for row in value["configs"].as_array_mut().into_iter().flatten() {
            row["created_at"] = Value::Null;
            row["updated_at"] = Value::Null;
            row["last_used"] = Value::Null;
        }
        for row in value["tokens"].as_array_mut().into_iter().flatten() {
            row["created_at"] = Value::Null;
            row["updated_at"] = Value::Null;
            row["last_used"] = Value::Null;
        }
        value
    }

    #[tokio::test]
    async fn test_migrate_records_five_steps() {
        let (store, migrator, _dir) = fixture().await;
        seed_config(&store).await;

        let applied = migrator.migrate().await.unwrap();
        assert_eq!(
            applied,
            vec!["1.1.0", "1.2.0", "1.3.0", "1.4.0", "2.0.0"]
        );
        assert_eq!(migrator.current_version().unwrap(), "2.0.0");
        assert_eq!(migrator.applied_migrations().unwrap().len(), 5);

        // Re-running is a no-op
        assert!(migrator.migrate().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_and_remigrate_round_trip() {
        let (store, migrator, _dir) = fixture().await;
        seed_config(&store).await;

        migrator.migrate().await.unwrap();
        let after_first = strip_timestamps(migrator.load_dataset().await.unwrap());

        migrator.rollback("1.1.0").await.unwrap();
        assert_eq!(migrator.current_version().unwrap(), "1.1.0");
        assert_eq!(migrator.applied_migrations().unwrap(), vec!["1.1.0"]);

        let applied = migrator.migrate().await.unwrap();
        assert_eq!(applied, vec!["1.2.0", "1.3.0", "1.4.0", "2.0.0"]);

        let after_second = strip_timestamps(migrator.load_dataset().await.unwrap());
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn test_rollback_to_unknown_version_rejected() {
        let (store, migrator, _dir) = fixture().await;
        seed_config(&store).await;
        migrator.migrate().await.unwrap();

        assert!(migrator.rollback("3.0.0").await.is_err());
    }

    #[tokio::test]
    async fn test_pre_migration_backup_created() {
        let (store, migrator, dir) = fixture().await;
        seed_config(&store).await;
        migrator.migrate().await.unwrap();

        let backups: Vec<_> = std::fs::read_dir(dir.path().join("oauth-backups"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("oauth-backup-"))
            .collect();
        assert!(!backups.is_empty());
    }
}
