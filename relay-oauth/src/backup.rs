//! Encrypted backup and restore of the OAuth dataset
//!
//! The payload carries plaintext secrets so a restore can re-encrypt them
//! under whatever key is current, which is why the payload itself is
//! always encrypted: with a user passphrase when given, with the master
//! key otherwise. Nothing plaintext reaches disk.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use relay_crypto::backup::{backup_decrypt, backup_encrypt};
use relay_crypto::SecretCipher;
use relay_storage::entities::{AuditSeverity, OAuthConfigRecord, OAuthTokenRecord};
use relay_storage::Store;

use crate::audit::{events, AuditLogger};
use crate::error::{OAuthError, OAuthResult};

/// Current backup format version
const FORMAT_VERSION: u32 = 1;

/// A config row with its secrets in the clear (inside the encrypted blob)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlainConfig {
    #[serde(flatten)]
    record: OAuthConfigRecord,
    client_secret: Option<String>,
    registration_access_token: Option<String>,
}

/// A token row with its secrets in the clear (inside the encrypted blob)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlainToken {
    #[serde(flatten)]
    record: OAuthTokenRecord,
    access_token: String,
    refresh_token: Option<String>,
    id_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupPayload {
    configs: Vec<PlainConfig>,
    tokens: Vec<PlainToken>,
}

/// Metadata stored alongside the encrypted payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub format_version: u32,
    pub created_at: i64,
    pub machine_id_hash: String,
    pub app_version: String,
    pub config_count: usize,
    pub token_count: usize,
    /// SHA-256 over the canonical `{configs, tokens}` JSON
    pub checksum: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupFile {
    metadata: BackupMetadata,
    /// "passphrase" or "master-key"
    encryption: String,
    /// base64 of the encrypted payload blob
    payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupHistoryEntry {
    pub file: String,
    pub created_at: i64,
    pub manual: bool,
    pub config_count: usize,
    pub token_count: usize,
}

/// Backup manager over a dated backup directory
pub struct BackupManager {
    store: Store,
    cipher: Arc<SecretCipher>,
    dir: PathBuf,
    keep_automatic: usize,
    audit: Arc<AuditLogger>,
}

impl BackupManager {
    pub fn new(
        store: Store,
        cipher: Arc<SecretCipher>,
        dir: impl Into<PathBuf>,
        keep_automatic: usize,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            store,
            cipher,
            dir: dir.into(),
            keep_automatic,
            audit,
        }
    }

    async fn collect_payload(&self) -> OAuthResult<BackupPayload> {
        let mut configs = Vec::new();
        for record in self.store.oauth_configs().list().await? {
            let client_secret = record
                .client_secret_enc
                .as_deref()
                .map(|enc| self.cipher.decrypt(enc))
                .transpose()?;
            let registration_access_token = record
                .registration_access_token_enc
                .as_deref()
                .map(|enc| self.cipher.decrypt(enc))
                .transpose()?;
            configs.push(PlainConfig {
                record,
                client_secret,
                registration_access_token,
            });
        }

        let mut tokens = Vec::new();
        for record in self.store.oauth_tokens().list().await? {
            let access_token = self.cipher.decrypt(&record.access_token_enc)?;
            let refresh_token = record
                .refresh_token_enc
                .as_deref()
                .map(|enc| self.cipher.decrypt(enc))
                .transpose()?;
            let id_token = record
                .id_token_enc
                .as_deref()
                .map(|enc| self.cipher.decrypt(enc))
                .transpose()?;
            tokens.push(PlainToken {
                record,
                access_token,
                refresh_token,
                id_token,
            });
        }

        Ok(BackupPayload { configs, tokens })
    }

    fn checksum(payload: &BackupPayload) -> OAuthResult<String> {
        let canonical = serde_json::to_vec(payload)?;
        Ok(format!("{:x}", Sha256::digest(canonical)))
    }

    /// Create a backup file; `manual` backups are never auto-pruned
    pub async fn create(
        &self,
        passphrase: Option<&str>,
        manual: bool,
    ) -> OAuthResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;

        let payload = self.collect_payload().await?;
        let payload_str = serde_json::to_string(&payload)?;

        // Both branches land on base64; the master-key cipher already
        // emits it
        let (encryption, sealed_b64) = match passphrase {
            Some(passphrase) => (
                "passphrase",
                BASE64.encode(backup_encrypt(payload_str.as_bytes(), passphrase)?),
            ),
            None => ("master-key", self.cipher.encrypt(&payload_str)?),
        };

        let now = relay_storage::now_millis();
        let metadata = BackupMetadata {
            format_version: FORMAT_VERSION,
            created_at: now,
            machine_id_hash: machine_id_hash(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            config_count: payload.configs.len(),
            token_count: payload.tokens.len(),
            checksum: Self::checksum(&payload)?,
        };

        let stamp = chrono::DateTime::from_timestamp_millis(now)
            .unwrap_or_default()
            .format("%Y%m%d-%H%M%S");
        let suffix = if manual { "-manual" } else { "" };
        // Random tail keeps rapid successive backups from colliding
        let path = self.dir.join(format!(
            "oauth-backup-{}-{}{}.json",
            stamp,
            relay_crypto::random_token(4),
            suffix
        ));

        let file = BackupFile {
            metadata: metadata.clone(),
            encryption: encryption.to_string(),
            payload: sealed_b64,
        };
        std::fs::write(&path, serde_json::to_string_pretty(&file)?)?;

        self.record_history(BackupHistoryEntry {
            file: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            created_at: now,
            manual,
            config_count: metadata.config_count,
            token_count: metadata.token_count,
        })?;

        if !manual {
            self.prune_automatic()?;
        }

        self.audit
            .log(
                events::BACKUP_CREATED,
                AuditSeverity::Info,
                None,
                serde_json::json!({
                    "file": path.file_name().map(|n| n.to_string_lossy().into_owned()),
                    "manual": manual,
                    "tokens": metadata.token_count,
                }),
            )
            .await;

        Ok(path)
    }

    /// Restore a backup: checksum verified, secrets re-encrypted under the
    /// current key, rows upserted. Returns `(configs, tokens)` counts.
    pub async fn restore(
        &self,
        path: impl AsRef<Path>,
        passphrase: Option<&str>,
    ) -> OAuthResult<(usize, usize)> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let file: BackupFile = serde_json::from_str(&content)?;

        let payload_json = match file.encryption.as_str() {
            "passphrase" => {
                let passphrase = passphrase.ok_or_else(|| {
                    OAuthError::configuration("backup requires a passphrase")
                })?;
                let sealed = BASE64.decode(&file.payload).map_err(|e| {
                    OAuthError::configuration(format!("corrupt backup payload: {}", e))
                })?;
                backup_decrypt(&sealed, passphrase)?
            }
            "master-key" => self.cipher.decrypt(&file.payload)?.into_bytes(),
            other => {
                return Err(OAuthError::configuration(format!(
                    "unknown backup encryption '{}'",
                    other
                )))
            }
        };

        let payload: BackupPayload = serde_json::from_slice(&payload_json)?;
        let checksum = Self::checksum(&payload)?;
        if checksum != file.metadata.checksum {
            return Err(OAuthError::configuration(
                "backup checksum mismatch; refusing to restore",
            ));
        }

        for config in &payload.configs {
            let mut record = config.record.clone();
            record.client_secret_enc = config
                .client_secret
                .as_deref()
                .map(|s| self.cipher.encrypt(s))
                .transpose()?;
            record.registration_access_token_enc = config
                .registration_access_token
                .as_deref()
                .map(|s| self.cipher.encrypt(s))
                .transpose()?;
            self.store.oauth_configs().upsert(&record).await?;
        }

        for token in &payload.tokens {
            let mut record = token.record.clone();
            record.access_token_enc = self.cipher.encrypt(&token.access_token)?;
            record.refresh_token_enc = token
                .refresh_token
                .as_deref()
                .map(|s| self.cipher.encrypt(s))
                .transpose()?;
            record.id_token_enc = token
                .id_token
                .as_deref()
                .map(|s| self.cipher.encrypt(s))
                .transpose()?;
            self.store.oauth_tokens().upsert(&record).await?;
        }

        self.audit
            .log(
                events::BACKUP_RESTORED,
                AuditSeverity::Warning,
                None,
                serde_json::json!({
                    "configs": payload.configs.len(),
                    "tokens": payload.tokens.len(),
                }),
            )
            .await;

        Ok((payload.configs.len(), payload.tokens.len()))
    }

    fn history_path(&self) -> PathBuf {
        self.dir.join("backup-history.json")
    }

    /// Read the backup history
    pub fn history(&self) -> OAuthResult<Vec<BackupHistoryEntry>> {
        match std::fs::read_to_string(self.history_path()) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn record_history(&self, entry: BackupHistoryEntry) -> OAuthResult<()> {
        let mut history = self.history()?;
        history.push(entry);
        std::fs::write(self.history_path(), serde_json::to_string_pretty(&history)?)?;
        Ok(())
    }

    /// Keep only the most recent automatic backups
    fn prune_automatic(&self) -> OAuthResult<()> {
        let mut history = self.history()?;
        let mut automatic: Vec<usize> = history
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.manual)
            .map(|(i, _)| i)
            .collect();

        while automatic.len() > self.keep_automatic {
            let index = automatic.remove(0);
            let entry = history[index].clone();
            let path = self.dir.join(&entry.file);
            if let Err(error) = std::fs::remove_file(&path) {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(file = %entry.file, %error, "failed to prune backup");
                }
            }
            history.retain(|e| e.file != entry.file);
            // Re-index after mutation
            automatic = history
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.manual)
                .map(|(i, _)| i)
                .collect();
        }

        std::fs::write(self.history_path(), serde_json::to_string_pretty(&history)?)?;
        Ok(())
    }
}

/// Stable, privacy-preserving machine identifier
fn machine_id_hash() -> String {
    let raw = std::fs::read_to_string("/etc/machine-id")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{:x}", Sha256::digest(raw.trim().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_crypto::KeyFile;
    use relay_storage::entities::{ServerRecord, ServerType};

    async fn fixture() -> (Store, Arc<SecretCipher>, BackupManager, tempfile::TempDir) {
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
        let manager = BackupManager::new(
            store.clone(),
            cipher.clone(),
            dir.path().join("oauth-backups"),
            7,
            audit,
        );
        (store, cipher, manager, dir)
    }

    async fn seed(store: &Store, cipher: &SecretCipher) -> String {
        let server = ServerRecord::new("github", ServerType::Remote);
        store.servers().insert(&server).await.unwrap();
        let now = relay_storage::now_millis();
        store
            .oauth_tokens()
            .upsert(&OAuthTokenRecord {
                server_id: server.id.clone(),
                access_token_enc: cipher.encrypt("the-access-token").unwrap(),
                refresh_token_enc: Some(cipher.encrypt("the-refresh-token").unwrap()),
                id_token_enc: None,
                token_type: "Bearer".to_string(),
                expires_at: Some(now + 3_600_000),
                scopes: Some(vec!["repo".to_string()]),
                refresh_count: 2,
                last_used: now,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        server.id
    }

    #[tokio::test]
    async fn test_backup_restore_round_trip_with_passphrase() {
        let (store, cipher, manager, _dir) = fixture().await;
        let server_id = seed(&store, &cipher).await;

        let path = manager.create(Some("hunter2"), true).await.unwrap();

        // Wipe and restore
        store.oauth_tokens().delete(&server_id).await.unwrap();
        let (configs, tokens) = manager.restore(&path, Some("hunter2")).await.unwrap();
        assert_eq!((configs, tokens), (0, 1));

        let record = store.oauth_tokens().get(&server_id).await.unwrap().unwrap();
        assert_eq!(
            cipher.decrypt(&record.access_token_enc).unwrap(),
            "the-access-token"
        );
        assert_eq!(record.refresh_count, 2);
    }

    #[tokio::test]
    async fn test_wrong_passphrase_rejected() {
        let (store, cipher, manager, _dir) = fixture().await;
        seed(&store, &cipher).await;

        let path = manager.create(Some("right"), true).await.unwrap();
        assert!(manager.restore(&path, Some("wrong")).await.is_err());
        assert!(manager.restore(&path, None).await.is_err());
    }

    #[tokio::test]
    async fn test_backup_file_contains_no_plaintext() {
        let (store, cipher, manager, _dir) = fixture().await;
        seed(&store, &cipher).await;

        for passphrase in [Some("p"), None] {
            let path = manager.create(passphrase, true).await.unwrap();
            let content = std::fs::read_to_string(&path).unwrap();
            assert!(!content.contains("the-access-token"));
            assert!(!content.contains("the-refresh-token"));
        }
    }

    #[tokio::test]
    async fn test_automatic_pruning_keeps_last_n() {
        let (store, cipher, manager, _dir) = fixture().await;
        seed(&store, &cipher).await;

        let manager = BackupManager {
            keep_automatic: 2,
            ..manager
        };
        for _ in 0..4 {
            manager.create(None, false).await.unwrap();
        }
        // A manual backup is never pruned
        manager.create(None, true).await.unwrap();
        for _ in 0..2 {
            manager.create(None, false).await.unwrap();
        }

        let history = manager.history().unwrap();
        let automatic = history.iter().filter(|e| !e.manual).count();
        let manual = history.iter().filter(|e| e.manual).count();
        assert_eq!(automatic, 2);
        assert_eq!(manual, 1);

        for entry in &history {
            assert!(manager.dir.join(&entry.file).exists());
        }
    }
}
