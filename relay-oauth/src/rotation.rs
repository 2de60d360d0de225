//! Master key rotation
//!
//! Rotation re-encrypts every encrypted OAuth column under a fresh key in
//! one transaction, then atomically replaces the key file and swaps the
//! in-memory key. Any failure before the commit leaves the old key
//! authoritative.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use relay_crypto::cipher::encrypt_with_key;
use relay_crypto::keyfile::{KeyFile, KEY_LEN};
use relay_crypto::SecretCipher;
use relay_storage::entities::AuditSeverity;
use relay_storage::repositories::oauth::replace_encrypted_material;
use relay_storage::Store;

use crate::audit::{events, AuditLogger};
use crate::error::OAuthResult;

/// Rotation metadata persisted beside the key file (`oauth-keys.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationMetadata {
    /// Monotonically increasing key version
    pub version: u64,
    /// When the current key was installed, millis
    pub rotated_at: i64,
    /// When the next automatic rotation is due, millis
    pub next_rotation: i64,
}

/// Key rotation manager; ticked hourly and invocable on demand
pub struct KeyRotationManager {
    store: Store,
    cipher: Arc<SecretCipher>,
    keyfile: KeyFile,
    metadata_path: PathBuf,
    audit: Arc<AuditLogger>,
    interval_millis: i64,
}

impl KeyRotationManager {
    pub fn new(
        store: Store,
        cipher: Arc<SecretCipher>,
        keyfile: KeyFile,
        metadata_path: impl Into<PathBuf>,
        audit: Arc<AuditLogger>,
        interval_days: u32,
    ) -> Self {
        Self {
            store,
            cipher,
            keyfile,
            metadata_path: metadata_path.into(),
            audit,
            interval_millis: interval_days as i64 * 24 * 3600 * 1000,
        }
    }

    /// Load metadata, initializing version 1 on first run
    pub fn metadata(&self) -> OAuthResult<RotationMetadata> {
        match std::fs::read_to_string(&self.metadata_path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let now = relay_storage::now_millis();
                let metadata = RotationMetadata {
                    version: 1,
                    rotated_at: now,
                    next_rotation: now + self.interval_millis,
                };
                self.write_metadata(&metadata)?;
                Ok(metadata)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_metadata(&self, metadata: &RotationMetadata) -> OAuthResult<()> {
        if let Some(parent) = self.metadata_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.metadata_path, serde_json::to_string_pretty(metadata)?)?;
        Ok(())
    }

    /// Whether the automatic rotation is due
    pub fn due(&self) -> OAuthResult<bool> {
        Ok(self.metadata()?.next_rotation <= relay_storage::now_millis())
    }

    /// Rotate now. Returns the new key version.
    pub async fn rotate(&self) -> OAuthResult<u64> {
        let metadata = self.metadata()?;

        let mut new_key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut new_key);

        // Re-encrypt every encrypted column under the new key. Decryption
        // failures abort rotation; the old key stays authoritative.
        let mut tokens = self.store.oauth_tokens().list().await?;
        for token in &mut tokens {
            token.access_token_enc = reencrypt(
                &self.cipher,
                &new_key,
                &token.access_token_enc,
            )?;
            token.refresh_token_enc = token
                .refresh_token_enc
                .as_deref()
                .map(|enc| reencrypt(&self.cipher, &new_key, enc))
                .transpose()?;
            token.id_token_enc = token
                .id_token_enc
                .as_deref()
                .map(|enc| reencrypt(&self.cipher, &new_key, enc))
                .transpose()?;
        }

        let mut states = self.store.auth_states().list().await?;
        for state in &mut states {
            state.code_verifier_enc = state
                .code_verifier_enc
                .as_deref()
                .map(|enc| reencrypt(&self.cipher, &new_key, enc))
                .transpose()?;
        }

        let mut configs = self.store.oauth_configs().list().await?;
        for config in &mut configs {
            config.client_secret_enc = config
                .client_secret_enc
                .as_deref()
                .map(|enc| reencrypt(&self.cipher, &new_key, enc))
                .transpose()?;
            config.registration_access_token_enc = config
                .registration_access_token_enc
                .as_deref()
                .map(|enc| reencrypt(&self.cipher, &new_key, enc))
                .transpose()?;
        }

        replace_encrypted_material(self.store.pool(), &tokens, &states, &configs).await?;

        // Only after the commit does the new key become authoritative
        self.keyfile.write(&new_key)?;
        self.cipher.swap_key(new_key);

        let now = relay_storage::now_millis();
        let updated = RotationMetadata {
            version: metadata.version + 1,
            rotated_at: now,
            next_rotation: now + self.interval_millis,
        };
        self.write_metadata(&updated)?;

        self.audit
            .log(
                events::KEY_ROTATED,
                AuditSeverity::Info,
                None,
                serde_json::json!({
                    "key_version": updated.version,
                    "tokens": tokens.len(),
                    "auth_states": states.len(),
                }),
            )
            .await;
        tracing::info!(version = updated.version, "encryption key rotated");

        Ok(updated.version)
    }

    /// Hourly scheduler entry point
    pub async fn rotate_if_due(&self) -> OAuthResult<Option<u64>> {
        if self.due()? {
            Ok(Some(self.rotate().await?))
        } else {
            Ok(None)
        }
    }
}

fn reencrypt(
    cipher: &SecretCipher,
    new_key: &[u8; KEY_LEN],
    ciphertext: &str,
) -> OAuthResult<String> {
    let plaintext = cipher.decrypt(ciphertext)?;
    Ok(encrypt_with_key(new_key, &plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_storage::entities::{OAuthTokenRecord, ServerRecord, ServerType};

    async fn fixture() -> (Store, Arc<SecretCipher>, KeyRotationManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::in_memory().await.unwrap();
        let keyfile = KeyFile::new(dir.path().join(".oauth-key"));
        let key = keyfile.load_or_create().unwrap();
        let cipher = Arc::new(SecretCipher::new(key));
        let audit = Arc::new(
            AuditLogger::open(store.clone(), dir.path().join("audit.log"), 90)
                .await
                .unwrap(),
        );
        let manager = KeyRotationManager::new(
            store.clone(),
            cipher.clone(),
            KeyFile::new(dir.path().join(".oauth-key")),
            dir.path().join("oauth-keys.json"),
            audit,
            90,
        );
        (store, cipher, manager, dir)
    }

    async fn seed_token(store: &Store, cipher: &SecretCipher, name: &str, secret: &str) -> String {
        let server = ServerRecord::new(name, ServerType::Remote);
        store.servers().insert(&server).await.unwrap();
        let now = relay_storage::now_millis();
        store
            .oauth_tokens()
            .upsert(&OAuthTokenRecord {
                server_id: server.id.clone(),
                access_token_enc: cipher.encrypt(secret).unwrap(),
                refresh_token_enc: Some(cipher.encrypt("refresh-secret").unwrap()),
                id_token_enc: None,
                token_type: "Bearer".to_string(),
                expires_at: None,
                scopes: None,
                refresh_count: 0,
                last_used: now,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        server.id
    }

    #[tokio::test]
    async fn test_rotation_preserves_plaintext() {
        let (store, cipher, manager, _dir) = fixture().await;

        let mut servers = Vec::new();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let secret = format!("access-token-{}", i);
            let id = seed_token(&store, &cipher, name, &secret).await;
            servers.push((id, secret));
        }

        let version = manager.rotate().await.unwrap();
        assert_eq!(version, 2);

        for (server_id, secret) in servers {
            let record = store.oauth_tokens().get(&server_id).await.unwrap().unwrap();
            assert_eq!(cipher.decrypt(&record.access_token_enc).unwrap(), secret);
            assert_eq!(
                cipher.decrypt(record.refresh_token_enc.as_deref().unwrap()).unwrap(),
                "refresh-secret"
            );
        }
    }

    #[tokio::test]
    async fn test_version_is_monotone() {
        let (_store, _cipher, manager, _dir) = fixture().await;
        assert_eq!(manager.metadata().unwrap().version, 1);
        assert_eq!(manager.rotate().await.unwrap(), 2);
        assert_eq!(manager.rotate().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_not_due_immediately() {
        let (_store, _cipher, manager, _dir) = fixture().await;
        assert!(!manager.due().unwrap());
        assert!(manager.rotate_if_due().await.unwrap().is_none());
    }
}
