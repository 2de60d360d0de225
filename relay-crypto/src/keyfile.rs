//! Master key file handling

use rand::RngCore;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{CryptoError, CryptoResult};

/// Length of the master key in bytes
pub const KEY_LEN: usize = 32;

/// The master key file: 32 raw bytes, owner-only permissions
pub struct KeyFile {
    path: PathBuf,
}

impl KeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the key, generating and persisting a fresh one if the file is
    /// missing
    pub fn load_or_create(&self) -> CryptoResult<[u8; KEY_LEN]> {
        match std::fs::read(&self.path) {
            Ok(bytes) => {
                if bytes.len() != KEY_LEN {
                    return Err(CryptoError::InvalidKeyLength {
                        expected: KEY_LEN,
                        actual: bytes.len(),
                    });
                }
                let mut key = [0u8; KEY_LEN];
                key.copy_from_slice(&bytes);
                Ok(key)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut key = [0u8; KEY_LEN];
                rand::thread_rng().fill_bytes(&mut key);
                self.write(&key)?;
                tracing::info!(path = %self.path.display(), "generated new encryption key");
                Ok(key)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a key atomically: write to a sibling temp file with
    /// restricted permissions, then rename over the target.
    pub fn write(&self, key: &[u8; KEY_LEN]) -> CryptoResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&tmp)?;
        file.write_all(key)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_create_generates_once() {
        let dir = tempfile::tempdir().unwrap();
        let keyfile = KeyFile::new(dir.path().join(".oauth-key"));

        let first = keyfile.load_or_create().unwrap();
        let second = keyfile.load_or_create().unwrap();
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let keyfile = KeyFile::new(dir.path().join(".oauth-key"));
        keyfile.load_or_create().unwrap();

        let mode = std::fs::metadata(keyfile.path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_truncated_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".oauth-key");
        std::fs::write(&path, b"short").unwrap();

        let result = KeyFile::new(&path).load_or_create();
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKeyLength { actual: 5, .. })
        ));
    }
}
