//! Persisted state layout under the user-data directory

use std::path::{Path, PathBuf};

/// Well-known file locations inside the broker's data directory
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// Use an explicit directory, or fall back to the OS user-data
    /// location
    pub fn resolve(explicit: Option<&Path>) -> Self {
        let root = match explicit {
            Some(path) => path.to_path_buf(),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("relay"),
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The relational store
    pub fn store(&self) -> PathBuf {
        self.root.join("store.db")
    }

    /// 32 raw key bytes, mode 0o600
    pub fn key_file(&self) -> PathBuf {
        self.root.join(".oauth-key")
    }

    /// Key rotation metadata
    pub fn key_metadata(&self) -> PathBuf {
        self.root.join("oauth-keys.json")
    }

    /// Newline-delimited JSON audit entries
    pub fn audit_log(&self) -> PathBuf {
        self.root.join("oauth-audit.log")
    }

    /// Dated backup files plus `backup-history.json`
    pub fn backups(&self) -> PathBuf {
        self.root.join("oauth-backups")
    }

    /// Applied dataset versions and rollback snapshots
    pub fn migration_state(&self) -> PathBuf {
        self.root.join("oauth-migration-state.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = DataPaths::resolve(Some(Path::new("/tmp/relay-test")));
        assert_eq!(paths.store(), Path::new("/tmp/relay-test/store.db"));
        assert_eq!(paths.key_file(), Path::new("/tmp/relay-test/.oauth-key"));
        assert_eq!(
            paths.migration_state(),
            Path::new("/tmp/relay-test/oauth-migration-state.json")
        );
    }
}
