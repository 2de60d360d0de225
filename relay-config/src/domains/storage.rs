//! Persistence configuration

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Relational store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the store, key file, audit log, and backups.
    /// `None` resolves to the OS user-data directory at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Store file name inside the data directory
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Maximum pool connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection acquire timeout
    #[serde(default = "default_connect_timeout", with = "super::utils::serde_duration")]
    pub connect_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            database_file: default_database_file(),
            max_connections: default_max_connections(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Validatable for StorageConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.database_file.is_empty() {
            return Err(self.validation_error("database_file cannot be empty"));
        }
        if self.max_connections == 0 {
            return Err(self.validation_error("max_connections must be greater than 0"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "storage"
    }
}

fn default_database_file() -> String {
    "store.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}
