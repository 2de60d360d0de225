//! Configuration loading and environment variable handling

use crate::domains::RelayConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::Path;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "RELAY".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<RelayConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: RelayConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<RelayConfig> {
        let mut config = RelayConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<RelayConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut RelayConfig) -> ConfigResult<()> {
        if let Ok(dir) = self.get_env_var("DATA_DIR") {
            config.storage.data_dir = Some(dir.into());
        }

        if let Ok(port) = self.get_env_var("OAUTH_CALLBACK_PORT") {
            config.oauth.callback_port = port
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid OAUTH_CALLBACK_PORT: {}", e)))?;
        }

        if let Ok(secs) = self.get_env_var("OAUTH_FLOW_TIMEOUT_SECONDS") {
            let seconds: u64 = secs.parse().map_err(|e| {
                ConfigError::EnvError(format!("Invalid OAUTH_FLOW_TIMEOUT_SECONDS: {}", e))
            })?;
            config.oauth.flow_timeout = Duration::from_secs(seconds);
        }

        if let Ok(auto) = self.get_env_var("AUTO_START") {
            config.manager.auto_start = auto
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid AUTO_START: {}", e)))?;
        }

        if let Ok(level) = self.get_env_var("LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(())
    }

    /// Read a prefixed environment variable
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "oauth:\n  callback_port: 43210\nmanager:\n  auto_start: false"
        )
        .unwrap();

        let config = ConfigLoader::new().from_file(file.path()).unwrap();
        assert_eq!(config.oauth.callback_port, 43210);
        assert!(!config.manager.auto_start);
        // Untouched domains keep defaults
        assert_eq!(config.storage.database_file, "store.db");
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("RELAY_TEST_LOG_LEVEL", "debug");
        let config = ConfigLoader::with_prefix("RELAY_TEST").from_env().unwrap();
        assert_eq!(config.logging.level, "debug");
        std::env::remove_var("RELAY_TEST_LOG_LEVEL");
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "oauth: [not, a, map]").unwrap();
        assert!(ConfigLoader::new().from_file(file.path()).is_err());
    }
}
