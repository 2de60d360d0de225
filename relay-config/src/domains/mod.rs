//! Domain-specific configuration modules

pub mod logging;
pub mod manager;
pub mod oauth;
pub mod storage;
pub mod utils;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main Relay configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// Persistence configuration
    #[serde(default)]
    pub storage: storage::StorageConfig,

    /// OAuth flow and governance configuration
    #[serde(default)]
    pub oauth: oauth::OAuthConfig,

    /// Upstream server manager configuration
    #[serde(default)]
    pub manager: manager::ManagerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl RelayConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.storage.validate()?;
        self.oauth.validate()?;
        self.manager.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = RelayConfig::default();
        assert!(config.validate_all().is_ok());
    }

    #[test]
    fn test_config_round_trip() {
        let config = RelayConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: RelayConfig = serde_yaml::from_str(&yaml).unwrap();
        assert!(parsed.validate_all().is_ok());
    }
}
