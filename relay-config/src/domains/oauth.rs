//! OAuth flow and governance configuration

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// OAuth configuration covering the browser flow, token lifecycle,
/// and governance schedules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Loopback port for the authorization callback listener
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,

    /// Hard timeout for a browser-driven authorization
    #[serde(default = "default_flow_timeout", with = "super::utils::serde_duration")]
    pub flow_timeout: Duration,

    /// Per-attempt timeout for token-endpoint HTTP calls
    #[serde(default = "default_http_timeout", with = "super::utils::serde_duration")]
    pub http_timeout: Duration,

    /// Refresh when the token expires within this margin
    #[serde(default = "default_refresh_margin", with = "super::utils::serde_duration")]
    pub refresh_margin: Duration,

    /// Maximum refresh attempts before surfacing the failure
    #[serde(default = "default_max_refresh_attempts")]
    pub max_refresh_attempts: u32,

    /// Days between automatic key rotations
    #[serde(default = "default_rotation_interval_days")]
    pub rotation_interval_days: u32,

    /// Days of audit log file retention
    #[serde(default = "default_audit_retention_days")]
    pub audit_retention_days: u32,

    /// Number of automatic daily backups to keep
    #[serde(default = "default_backup_keep")]
    pub backup_keep: usize,

    /// Authorization flows allowed per server per 24 hours
    #[serde(default = "default_auth_limit")]
    pub auth_limit_per_day: u32,

    /// Refreshes allowed per server per hour
    #[serde(default = "default_refresh_limit")]
    pub refresh_limit_per_hour: u32,

    /// General OAuth requests allowed per server per minute
    #[serde(default = "default_general_limit")]
    pub general_limit_per_minute: u32,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            callback_port: default_callback_port(),
            flow_timeout: default_flow_timeout(),
            http_timeout: default_http_timeout(),
            refresh_margin: default_refresh_margin(),
            max_refresh_attempts: default_max_refresh_attempts(),
            rotation_interval_days: default_rotation_interval_days(),
            audit_retention_days: default_audit_retention_days(),
            backup_keep: default_backup_keep(),
            auth_limit_per_day: default_auth_limit(),
            refresh_limit_per_hour: default_refresh_limit(),
            general_limit_per_minute: default_general_limit(),
        }
    }
}

impl Validatable for OAuthConfig {
    fn validate(&self) -> ConfigResult<()> {
        crate::validation::validate_port_range(
            self.callback_port,
            "callback_port",
            self.domain_name(),
        )?;
        if self.max_refresh_attempts == 0 {
            return Err(self.validation_error("max_refresh_attempts must be greater than 0"));
        }
        if self.flow_timeout < Duration::from_secs(10) {
            return Err(self.validation_error("flow_timeout must be at least 10 seconds"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "oauth"
    }
}

fn default_callback_port() -> u16 {
    42424
}

fn default_flow_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_refresh_margin() -> Duration {
    Duration::from_secs(300)
}

fn default_max_refresh_attempts() -> u32 {
    3
}

fn default_rotation_interval_days() -> u32 {
    90
}

fn default_audit_retention_days() -> u32 {
    90
}

fn default_backup_keep() -> usize {
    7
}

fn default_auth_limit() -> u32 {
    10
}

fn default_refresh_limit() -> u32 {
    30
}

fn default_general_limit() -> u32 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OAuthConfig::default();
        assert_eq!(config.callback_port, 42424);
        assert_eq!(config.flow_timeout, Duration::from_secs(600));
        assert_eq!(config.refresh_margin, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_port_rejected() {
        let config = OAuthConfig {
            callback_port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
