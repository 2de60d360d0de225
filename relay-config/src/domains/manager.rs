//! Upstream server manager configuration

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Timeout from local spawn (or remote connect) to first message
    #[serde(default = "default_start_timeout", with = "super::utils::serde_duration")]
    pub start_timeout: Duration,

    /// Whether auto-start servers are launched at startup
    #[serde(default = "crate::domains::utils::default_true")]
    pub auto_start: bool,

    /// Per-server structured log ring capacity
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            start_timeout: default_start_timeout(),
            auto_start: true,
            log_capacity: default_log_capacity(),
        }
    }
}

impl Validatable for ManagerConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.log_capacity == 0 {
            return Err(self.validation_error("log_capacity must be greater than 0"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "manager"
    }
}

fn default_start_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_log_capacity() -> usize {
    500
}
