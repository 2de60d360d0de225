//! Logging configuration

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter ("trace", "debug", "info", "warn", "error")
    #[serde(default = "default_level")]
    pub level: String,

    /// Whether to include span targets in output
    #[serde(default = "crate::domains::utils::default_true")]
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            include_targets: true,
        }
    }
}

impl Validatable for LoggingConfig {
    fn validate(&self) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        crate::validation::validate_enum_choice(
            &self.level,
            &valid_levels,
            "level",
            self.domain_name(),
        )
    }

    fn domain_name(&self) -> &'static str {
        "logging"
    }
}

fn default_level() -> String {
    "info".to_string()
}
