//! Settings file for the dbdeck binary
//!
//! ```yaml
//! settings:
//!   log_level: info
//!   reap_interval_secs: 30
//!   timeouts:
//!     query_ms: 30000
//! profiles:
//!   local:
//!     type: mysql
//!     host: localhost
//!     user: root
//!     password: ${MYSQL_PASSWORD:-}
//!     database: test
//! ```

use dbdeck_rdbc::connection::{ConnectionConfig, DriverTimeouts};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root of the settings file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeckConfig {
    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,

    /// Saved connection profiles by name
    #[serde(default)]
    pub profiles: BTreeMap<String, ConnectionConfig>,
}

/// Process-wide settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct GlobalSettings {
    /// Log filter used when RUST_LOG is unset
    #[serde(default)]
    pub log_level: Option<String>,

    /// How often `serve` closes idle pooled connections
    #[serde(default = "default_reap_interval")]
    #[validate(range(min = 1))]
    pub reap_interval_secs: u64,

    /// Driver timeouts
    #[serde(default)]
    #[validate(nested)]
    pub timeouts: TimeoutSettings,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_level: None,
            reap_interval_secs: default_reap_interval(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

fn default_reap_interval() -> u64 {
    30
}

/// Driver timeouts in milliseconds. Unset fields keep the built-in defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct TimeoutSettings {
    /// Opening a pooled connection
    #[validate(range(min = 1))]
    pub connect_ms: Option<u64>,
    /// Idle pooled connections older than this are closed
    #[validate(range(min = 1))]
    pub idle_ms: Option<u64>,
    /// Waiting for a free pooled connection
    #[validate(range(min = 1))]
    pub acquire_ms: Option<u64>,
    /// Running a pooled query
    #[validate(range(min = 1))]
    pub query_ms: Option<u64>,
    /// Opening a test connection
    #[validate(range(min = 1))]
    pub test_connect_ms: Option<u64>,
    /// Running the test version query
    #[validate(range(min = 1))]
    pub test_query_ms: Option<u64>,
}

impl TimeoutSettings {
    /// Overlay these settings on the built-in defaults
    pub fn to_driver_timeouts(&self) -> DriverTimeouts {
        let mut timeouts = DriverTimeouts::default();
        let overlay = [
            (self.connect_ms, &mut timeouts.pool_connect),
            (self.idle_ms, &mut timeouts.pool_idle),
            (self.acquire_ms, &mut timeouts.acquire),
            (self.query_ms, &mut timeouts.query),
            (self.test_connect_ms, &mut timeouts.test_connect),
            (self.test_query_ms, &mut timeouts.test_query),
        ];
        for (ms, slot) in overlay {
            if let Some(ms) = ms {
                *slot = Duration::from_millis(ms);
            }
        }
        timeouts
    }
}

impl DeckConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = Self::expand_env_vars(content);

        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.settings
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid settings: {}", e))?;

        for (name, profile) in &self.profiles {
            profile
                .check()
                .map_err(|e| anyhow::anyhow!("Profile '{}': {}", name, e))?;
        }

        Ok(())
    }
}
