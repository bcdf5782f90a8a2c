//! Operator configuration
//!
//! Values come from an optional TOML file and are then overridden by
//! command-line flags / environment variables in `main`. Backoff and
//! polling bounds are tuning parameters, so all of them live here.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct OperatorConfig {
    pub platform: PlatformConfig,
    pub reconcile: ReconcileConfig,
    pub tasks: TaskPollConfig,
    pub server: ServerConfig,
}

/// Connection settings for the Cloud Director endpoint
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub api_version: String,
    pub accept_invalid_certs: bool,
    pub request_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_token: None,
            api_version: "38.0".to_string(),
            accept_invalid_certs: false,
            request_timeout_secs: 30,
        }
    }
}

/// Requeue and deadline bounds for both reconcilers
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub concurrency: u16,
    pub requeue_floor_secs: u64,
    pub requeue_ceiling_secs: u64,
    pub provision_timeout_secs: u64,
    pub resync_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            requeue_floor_secs: 5,
            requeue_ceiling_secs: 300,
            provision_timeout_secs: 1800,
            resync_secs: 600,
        }
    }
}

impl ReconcileConfig {
    pub fn requeue_floor(&self) -> Duration {
        Duration::from_secs(self.requeue_floor_secs)
    }

    pub fn requeue_ceiling(&self) -> Duration {
        Duration::from_secs(self.requeue_ceiling_secs)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }
}

/// Bounds for polling platform task handles within one reconcile call
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskPollConfig {
    pub poll_min_interval_ms: u64,
    pub poll_max_interval_ms: u64,
    pub call_deadline_secs: u64,
}

impl Default for TaskPollConfig {
    fn default() -> Self {
        Self {
            poll_min_interval_ms: 500,
            poll_max_interval_ms: 5000,
            call_deadline_secs: 20,
        }
    }
}

impl TaskPollConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.poll_min_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.poll_max_interval_ms)
    }

    pub fn call_deadline(&self) -> Duration {
        Duration::from_secs(self.call_deadline_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub metrics_addr: String,
    pub webhook_addr: String,
    pub webhook_cert_path: Option<String>,
    pub webhook_key_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            metrics_addr: "0.0.0.0:8080".to_string(),
            webhook_addr: "0.0.0.0:9443".to_string(),
            webhook_cert_path: None,
            webhook_key_path: None,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::ConfigError(format!("Invalid config: {e}")))
    }

    /// Reject combinations the reconcilers cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.platform.endpoint.is_empty() {
            return Err(Error::ConfigError(
                "platform.endpoint must be set".to_string(),
            ));
        }
        if self.reconcile.concurrency == 0 {
            return Err(Error::ConfigError(
                "reconcile.concurrency must be at least 1".to_string(),
            ));
        }
        if self.reconcile.requeue_floor_secs == 0
            || self.reconcile.requeue_floor_secs > self.reconcile.requeue_ceiling_secs
        {
            return Err(Error::ConfigError(format!(
                "requeue floor ({}s) must be non-zero and not exceed the ceiling ({}s)",
                self.reconcile.requeue_floor_secs, self.reconcile.requeue_ceiling_secs
            )));
        }
        if self.tasks.poll_min_interval_ms == 0
            || self.tasks.poll_min_interval_ms > self.tasks.poll_max_interval_ms
        {
            return Err(Error::ConfigError(format!(
                "task poll interval range {}ms..{}ms is invalid",
                self.tasks.poll_min_interval_ms, self.tasks.poll_max_interval_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_apply_to_missing_sections() {
        let config = OperatorConfig::from_toml(
            r#"
            [platform]
            endpoint = "https://vcd.example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.platform.api_version, "38.0");
        assert_eq!(config.reconcile.concurrency, 4);
        assert_eq!(config.tasks.call_deadline(), Duration::from_secs(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [platform]
            endpoint = "https://vcd.example.com"

            [reconcile]
            requeue_floor_secs = 2
            requeue_ceiling_secs = 60
            "#
        )
        .unwrap();

        let config = OperatorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.reconcile.requeue_floor(), Duration::from_secs(2));
        assert_eq!(config.reconcile.requeue_ceiling(), Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = OperatorConfig::default();
        config.platform.endpoint = "https://vcd.example.com".to_string();
        config.reconcile.requeue_floor_secs = 600;
        config.reconcile.requeue_ceiling_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_endpoint() {
        assert!(OperatorConfig::default().validate().is_err());
    }
}
