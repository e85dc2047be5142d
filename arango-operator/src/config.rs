//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for metrics and healthchecks.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The Kubernetes namespace watched by this operator.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,
    /// The image of this operator, reported at startup.
    #[serde(default)]
    pub operator_image: Option<String>,

    /// Keep the member counts of clusters in sync with the counts edited through the database UI.
    ///
    /// When turned off, any count override found in a cluster is cleared instead.
    #[serde(default = "Config::default_scaling_integration_enabled")]
    pub scaling_integration_enabled: bool,
    /// The timeout in seconds of calls made against the database servers.
    #[serde(default = "Config::default_database_timeout_seconds")]
    pub database_timeout_seconds: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Self = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the values of this config.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.namespace.is_empty(), "NAMESPACE must not be empty");
        ensure!(self.database_timeout_seconds >= 1, "DATABASE_TIMEOUT_SECONDS must be at least 1 second");
        Ok(())
    }

    /// The timeout of calls made against the database servers.
    pub fn database_timeout(&self) -> Duration {
        Duration::from_secs(self.database_timeout_seconds)
    }

    fn default_http_port() -> u16 {
        8080
    }

    fn default_scaling_integration_enabled() -> bool {
        true
    }

    fn default_database_timeout_seconds() -> u64 {
        10
    }

    /// Create a config suitable for tests.
    #[cfg(test)]
    pub fn new_test() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            rust_log: "error".into(),
            http_port: 8080,
            namespace: "default".into(),
            pod_name: "arango-operator-0".into(),
            operator_image: None,
            scaling_integration_enabled: true,
            database_timeout_seconds: 1,
        })
    }
}
