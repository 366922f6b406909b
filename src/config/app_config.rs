use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Exporter configuration, loaded from the YAML file pointed at by
/// `CONFIG_FILE` with a handful of environment overrides on top.
#[derive(Debug, Clone, Deserialize)]
pub struct CanaryConfig {
    /// Listen address for the metrics endpoint.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// How often the target cell is tested, in seconds.
    #[serde(default = "default_test_frequency")]
    pub test_frequency_seconds: u64,

    /// The delay between the ingest and the query requests, in seconds.
    #[serde(default = "default_test_delay")]
    pub test_delay_seconds: u64,

    /// Which set of query probes to run after the ingest probe.
    #[serde(default)]
    pub query_probe_set: QueryProbeSet,

    pub target: TargetConfig,
}

/// The profiling backend under test.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Base URL of the Pyroscope-compatible backend.
    pub url: String,

    /// Optional tenant, sent as the 'X-Scope-OrgID' header.
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryProbeSet {
    /// Ingest plus the merge-profile query only.
    #[default]
    Default,
    /// Ingest plus every named query probe.
    All,
}

impl CanaryConfig {
    pub fn test_frequency(&self) -> Duration {
        Duration::from_secs(self.test_frequency_seconds)
    }

    pub fn test_delay(&self) -> Duration {
        Duration::from_secs(self.test_delay_seconds)
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:4101".to_string()
}

fn default_test_frequency() -> u64 {
    15
}

fn default_test_delay() -> u64 {
    2
}

/// Load the exporter configuration from the YAML file and apply environment
/// overrides: `LISTEN_ADDRESS`, `PYROSCOPE_URL` and `PYROSCOPE_TENANT_ID`.
pub fn load_config() -> Result<CanaryConfig, ConfigError> {
    let path = env::var("CONFIG_FILE").unwrap_or_else(|_| "config.yml".to_string());
    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let mut config: CanaryConfig = serde_yaml::from_str(&raw)?;

    if let Ok(listen_address) = env::var("LISTEN_ADDRESS") {
        config.listen_address = listen_address;
    }
    if let Ok(url) = env::var("PYROSCOPE_URL") {
        config.target.url = url;
    }
    if let Ok(tenant_id) = env::var("PYROSCOPE_TENANT_ID") {
        config.target.tenant_id = Some(tenant_id);
    }

    log::info!(
        "testing {} every {}s with a {}s ingest-to-query delay",
        config.target.url,
        config.test_frequency_seconds,
        config.test_delay_seconds
    );

    Ok(config)
}
