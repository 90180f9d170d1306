use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use rdma_transport::EndpointConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct BenchConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Buffer sizes given on the command line take precedence.
    #[serde(default)]
    pub endpoint: EndpointConfig,
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            log_level: default_log_level(),
            endpoint: EndpointConfig::default(),
        }
    }
}

impl BenchConfig {
    pub(crate) fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.endpoint.validate()?;
        Ok(config)
    }
}
