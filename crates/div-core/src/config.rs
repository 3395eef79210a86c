//! div.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::resource::{CustomResourceDefinition, Kind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub metadata: ConfigMetadata,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub spec: ConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Logical database name, used as the table-name prefix.
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSpec {
    #[serde(default)]
    pub custom_resource_definitions: Vec<CustomResourceDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub path: PathBuf,
    /// Change records per feed shard before it rotates.
    pub shard_capacity: u64,
    /// Closed shards kept before the oldest is trimmed.
    pub retained_shards: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("div.redb"),
            shard_capacity: 256,
            retained_shards: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub shell: String,
    pub script: String,
    pub poll_interval_ms: u64,
    /// Mark `running` installs failed after this long. Unset: never.
    pub running_timeout_secs: Option<u64>,
    /// Reopen a broken watch instead of stopping the gateway.
    pub resubscribe_on_error: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            script: "echo \"$DIV_PAYLOAD\"".to_string(),
            poll_interval_ms: 500,
            running_timeout_secs: None,
            resubscribe_on_error: false,
        }
    }
}

impl GatewayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn running_timeout(&self) -> Option<Duration> {
        self.running_timeout_secs.map(Duration::from_secs)
    }
}

impl Config {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn database_name(&self) -> &str {
        &self.metadata.name
    }

    /// A config naming every built-in kind, for tests and first runs.
    pub fn scaffold(database: &str) -> Self {
        Config {
            metadata: ConfigMetadata {
                name: database.to_string(),
            },
            backend: BackendConfig::default(),
            gateway: GatewayConfig::default(),
            spec: ConfigSpec {
                custom_resource_definitions: Kind::ALL
                    .into_iter()
                    .filter(|k| k.is_namespaced())
                    .map(CustomResourceDefinition::for_kind)
                    .collect(),
            },
        }
    }
}
