pub mod apply;
pub mod delete;
pub mod gateway;
pub mod get;
pub mod logs;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use tracing::debug;

use div_core::{Config, Kind};
use div_state::{LogStore, RedbBackend, ResourceStore};

/// Everything a command needs: the loaded config and the stores for the
/// selected namespace.
pub struct Context {
    pub config: Config,
    pub store: ResourceStore,
    pub logs: LogStore,
}

impl Context {
    /// Load `config_path`, open its backend and provision every kind the
    /// config declares that has no table yet.
    pub fn open(config_path: &Path, namespace: &str) -> anyhow::Result<Self> {
        let config = Config::from_file(config_path)
            .with_context(|| format!("failed to load config {}", config_path.display()))?;
        Self::from_config(config, namespace)
    }

    pub fn from_config(config: Config, namespace: &str) -> anyhow::Result<Self> {
        let backend = RedbBackend::open(&config.backend.path)
            .with_context(|| format!("failed to open {}", config.backend.path.display()))?
            .with_shard_capacity(config.backend.shard_capacity)
            .with_retained_shards(config.backend.retained_shards);
        let store = ResourceStore::new(Arc::new(backend), config.database_name(), namespace)
            .with_poll_interval(config.gateway.poll_interval());
        let provisioned = store
            .provision(&config.spec.custom_resource_definitions)
            .context("failed to provision kinds from config")?;
        if provisioned > 0 {
            debug!(provisioned, %namespace, "kinds provisioned from config");
        }
        let logs = LogStore::for_store(&store);
        Ok(Self {
            config,
            store,
            logs,
        })
    }
}

pub(crate) fn parse_kind(resource: &str) -> anyhow::Result<Kind> {
    resource
        .parse()
        .with_context(|| format!("unknown resource type \"{resource}\""))
}
