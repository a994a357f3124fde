mod bag;
mod keys;
mod validation;

pub use bag::{ConfigBag, ConfigValue, Deferred, Flags, ValueSupplier, REDACTED};
pub use keys::{ConfigKey, KeyDecl};
pub use validation::ValidationError;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

// Re-export existing config types
pub use crate::cluster::ClusterConfig;

/// Complete Topo configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TopoConfig {
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Task engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskConfig {
    /// Size of the worker pool executing task bodies
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

fn default_worker_count() -> usize {
    8
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
        }
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    /// Listener invocations allowed to run at once
    #[serde(default = "default_listener_concurrency")]
    pub listener_concurrency: usize,
}

fn default_listener_concurrency() -> usize {
    4
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listener_concurrency: default_listener_concurrency(),
        }
    }
}

impl TopoConfig {
    /// Apply env vars on top of the loaded values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("TOPO_WORKER_COUNT") {
            if let Ok(n) = v.parse::<usize>() {
                self.tasks.worker_count = n;
            }
        }
        if let Ok(v) = std::env::var("TOPO_LISTENER_CONCURRENCY") {
            if let Ok(n) = v.parse::<usize>() {
                self.bus.listener_concurrency = n;
            }
        }
        if let Ok(v) = std::env::var("TOPO_FOLLOWER_ID_FLOOR") {
            if let Ok(n) = v.parse::<i64>() {
                self.cluster.follower_id_floor = n;
            }
        }
        if let Ok(v) = std::env::var("TOPO_PRIMARY_WAIT_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                self.cluster.primary_wait_timeout_seconds = n;
            }
        }
        self
    }
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<TopoConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: TopoConfig = toml::from_str(&contents).context("Failed to parse config file")?;
    Ok(config)
}

#[cfg(test)]
mod tests;
