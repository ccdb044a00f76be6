use crate::core::get_config_dir;
use crate::core::manager::{ClusterManager, NodeManager, ResourceManager};
use crate::core::resource::{GpuType, Resource};
use crate::core::scheduler::{PlacementFailurePolicy, SchedulerBuilder};
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Capacity inventory the daemon starts with
    #[serde(default)]
    pub cluster: ClusterConfig,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    #[default]
    Requeue,
    Fail,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between scheduling passes when nothing wakes the loop early
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Jobs considered per pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub on_placement_failure: FailureMode,
    /// Only used with `on_placement_failure = "requeue"`
    #[serde(default = "default_requeue_backoff_ms")]
    pub requeue_backoff_ms: u64,
    /// Run a pass right after each submission instead of waiting for the next tick
    #[serde(default = "default_wake_on_submit")]
    pub wake_on_submit: bool,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_batch_size() -> usize {
    5
}

fn default_requeue_backoff_ms() -> u64 {
    5000
}

fn default_wake_on_submit() -> bool {
    true
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            batch_size: default_batch_size(),
            on_placement_failure: FailureMode::default(),
            requeue_backoff_ms: default_requeue_backoff_ms(),
            wake_on_submit: default_wake_on_submit(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl SchedulerConfig {
    pub fn failure_policy(&self) -> PlacementFailurePolicy {
        match self.on_placement_failure {
            FailureMode::Requeue => PlacementFailurePolicy::Requeue {
                backoff: Duration::from_millis(self.requeue_backoff_ms),
            },
            FailureMode::Fail => PlacementFailurePolicy::Fail,
        }
    }

    /// A scheduler builder carrying these settings. The cluster still has to be set.
    pub fn builder(&self) -> SchedulerBuilder {
        SchedulerBuilder::new()
            .with_interval(Duration::from_millis(self.interval_ms))
            .with_batch_size(self.batch_size)
            .with_failure_policy(self.failure_policy())
            .with_wake_on_submit(self.wake_on_submit)
            .with_event_capacity(self.event_capacity)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct LoggingConfig {
    /// Directory for daily-rotated log files. Console only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_id")]
    pub id: String,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    /// Nested clusters, same shape as this one
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

fn default_cluster_id() -> String {
    "cluster".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: default_cluster_id(),
            nodes: vec![],
            clusters: vec![],
        }
    }
}

impl ClusterConfig {
    /// Build the manager tree. Children keep the order they are listed in, nodes
    /// before nested clusters.
    pub fn build(&self) -> anyhow::Result<ClusterManager> {
        let mut children: Vec<Arc<dyn ResourceManager>> = Vec::new();
        for node in &self.nodes {
            let total = node
                .resource()
                .with_context(|| format!("Invalid node {:?} in cluster {:?}", node.id, self.id))?;
            children.push(Arc::new(NodeManager::new(total)));
        }
        for cluster in &self.clusters {
            children.push(Arc::new(cluster.build()?));
        }

        ClusterManager::new(self.id.as_str(), children)
            .with_context(|| format!("Invalid cluster {:?}", self.id))
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default)]
    pub cpu_cores: f64,
    #[serde(default)]
    pub memory_mb: f64,
    #[serde(default)]
    pub disk_gb: f64,
    /// GPU model name (case-insensitive) to count, e.g. `{ A100 = 8 }`
    #[serde(default)]
    pub gpus: HashMap<String, u32>,
}

impl NodeConfig {
    pub fn resource(&self) -> anyhow::Result<Resource> {
        if self.id.is_empty() {
            anyhow::bail!("Node id must not be empty");
        }

        let mut resource = Resource::new()
            .with_cpu_cores(self.cpu_cores)
            .with_memory_mb(self.memory_mb)
            .with_disk_gb(self.disk_gb)
            .with_id(self.id.as_str());
        for (name, &count) in &self.gpus {
            let gpu = GpuType::from_str(name)
                .map_err(|_| anyhow::anyhow!("Unknown GPU type {name:?}"))?;
            resource = resource.with_gpu(gpu, i64::from(count));
        }

        if !resource.is_valid() {
            anyhow::bail!("Capacity must not be negative: [{}]", resource);
        }
        Ok(resource)
    }
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut config_vec = vec![];

    // User-provided config file
    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            eprintln!("Warning: Config file {config_path:?} not found.");
        }
    }

    // Default config file
    if let Ok(default_config_path) = get_config_dir().map(|d| d.join("gcluster.toml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    let settings = config::Config::builder();
    let settings = config_vec.iter().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings
        .add_source(
            config::Environment::with_prefix("GCLUSTER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}
