pub mod events;
pub mod info;
pub mod job;
pub mod manager;
pub mod queue;
pub mod resource;
pub mod runtime;
pub mod scheduler;

use compact_str::CompactString;
use std::path::PathBuf;

/// Identity of a capacity pool (a node) or of a cluster of pools.
pub type NodeId = CompactString;

pub type JobId = CompactString;

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("gcluster"))
}

/// Job identifier for callers that do not bring their own.
pub fn random_job_id() -> JobId {
    let uuid = uuid::Uuid::new_v4().to_string();
    compact_str::format_compact!("job-{}", &uuid[..8])
}
