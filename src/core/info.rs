use crate::core::resource::Resource;
use crate::core::NodeId;
use serde::{Deserialize, Serialize};

/// Capacity snapshot of a manager subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceInfo {
    Node {
        id: NodeId,
        total: Resource,
        allocatable: Resource,
    },
    Cluster {
        id: NodeId,
        total: Resource,
        allocatable: Resource,
        children: Vec<ResourceInfo>,
    },
}

impl ResourceInfo {
    pub fn id(&self) -> &str {
        match self {
            ResourceInfo::Node { id, .. } | ResourceInfo::Cluster { id, .. } => id,
        }
    }

    pub fn total(&self) -> &Resource {
        match self {
            ResourceInfo::Node { total, .. } | ResourceInfo::Cluster { total, .. } => total,
        }
    }

    pub fn allocatable(&self) -> &Resource {
        match self {
            ResourceInfo::Node { allocatable, .. }
            | ResourceInfo::Cluster { allocatable, .. } => allocatable,
        }
    }

    /// Number of leaf nodes in this subtree.
    pub fn node_count(&self) -> usize {
        match self {
            ResourceInfo::Node { .. } => 1,
            ResourceInfo::Cluster { children, .. } => {
                children.iter().map(ResourceInfo::node_count).sum()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerInfo {
    /// Jobs waiting in the priority queue
    pub pending: usize,
    /// Jobs waiting out a placement backoff
    pub deferred: usize,
    /// Jobs holding an allocation
    pub placed: usize,
    pub cluster: ResourceInfo,
}
