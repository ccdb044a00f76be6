//! Resource managers.
//!
//! A single capability, [`ResourceManager`], is implemented by a leaf
//! ([`NodeManager`], one physical capacity pool) and by a composite
//! ([`ClusterManager`], an identified collection of child managers). A composite
//! holds its children behind the same trait, so clusters nest without special cases.
//!
//! Infeasible allocations and rejected releases are ordinary outcomes and are
//! reported as `None`, never as errors.

pub mod cluster;
pub mod node;

pub use cluster::ClusterManager;
pub use node::NodeManager;

use crate::core::info::ResourceInfo;
use crate::core::resource::Resource;
use crate::core::NodeId;
use serde::{Deserialize, Serialize};

/// A grant handed out by a successful allocation.
///
/// `node_id` names the leaf capacity pool that was debited. It is the only key used to
/// route a release back through the hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub node_id: NodeId,
    /// What was debited: the chosen GPU alternative plus the scalar demand
    pub granted: Resource,
    /// Allocatable capacity of the node right after the debit
    #[serde(default)]
    pub remaining: Resource,
}

impl Allocation {
    pub fn new(node_id: impl Into<NodeId>, granted: Resource) -> Self {
        Self {
            node_id: node_id.into(),
            granted,
            remaining: Resource::default(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait ResourceManager: Send + Sync {
    /// Identity of this manager. Empty when the manager has no id.
    fn id(&self) -> NodeId;

    fn total_resource(&self) -> Resource;

    fn total_allocatable_resource(&self) -> Resource;

    /// Total capacity of every leaf in this subtree.
    fn resources(&self) -> Vec<Resource>;

    /// Allocatable capacity of every leaf in this subtree.
    fn allocatable_resources(&self) -> Vec<Resource>;

    /// Ids of every leaf in this subtree.
    fn node_ids(&self) -> Vec<NodeId>;

    fn owns(&self, node_id: &str) -> bool {
        self.node_ids().iter().any(|id| id == node_id)
    }

    /// Whether `demand` could be allocated right now, without committing anything.
    fn allocatable(&self, demand: &Resource) -> bool;

    fn allocate_resource(&self, demand: &Resource) -> Option<Allocation>;

    /// Credit a grant back. Returns the node's new allocatable capacity.
    fn release_resource(&self, grant: &Allocation) -> Option<Resource>;

    fn info(&self) -> ResourceInfo;
}
