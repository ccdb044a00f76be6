use super::{Allocation, ResourceManager};
use crate::core::info::ResourceInfo;
use crate::core::resource::Resource;
use crate::core::NodeId;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Leaf manager owning one physical capacity pool.
///
/// `total` never changes after construction. `allocatable` starts as a copy of it and
/// is only ever replaced by a valid vector, under the node's own lock.
pub struct NodeManager {
    id: NodeId,
    total: Resource,
    allocatable: Mutex<Resource>,
}

impl NodeManager {
    /// Build a node from its total capacity. The node id is `total.id`.
    pub fn new(total: Resource) -> Self {
        let id = total.id.clone().unwrap_or_default();
        Self {
            id,
            allocatable: Mutex::new(total.clone()),
            total,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Resource> {
        self.allocatable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// First alternative of `demand` that fits into `allocatable`, with the capacity
    /// left over after taking it.
    fn fit(allocatable: &Resource, demand: &Resource) -> Option<(Resource, Resource)> {
        demand.alternatives().into_iter().find_map(|candidate| {
            let remaining = allocatable - &candidate;
            remaining.is_valid().then_some((candidate, remaining))
        })
    }
}

impl ResourceManager for NodeManager {
    fn id(&self) -> NodeId {
        self.id.clone()
    }

    fn total_resource(&self) -> Resource {
        self.total.clone()
    }

    fn total_allocatable_resource(&self) -> Resource {
        self.lock().clone()
    }

    fn resources(&self) -> Vec<Resource> {
        vec![self.total.clone()]
    }

    fn allocatable_resources(&self) -> Vec<Resource> {
        vec![self.total_allocatable_resource()]
    }

    fn node_ids(&self) -> Vec<NodeId> {
        vec![self.id.clone()]
    }

    fn owns(&self, node_id: &str) -> bool {
        !self.id.is_empty() && self.id == node_id
    }

    fn allocatable(&self, demand: &Resource) -> bool {
        demand.is_valid_demand() && Self::fit(&self.lock(), demand).is_some()
    }

    fn allocate_resource(&self, demand: &Resource) -> Option<Allocation> {
        if !demand.is_valid_demand() {
            tracing::warn!("Node {} rejected malformed demand [{}]", self.id, demand);
            return None;
        }

        let mut allocatable = self.lock();
        let Some((granted, remaining)) = Self::fit(&allocatable, demand) else {
            tracing::debug!(
                "Node {} cannot fit [{}] (allocatable: [{}])",
                self.id,
                demand,
                *allocatable
            );
            return None;
        };

        *allocatable = remaining.clone();
        debug_assert!(
            allocatable.is_valid(),
            "allocatable capacity of node {} went negative",
            self.id
        );

        Some(Allocation {
            node_id: self.id.clone(),
            granted,
            remaining,
        })
    }

    fn release_resource(&self, grant: &Allocation) -> Option<Resource> {
        if grant.node_id != self.id {
            tracing::error!(
                "Node {} asked to release a grant owned by {}",
                self.id,
                grant.node_id
            );
            return None;
        }

        let mut allocatable = self.lock();
        let released = &*allocatable + &grant.granted;
        if !released.is_valid() || !(&self.total - &released).is_valid() {
            tracing::warn!(
                "Node {} rejected release of [{}]: would exceed total capacity",
                self.id,
                grant.granted
            );
            return None;
        }

        *allocatable = released.clone();
        Some(released)
    }

    fn info(&self) -> ResourceInfo {
        ResourceInfo::Node {
            id: self.id.clone(),
            total: self.total.clone(),
            allocatable: self.total_allocatable_resource(),
        }
    }
}

impl fmt::Debug for NodeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeManager")
            .field("id", &self.id)
            .field("total", &self.total)
            .field("allocatable", &*self.lock())
            .finish()
    }
}
