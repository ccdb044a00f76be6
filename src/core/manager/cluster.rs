use super::{Allocation, ResourceManager};
use crate::core::info::ResourceInfo;
use crate::core::resource::Resource;
use crate::core::NodeId;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Composite manager over an insertion-ordered set of child managers.
///
/// The cluster holds no capacity of its own; every figure it reports is a sum over the
/// children present at the time of the call. The child list lock only guards
/// structure: allocation and release run on a snapshot of the children, so a child's
/// own lock is never taken while the cluster lock is held.
pub struct ClusterManager {
    id: NodeId,
    children: RwLock<Vec<Arc<dyn ResourceManager>>>,
}

impl ClusterManager {
    pub fn new(
        id: impl Into<NodeId>,
        children: Vec<Arc<dyn ResourceManager>>,
    ) -> anyhow::Result<Self> {
        let cluster = Self::empty(id);
        for (i, child) in children.into_iter().enumerate() {
            let child_id = child.id();
            if !cluster.add_node(child) {
                anyhow::bail!(
                    "Resource manager at index {i} ({child_id:?}) has a missing or duplicate id"
                );
            }
        }
        Ok(cluster)
    }

    pub fn empty(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            children: RwLock::new(Vec::new()),
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn ResourceManager>> {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Add a child manager. Fails when the child has no id, or when its id or any of
    /// its leaf ids already exists in this cluster.
    pub fn add_node(&self, manager: Arc<dyn ResourceManager>) -> bool {
        let node_id = manager.id();
        if node_id.is_empty() {
            tracing::error!("Resource manager does not have an id");
            return false;
        }

        let incoming_leaves = manager.node_ids();
        let mut children = self
            .children
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let clash = children.iter().find_map(|child| {
            let child_id = child.id();
            if child_id == node_id || incoming_leaves.iter().any(|leaf| child.owns(leaf)) {
                return Some(child_id);
            }
            child
                .node_ids()
                .into_iter()
                .find(|leaf| *leaf == node_id)
        });
        if let Some(existing) = clash {
            tracing::error!(
                "Resource manager {} clashes with existing id {} in cluster {}",
                node_id,
                existing,
                self.id
            );
            return false;
        }

        children.push(manager);
        tracing::info!("Added {} to cluster {}", node_id, self.id);
        true
    }

    /// Remove the direct child with `node_id`. Allocations made on it are not moved.
    pub fn delete_node(&self, node_id: &str) -> bool {
        let mut children = self
            .children
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(pos) = children.iter().position(|child| child.id() == node_id) else {
            tracing::error!(
                "Resource manager with id {} does not exist in cluster {}",
                node_id,
                self.id
            );
            return false;
        };

        children.remove(pos);
        tracing::info!("Removed {} from cluster {}", node_id, self.id);
        true
    }

    pub fn node_count(&self) -> usize {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<dyn ResourceManager>> {
        self.snapshot()
            .into_iter()
            .find(|child| child.id() == node_id)
    }
}

impl ResourceManager for ClusterManager {
    fn id(&self) -> NodeId {
        self.id.clone()
    }

    fn total_resource(&self) -> Resource {
        let total: Resource = self.snapshot().iter().map(|c| c.total_resource()).sum();
        Resource {
            id: Some(self.id.clone()),
            ..total
        }
    }

    fn total_allocatable_resource(&self) -> Resource {
        let total: Resource = self
            .snapshot()
            .iter()
            .map(|c| c.total_allocatable_resource())
            .sum();
        Resource {
            id: Some(self.id.clone()),
            ..total
        }
    }

    fn resources(&self) -> Vec<Resource> {
        self.snapshot()
            .iter()
            .flat_map(|c| c.resources())
            .collect()
    }

    fn allocatable_resources(&self) -> Vec<Resource> {
        self.snapshot()
            .iter()
            .flat_map(|c| c.allocatable_resources())
            .collect()
    }

    fn node_ids(&self) -> Vec<NodeId> {
        self.snapshot().iter().flat_map(|c| c.node_ids()).collect()
    }

    fn owns(&self, node_id: &str) -> bool {
        self.snapshot().iter().any(|c| c.owns(node_id))
    }

    fn allocatable(&self, demand: &Resource) -> bool {
        self.snapshot().iter().any(|c| c.allocatable(demand))
    }

    /// First fit: the first child, in insertion order, that accepts the demand wins.
    fn allocate_resource(&self, demand: &Resource) -> Option<Allocation> {
        let allocation = self
            .snapshot()
            .iter()
            .find_map(|child| child.allocate_resource(demand));
        if allocation.is_none() {
            tracing::debug!("Cluster {} has no room for [{}]", self.id, demand);
        }
        allocation
    }

    fn release_resource(&self, grant: &Allocation) -> Option<Resource> {
        if grant.node_id.is_empty() {
            tracing::error!("Cannot release a grant without a node id");
            return None;
        }

        let Some(owner) = self
            .snapshot()
            .into_iter()
            .find(|child| child.owns(&grant.node_id))
        else {
            tracing::error!(
                "Node {} does not exist in cluster {}",
                grant.node_id,
                self.id
            );
            return None;
        };

        owner.release_resource(grant)
    }

    fn info(&self) -> ResourceInfo {
        let children: Vec<ResourceInfo> = self.snapshot().iter().map(|c| c.info()).collect();
        let total: Resource = children.iter().map(|c| c.total()).sum();
        let allocatable: Resource = children.iter().map(|c| c.allocatable()).sum();
        ResourceInfo::Cluster {
            id: self.id.clone(),
            total: Resource {
                id: Some(self.id.clone()),
                ..total
            },
            allocatable: Resource {
                id: Some(self.id.clone()),
                ..allocatable
            },
            children,
        }
    }
}

impl fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<NodeId> = self.snapshot().iter().map(|c| c.id()).collect();
        f.debug_struct("ClusterManager")
            .field("id", &self.id)
            .field("children", &ids)
            .finish()
    }
}
