use crate::core::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};
use strum::{Display, EnumIter, EnumString};

/// GPU models known to the scheduler.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum GpuType {
    A100,
    H100,
    H200,
}

/// A vector of GPU counts plus CPU/memory/disk quantities.
///
/// The same type describes a capacity pool (with `id` set to the owning node) and a
/// demand. For a demand, `accepted_gpu` lists alternatives: `{A100: 2, H100: 2}`
/// is satisfied by either 2 A100s or 2 H100s.
///
/// Arithmetic never fails. It may produce negative components, and `is_valid` is the
/// only gate before such a value is committed as a capacity state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub accepted_gpu: BTreeMap<GpuType, i64>,
    #[serde(default)]
    pub cpu_cores: f64,
    #[serde(default)]
    pub memory_mb: f64,
    #[serde(default)]
    pub disk_gb: f64,
    /// Capacity pool identity, only set on values owned by a node manager.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,
}

impl Resource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gpu(mut self, gpu: GpuType, count: i64) -> Self {
        self.accepted_gpu.insert(gpu, count);
        self
    }

    pub fn with_cpu_cores(mut self, cpu_cores: f64) -> Self {
        self.cpu_cores = cpu_cores;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: f64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_disk_gb(mut self, disk_gb: f64) -> Self {
        self.disk_gb = disk_gb;
        self
    }

    pub fn with_id(mut self, id: impl Into<NodeId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Count for a GPU type, 0 when the type is not listed.
    pub fn gpu_count(&self, gpu: GpuType) -> i64 {
        self.accepted_gpu.get(&gpu).copied().unwrap_or(0)
    }

    /// Capacity-state gate: no component may be negative.
    pub fn is_valid(&self) -> bool {
        self.cpu_cores >= 0.0
            && self.memory_mb >= 0.0
            && self.disk_gb >= 0.0
            && self.accepted_gpu.values().all(|&count| count >= 0)
    }

    /// A demand must be a valid vector and, if it asks for GPUs at all, at least one
    /// alternative must ask for a positive count. An empty GPU map is a CPU-only demand.
    pub fn is_valid_demand(&self) -> bool {
        self.is_valid()
            && (self.accepted_gpu.is_empty() || self.accepted_gpu.values().any(|&c| c > 0))
    }

    /// Expand a demand into one concrete candidate per accepted GPU type, in GPU type
    /// order. Zero-count alternatives are skipped unless they are the only ones listed.
    pub fn alternatives(&self) -> Vec<Resource> {
        let scalars = Resource {
            accepted_gpu: BTreeMap::new(),
            cpu_cores: self.cpu_cores,
            memory_mb: self.memory_mb,
            disk_gb: self.disk_gb,
            id: None,
        };

        if self.accepted_gpu.is_empty() {
            return vec![scalars];
        }

        let positive: Vec<_> = self
            .accepted_gpu
            .iter()
            .filter(|(_, &count)| count > 0)
            .collect();
        let options = if positive.is_empty() {
            self.accepted_gpu.iter().collect()
        } else {
            positive
        };

        options
            .into_iter()
            .map(|(&gpu, &count)| scalars.clone().with_gpu(gpu, count))
            .collect()
    }

    fn combine(&self, other: &Resource, sign: i64) -> Resource {
        let mut accepted_gpu = self.accepted_gpu.clone();
        for (&gpu, &count) in &other.accepted_gpu {
            let entry = accepted_gpu.entry(gpu).or_insert(0);
            // Saturating: an oversized grant must fail the validity checks, not overflow.
            *entry = entry.saturating_add(sign.saturating_mul(count));
        }

        let sign = sign as f64;
        Resource {
            accepted_gpu,
            cpu_cores: self.cpu_cores + sign * other.cpu_cores,
            memory_mb: self.memory_mb + sign * other.memory_mb,
            disk_gb: self.disk_gb + sign * other.disk_gb,
            id: self.id.clone(),
        }
    }
}

impl Add<&Resource> for &Resource {
    type Output = Resource;

    fn add(self, rhs: &Resource) -> Resource {
        self.combine(rhs, 1)
    }
}

impl Add for Resource {
    type Output = Resource;

    fn add(self, rhs: Resource) -> Resource {
        &self + &rhs
    }
}

impl Sub<&Resource> for &Resource {
    type Output = Resource;

    fn sub(self, rhs: &Resource) -> Resource {
        self.combine(rhs, -1)
    }
}

impl Sub for Resource {
    type Output = Resource;

    fn sub(self, rhs: Resource) -> Resource {
        &self - &rhs
    }
}

impl Sum for Resource {
    fn sum<I: Iterator<Item = Resource>>(iter: I) -> Self {
        iter.fold(Resource::default(), |acc, r| &acc + &r)
    }
}

impl<'a> Sum<&'a Resource> for Resource {
    fn sum<I: Iterator<Item = &'a Resource>>(iter: I) -> Self {
        iter.fold(Resource::default(), |acc, r| &acc + r)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = &self.id {
            write!(f, "{id}: ")?;
        }
        let gpus = self
            .accepted_gpu
            .iter()
            .map(|(gpu, count)| format!("{gpu}:{count}"))
            .collect::<Vec<_>>()
            .join(",");
        write!(
            f,
            "gpu=[{gpus}] cpu={} mem={}MB disk={}GB",
            self.cpu_cores, self.memory_mb, self.disk_gb
        )
    }
}
