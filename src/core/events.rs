use crate::core::job::{Job, JobStatus};
use crate::core::manager::Allocation;
use crate::core::{JobId, NodeId};
use serde::Serialize;
use tokio::sync::broadcast;

/// Everything the scheduler core reports to the outside world.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    JobStatusChanged {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    JobPlaced {
        job: Box<Job>,
        allocation: Allocation,
    },
    PlacementFailed {
        job_id: JobId,
        attempts: u32,
        requeued: bool,
    },
    JobCancelled {
        job: Box<Job>,
    },
    /// Placement gave up on the job. It is handed out here and nowhere else.
    JobFailed {
        job: Box<Job>,
    },
    ResourcesReleased {
        job_id: JobId,
        node_id: NodeId,
    },
    NodeAdded {
        node_id: NodeId,
    },
    NodeRemoved {
        node_id: NodeId,
    },
}

impl SchedulerEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            SchedulerEvent::JobStatusChanged { job_id, .. }
            | SchedulerEvent::PlacementFailed { job_id, .. }
            | SchedulerEvent::ResourcesReleased { job_id, .. } => Some(job_id.as_str()),
            SchedulerEvent::JobPlaced { job, .. }
            | SchedulerEvent::JobCancelled { job }
            | SchedulerEvent::JobFailed { job } => Some(job.id.as_str()),
            SchedulerEvent::NodeAdded { .. } | SchedulerEvent::NodeRemoved { .. } => None,
        }
    }
}

#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber. Nobody listening is fine.
    pub fn publish(&self, event: SchedulerEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No subscribers for scheduler event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
