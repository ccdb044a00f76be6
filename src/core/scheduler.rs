use crate::core::events::{EventBus, SchedulerEvent};
use crate::core::info::SchedulerInfo;
use crate::core::job::{Job, JobStateReason, JobStatus};
use crate::core::manager::{Allocation, ClusterManager, ResourceManager};
use crate::core::queue::JobQueue;
use crate::core::JobId;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, Notify};

/// What happens to a job that no capacity pool can take right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementFailurePolicy {
    /// Keep the job Pending and retry it after `backoff`, at its original queue position.
    Requeue { backoff: Duration },
    /// Mark the job Failed and hand it out through a `JobFailed` event.
    Fail,
}

impl Default for PlacementFailurePolicy {
    fn default() -> Self {
        PlacementFailurePolicy::Requeue {
            backoff: Duration::from_secs(5),
        }
    }
}

/// Outcome of one scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleReport {
    /// Deferred jobs moved back into the queue
    pub promoted: usize,
    pub attempted: usize,
    pub placed: usize,
    pub requeued: usize,
    pub failed: usize,
}

impl ScheduleReport {
    pub fn is_idle(&self) -> bool {
        self.promoted == 0 && self.attempted == 0
    }
}

/// A placed job together with the grant that must be released when it finishes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Placement {
    pub job: Job,
    pub allocation: Allocation,
}

#[derive(Debug)]
struct Deferred {
    ready_at: Instant,
    job: Job,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Admission and placement core.
///
/// Jobs move between three places: the priority queue, the deferred list (placement
/// failed, waiting out a backoff) and the placements table (holding an allocation). A job
/// is in at most one of them at a time. Every id in any of them is also in `admitted`
/// from submission until the job is handed out. No two locks are held at once.
pub struct Scheduler {
    queue: JobQueue,
    cluster: Arc<ClusterManager>,
    admitted: Mutex<HashSet<JobId>>,
    placements: Mutex<HashMap<JobId, Placement>>,
    deferred: Mutex<Vec<Deferred>>,
    events: Arc<EventBus>,
    wake: Arc<Notify>,
    batch_size: usize,
    interval: Duration,
    policy: PlacementFailurePolicy,
    wake_on_submit: bool,
}

impl Scheduler {
    /// Admit a job into the queue.
    ///
    /// Rejects demands that could never be placed, multi-replica jobs and ids the
    /// scheduler already tracks.
    pub fn submit_job(&self, mut job: Job) -> bool {
        if !job.resource.is_valid_demand() {
            tracing::warn!("Rejected job {}: malformed demand [{}]", job.id, job.resource);
            return false;
        }
        if job.replicas != 1 {
            tracing::warn!(
                "Rejected job {}: {} replicas requested, only single-replica jobs are placed",
                job.id,
                job.replicas
            );
            return false;
        }
        if !lock(&self.admitted).insert(job.id.clone()) {
            tracing::warn!("Rejected job {}: id already in use", job.id);
            return false;
        }

        job.submitted_at = SystemTime::now();
        let job_id = job.id.clone();
        let from = job.status;
        match self.queue.enqueue(job) {
            Ok(None) => {}
            Ok(Some(replaced)) => {
                tracing::error!("Job {} replaced an untracked queued job", replaced.id);
            }
            Err(job) => {
                lock(&self.admitted).remove(&job.id);
                tracing::warn!("Rejected job {}: cannot be queued from {}", job.id, from);
                return false;
            }
        }

        tracing::info!("Job {} submitted", job_id);
        self.events.publish(SchedulerEvent::JobStatusChanged {
            job_id,
            from,
            to: JobStatus::Pending,
        });
        if self.wake_on_submit {
            self.wake.notify_one();
        }
        true
    }

    /// Withdraw a job that has not been placed yet.
    ///
    /// The job ends Terminated and is handed out through `JobCancelled`. Calling this
    /// for an unknown, placed or already cancelled job returns false and changes nothing.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let Some(mut job) = self.queue.remove(job_id).or_else(|| self.take_deferred(job_id))
        else {
            tracing::debug!("Job {} is not pending, nothing to cancel", job_id);
            return false;
        };

        lock(&self.admitted).remove(&job.id);
        let from = job.status;
        job.set_status(JobStatus::Terminated);
        job.reason = Some(JobStateReason::CancelledByUser);
        tracing::info!("Job {} cancelled", job.id);

        self.events.publish(SchedulerEvent::JobStatusChanged {
            job_id: job.id.clone(),
            from,
            to: JobStatus::Terminated,
        });
        self.events.publish(SchedulerEvent::JobCancelled { job: Box::new(job) });
        true
    }

    pub fn add_node(&self, manager: Arc<dyn ResourceManager>) -> bool {
        let node_id = manager.id();
        if !self.cluster.add_node(manager) {
            return false;
        }
        self.events.publish(SchedulerEvent::NodeAdded { node_id });
        // New capacity may unblock queued jobs.
        self.wake.notify_one();
        true
    }

    /// Detach a node. Allocations it granted are not revoked; releasing them later fails.
    pub fn delete_node(&self, node_id: &str) -> bool {
        if !self.cluster.delete_node(node_id) {
            return false;
        }
        self.events.publish(SchedulerEvent::NodeRemoved {
            node_id: node_id.into(),
        });
        true
    }

    /// Run one scheduling pass: promote expired backoffs, then try to place up to
    /// `batch_size` jobs in queue order.
    pub fn schedule_once(&self) -> ScheduleReport {
        let mut report = ScheduleReport {
            promoted: self.promote_deferred(Instant::now()),
            ..Default::default()
        };

        while report.attempted < self.batch_size {
            let Some(job) = self.queue.dequeue() else {
                break;
            };
            report.attempted += 1;
            self.place(job, &mut report);
        }

        report
    }

    fn place(&self, mut job: Job, report: &mut ScheduleReport) {
        job.placement_attempts += 1;

        let Some(allocation) = self.cluster.allocate_resource(&job.resource) else {
            self.handle_placement_failure(job, report);
            return;
        };

        let from = job.status;
        let inserted = match lock(&self.placements).entry(job.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                job.set_status(JobStatus::Scheduled);
                job.reason = None;
                slot.insert(Placement {
                    job: job.clone(),
                    allocation: allocation.clone(),
                });
                true
            }
        };

        if !inserted {
            // The live placement keeps the id, so `admitted` is left alone.
            tracing::error!(
                "Job {} is already placed, giving back [{}] on {}",
                job.id,
                allocation.granted,
                allocation.node_id
            );
            if self.cluster.release_resource(&allocation).is_none() {
                tracing::error!(
                    "Failed to release [{}] of duplicate job {} on {}",
                    allocation.granted,
                    job.id,
                    allocation.node_id
                );
            }
            self.hand_out_failed(job, JobStateReason::DuplicateId);
            report.failed += 1;
            return;
        }

        tracing::info!(
            "Job {} placed on {} ([{}])",
            job.id,
            allocation.node_id,
            allocation.granted
        );
        self.events.publish(SchedulerEvent::JobStatusChanged {
            job_id: job.id.clone(),
            from,
            to: JobStatus::Scheduled,
        });
        self.events.publish(SchedulerEvent::JobPlaced {
            job: Box::new(job),
            allocation,
        });
        report.placed += 1;
    }

    /// Mark a job Failed and publish it through `JobFailed`. The caller owns `admitted`.
    fn hand_out_failed(&self, mut job: Job, reason: JobStateReason) {
        let from = job.status;
        job.set_status(JobStatus::Failed);
        job.reason = Some(reason);
        self.events.publish(SchedulerEvent::JobStatusChanged {
            job_id: job.id.clone(),
            from,
            to: JobStatus::Failed,
        });
        self.events.publish(SchedulerEvent::JobFailed { job: Box::new(job) });
    }

    fn handle_placement_failure(&self, mut job: Job, report: &mut ScheduleReport) {
        match self.policy {
            PlacementFailurePolicy::Requeue { backoff } => {
                job.reason = Some(JobStateReason::WaitingForResources);
                tracing::debug!(
                    "No capacity for job {} (attempt {}), retrying in {:?}",
                    job.id,
                    job.placement_attempts,
                    backoff
                );
                self.events.publish(SchedulerEvent::PlacementFailed {
                    job_id: job.id.clone(),
                    attempts: job.placement_attempts,
                    requeued: true,
                });
                lock(&self.deferred).push(Deferred {
                    ready_at: Instant::now() + backoff,
                    job,
                });
                report.requeued += 1;
            }
            PlacementFailurePolicy::Fail => {
                tracing::warn!("No capacity for job {}, marking it failed", job.id);
                self.events.publish(SchedulerEvent::PlacementFailed {
                    job_id: job.id.clone(),
                    attempts: job.placement_attempts,
                    requeued: false,
                });
                lock(&self.admitted).remove(&job.id);
                self.hand_out_failed(job, JobStateReason::NoCapacity);
                report.failed += 1;
            }
        }
    }

    /// Move deferred jobs whose backoff has expired back into the queue.
    fn promote_deferred(&self, now: Instant) -> usize {
        let ready: Vec<Job> = {
            let mut deferred = lock(&self.deferred);
            let (ready, waiting): (Vec<_>, Vec<_>) =
                deferred.drain(..).partition(|d| d.ready_at <= now);
            *deferred = waiting;
            ready.into_iter().map(|d| d.job).collect()
        };

        let mut promoted = 0;
        for job in ready {
            match self.queue.enqueue(job) {
                Ok(None) => promoted += 1,
                Ok(Some(replaced)) => {
                    promoted += 1;
                    tracing::error!("Deferred job {} replaced a queued duplicate", replaced.id);
                }
                Err(job) => {
                    tracing::error!("Deferred job {} could not be queued again", job.id);
                    lock(&self.admitted).remove(&job.id);
                    self.hand_out_failed(job, JobStateReason::NoCapacity);
                }
            }
        }
        promoted
    }

    fn take_deferred(&self, job_id: &str) -> Option<Job> {
        let mut deferred = lock(&self.deferred);
        let pos = deferred.iter().position(|d| d.job.id == job_id)?;
        Some(deferred.remove(pos).job)
    }

    /// Mark a placed job as started by the execution layer.
    pub fn mark_running(&self, job_id: &str) -> bool {
        let from = {
            let mut placements = lock(&self.placements);
            let Some(placement) = placements.get_mut(job_id) else {
                tracing::warn!("Job {} is not placed", job_id);
                return false;
            };
            let from = placement.job.status;
            if !placement.job.set_status(JobStatus::Running) {
                return false;
            }
            from
        };

        self.events.publish(SchedulerEvent::JobStatusChanged {
            job_id: job_id.into(),
            from,
            to: JobStatus::Running,
        });
        true
    }

    /// Report how a placed job ended and release its allocation.
    ///
    /// `status` must be Completed, Failed, Terminated or Preempted. A preempted job goes
    /// back into the queue with its original submission time, and the returned value is
    /// a snapshot of it as queued; if it cannot be queued it is handed back as Preempted.
    /// Otherwise the job is handed back and the scheduler forgets it.
    pub fn finish_job(&self, job_id: &str, status: JobStatus) -> Option<Job> {
        if !(status.is_terminal() || status == JobStatus::Preempted) {
            tracing::warn!("Job {} cannot finish as {}", job_id, status);
            return None;
        }

        let Placement {
            mut job,
            allocation,
        } = {
            let mut placements = lock(&self.placements);
            let Some(placement) = placements.get(job_id) else {
                tracing::warn!("Job {} is not placed", job_id);
                return None;
            };
            if !placement.job.status.can_transition_to(status) {
                tracing::warn!(
                    "Job {} cannot move from {} to {}",
                    job_id,
                    placement.job.status,
                    status
                );
                return None;
            }
            placements.remove(job_id)?
        };

        match self.cluster.release_resource(&allocation) {
            Some(_) => self.events.publish(SchedulerEvent::ResourcesReleased {
                job_id: job.id.clone(),
                node_id: allocation.node_id.clone(),
            }),
            None => tracing::error!(
                "Failed to release [{}] of job {} on {}",
                allocation.granted,
                job.id,
                allocation.node_id
            ),
        }

        let from = job.status;
        job.set_status(status);
        tracing::info!("Job {} finished as {}", job.id, status);
        self.events.publish(SchedulerEvent::JobStatusChanged {
            job_id: job.id.clone(),
            from,
            to: status,
        });

        if status != JobStatus::Preempted {
            lock(&self.admitted).remove(&job.id);
            return Some(job);
        }

        job.preemption_count += 1;
        job.reason = Some(JobStateReason::Preempted);
        let job_id = job.id.clone();
        match self.queue.enqueue(job) {
            Ok(None) => {}
            Ok(Some(replaced)) => {
                tracing::error!("Preempted job {} replaced a queued duplicate", replaced.id);
            }
            Err(job) => {
                tracing::error!("Preempted job {} could not be queued again", job.id);
                lock(&self.admitted).remove(&job.id);
                return Some(job);
            }
        }
        self.events.publish(SchedulerEvent::JobStatusChanged {
            job_id: job_id.clone(),
            from: JobStatus::Preempted,
            to: JobStatus::Pending,
        });
        self.wake.notify_one();
        self.queue.get(&job_id)
    }

    /// A job that is waiting for placement, queued or deferred.
    pub fn pending_job(&self, job_id: &str) -> Option<Job> {
        self.queue.get(job_id).or_else(|| {
            lock(&self.deferred)
                .iter()
                .find(|d| d.job.id == job_id)
                .map(|d| d.job.clone())
        })
    }

    /// Queued jobs in placement order, followed by deferred ones.
    pub fn pending_jobs(&self) -> Vec<Job> {
        let mut jobs = self.queue.list_all();
        jobs.extend(lock(&self.deferred).iter().map(|d| d.job.clone()));
        jobs
    }

    pub fn placement(&self, job_id: &str) -> Option<Placement> {
        lock(&self.placements).get(job_id).cloned()
    }

    pub fn placements(&self) -> Vec<Placement> {
        lock(&self.placements).values().cloned().collect()
    }

    pub fn info(&self) -> SchedulerInfo {
        SchedulerInfo {
            pending: self.queue.len(),
            deferred: lock(&self.deferred).len(),
            placed: lock(&self.placements).len(),
            cluster: self.cluster.info(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn cluster(&self) -> &Arc<ClusterManager> {
        &self.cluster
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Signalled whenever there may be new work for the scheduling loop.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn policy(&self) -> PlacementFailurePolicy {
        self.policy
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("cluster", &self.cluster)
            .field("pending", &self.queue.len())
            .field("batch_size", &self.batch_size)
            .field("interval", &self.interval)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Builder for creating Scheduler instances
pub struct SchedulerBuilder {
    cluster: Option<Arc<ClusterManager>>,
    events: Option<Arc<EventBus>>,
    event_capacity: usize,
    batch_size: usize,
    interval: Duration,
    policy: PlacementFailurePolicy,
    wake_on_submit: bool,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            cluster: None,
            events: None,
            event_capacity: 1024,
            batch_size: 5,
            interval: Duration::from_secs(5),
            policy: PlacementFailurePolicy::default(),
            wake_on_submit: true,
        }
    }

    pub fn with_cluster(mut self, cluster: Arc<ClusterManager>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_failure_policy(mut self, policy: PlacementFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_wake_on_submit(mut self, wake_on_submit: bool) -> Self {
        self.wake_on_submit = wake_on_submit;
        self
    }

    pub fn build(self) -> Scheduler {
        Scheduler {
            queue: JobQueue::new(),
            cluster: self
                .cluster
                .unwrap_or_else(|| Arc::new(ClusterManager::empty("cluster"))),
            admitted: Mutex::new(HashSet::new()),
            placements: Mutex::new(HashMap::new()),
            deferred: Mutex::new(Vec::new()),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(EventBus::new(self.event_capacity))),
            wake: Arc::new(Notify::new()),
            batch_size: self.batch_size,
            interval: self.interval,
            policy: self.policy,
            wake_on_submit: self.wake_on_submit,
        }
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobBuilder;
    use crate::core::manager::NodeManager;
    use crate::core::resource::{GpuType, Resource};

    fn node(id: &str, a100: i64) -> Arc<dyn ResourceManager> {
        Arc::new(NodeManager::new(
            Resource::new()
                .with_gpu(GpuType::A100, a100)
                .with_cpu_cores(32.0)
                .with_id(id),
        ))
    }

    fn gpu_job(id: &str, a100: i64) -> Job {
        JobBuilder::new()
            .id(id)
            .user("alice")
            .resource(Resource::new().with_gpu(GpuType::A100, a100))
            .build()
    }

    fn create_test_scheduler(policy: PlacementFailurePolicy) -> Scheduler {
        let cluster =
            ClusterManager::new("c", vec![node("n1", 0), node("n2", 4)]).unwrap();
        SchedulerBuilder::new()
            .with_cluster(Arc::new(cluster))
            .with_batch_size(10)
            .with_failure_policy(policy)
            .build()
    }

    fn drain(rx: &mut broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    const NO_BACKOFF: PlacementFailurePolicy = PlacementFailurePolicy::Requeue {
        backoff: Duration::ZERO,
    };

    #[test]
    fn test_submit_enqueues_pending() {
        let scheduler = create_test_scheduler(NO_BACKOFF);
        let mut rx = scheduler.subscribe();

        assert!(scheduler.submit_job(gpu_job("j1", 1)));
        let job = scheduler.pending_job("j1").unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(scheduler.info().pending, 1);

        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [SchedulerEvent::JobStatusChanged {
                from: JobStatus::Submitted,
                to: JobStatus::Pending,
                ..
            }]
        ));
    }

    #[test]
    fn test_submit_rejects_bad_jobs() {
        let scheduler = create_test_scheduler(NO_BACKOFF);

        assert!(!scheduler.submit_job(gpu_job("zero", 0)));
        assert!(!scheduler.submit_job(
            JobBuilder::new()
                .id("neg")
                .resource(Resource::new().with_cpu_cores(-1.0))
                .build()
        ));
        assert!(!scheduler.submit_job(
            JobBuilder::new()
                .id("gang")
                .resource(Resource::new().with_gpu(GpuType::A100, 1))
                .replicas(2)
                .build()
        ));

        assert!(scheduler.submit_job(gpu_job("dup", 1)));
        assert!(!scheduler.submit_job(gpu_job("dup", 1)));
        assert_eq!(scheduler.pending_jobs().len(), 1);
    }

    #[test]
    fn test_schedule_once_places_first_fit() {
        let scheduler = create_test_scheduler(NO_BACKOFF);
        let mut rx = scheduler.subscribe();
        scheduler.submit_job(gpu_job("j1", 1));
        drain(&mut rx);

        let report = scheduler.schedule_once();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.placed, 1);

        let placement = scheduler.placement("j1").unwrap();
        assert_eq!(placement.allocation.node_id, "n2");
        assert_eq!(placement.job.status, JobStatus::Scheduled);
        assert_eq!(placement.job.placement_attempts, 1);
        assert!(scheduler.pending_job("j1").is_none());

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, SchedulerEvent::JobPlaced { allocation, .. } if allocation.node_id == "n2")));
    }

    #[test]
    fn test_batch_size_limits_pass() {
        let cluster = ClusterManager::new("c", vec![node("n1", 8)]).unwrap();
        let scheduler = SchedulerBuilder::new()
            .with_cluster(Arc::new(cluster))
            .with_batch_size(2)
            .build();
        for i in 0..5 {
            scheduler.submit_job(gpu_job(&format!("j{i}"), 1));
        }

        assert_eq!(scheduler.schedule_once().placed, 2);
        assert_eq!(scheduler.info().pending, 3);
        assert_eq!(scheduler.schedule_once().placed, 2);
        assert_eq!(scheduler.schedule_once().placed, 1);
        assert!(scheduler.schedule_once().is_idle());
        assert_eq!(scheduler.info().placed, 5);
    }

    #[test]
    fn test_requeue_keeps_unplaceable_job() {
        let scheduler = create_test_scheduler(NO_BACKOFF);
        let mut rx = scheduler.subscribe();
        scheduler.submit_job(gpu_job("big", 8));

        let report = scheduler.schedule_once();
        assert_eq!(report.requeued, 1);
        let waiting = scheduler.pending_job("big").unwrap();
        assert_eq!(waiting.status, JobStatus::Pending);
        assert_eq!(waiting.reason, Some(JobStateReason::WaitingForResources));
        assert_eq!(scheduler.info().deferred, 1);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            SchedulerEvent::PlacementFailed { requeued: true, attempts: 1, .. }
        )));

        // Backoff expired: promoted, retried, still no room.
        let report = scheduler.schedule_once();
        assert_eq!(report.promoted, 1);
        assert_eq!(report.requeued, 1);

        assert!(scheduler.add_node(node("n3", 8)));
        let report = scheduler.schedule_once();
        assert_eq!(report.placed, 1);
        let placement = scheduler.placement("big").unwrap();
        assert_eq!(placement.allocation.node_id, "n3");
        assert_eq!(placement.job.placement_attempts, 3);
        assert!(placement.job.reason.is_none());
    }

    #[test]
    fn test_requeue_waits_out_backoff() {
        let scheduler = create_test_scheduler(PlacementFailurePolicy::Requeue {
            backoff: Duration::from_secs(3600),
        });
        scheduler.submit_job(gpu_job("big", 8));
        scheduler.schedule_once();

        let report = scheduler.schedule_once();
        assert_eq!(report.promoted, 0);
        assert_eq!(report.attempted, 0);
        assert!(scheduler.pending_job("big").is_some());
    }

    #[test]
    fn test_requeued_job_keeps_position() {
        let scheduler = create_test_scheduler(NO_BACKOFF);
        scheduler.submit_job(gpu_job("first", 8));
        scheduler.schedule_once();
        let submitted_at = scheduler.pending_job("first").unwrap().submitted_at;

        std::thread::sleep(Duration::from_millis(2));
        scheduler.submit_job(gpu_job("second", 8));

        // Promotion puts "first" back ahead of the later submission.
        scheduler.promote_deferred(Instant::now());
        let queued = scheduler.pending_jobs();
        assert_eq!(queued[0].id, "first");
        assert_eq!(queued[0].submitted_at, submitted_at);
        assert_eq!(queued[1].id, "second");
    }

    #[test]
    fn test_fail_policy_hands_job_out() {
        let scheduler = create_test_scheduler(PlacementFailurePolicy::Fail);
        let mut rx = scheduler.subscribe();
        scheduler.submit_job(gpu_job("big", 8));
        drain(&mut rx);

        let report = scheduler.schedule_once();
        assert_eq!(report.failed, 1);
        assert!(scheduler.pending_job("big").is_none());
        assert!(scheduler.placement("big").is_none());

        let failed = drain(&mut rx)
            .into_iter()
            .find_map(|e| match e {
                SchedulerEvent::JobFailed { job } => Some(job),
                _ => None,
            })
            .unwrap();
        assert_eq!(failed.id, "big");
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.reason, Some(JobStateReason::NoCapacity));
    }

    #[test]
    fn test_cancel_pending_job() {
        let scheduler = create_test_scheduler(NO_BACKOFF);
        let mut rx = scheduler.subscribe();
        scheduler.submit_job(gpu_job("j1", 1));
        drain(&mut rx);

        assert!(scheduler.cancel_job("j1"));
        assert!(!scheduler.cancel_job("j1"));
        assert!(!scheduler.cancel_job("unknown"));
        assert!(scheduler.schedule_once().is_idle());

        let cancelled = drain(&mut rx)
            .into_iter()
            .find_map(|e| match e {
                SchedulerEvent::JobCancelled { job } => Some(job),
                _ => None,
            })
            .unwrap();
        assert_eq!(cancelled.status, JobStatus::Terminated);
        assert_eq!(cancelled.reason, Some(JobStateReason::CancelledByUser));
    }

    #[test]
    fn test_cancel_deferred_job() {
        let scheduler = create_test_scheduler(NO_BACKOFF);
        scheduler.submit_job(gpu_job("big", 8));
        scheduler.schedule_once();
        assert_eq!(scheduler.info().deferred, 1);

        assert!(scheduler.cancel_job("big"));
        assert_eq!(scheduler.info().deferred, 0);
        assert_eq!(scheduler.schedule_once().promoted, 0);
    }

    #[test]
    fn test_placed_job_cannot_be_cancelled() {
        let scheduler = create_test_scheduler(NO_BACKOFF);
        scheduler.submit_job(gpu_job("j1", 1));
        scheduler.schedule_once();

        assert!(!scheduler.cancel_job("j1"));
        assert!(scheduler.placement("j1").is_some());
    }

    #[test]
    fn test_finish_releases_capacity() {
        let scheduler = create_test_scheduler(NO_BACKOFF);
        let before = scheduler.cluster().total_allocatable_resource();
        scheduler.submit_job(gpu_job("j1", 3));
        scheduler.schedule_once();
        assert_eq!(
            scheduler
                .cluster()
                .total_allocatable_resource()
                .gpu_count(GpuType::A100),
            1
        );

        assert!(scheduler.mark_running("j1"));
        let mut rx = scheduler.subscribe();
        let job = scheduler.finish_job("j1", JobStatus::Completed).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(scheduler.placement("j1").is_none());
        assert_eq!(scheduler.cluster().total_allocatable_resource(), before);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            SchedulerEvent::ResourcesReleased { node_id, .. } if node_id == "n2"
        )));
    }

    #[test]
    fn test_finish_rejects_invalid_requests() {
        let scheduler = create_test_scheduler(NO_BACKOFF);
        assert!(scheduler.finish_job("ghost", JobStatus::Completed).is_none());

        scheduler.submit_job(gpu_job("j1", 1));
        scheduler.schedule_once();
        assert!(scheduler.finish_job("j1", JobStatus::Running).is_none());
        assert!(scheduler.finish_job("j1", JobStatus::Pending).is_none());
        assert!(scheduler.placement("j1").is_some());
        assert!(!scheduler.mark_running("ghost"));
    }

    #[test]
    fn test_preempted_job_returns_ahead_of_later_jobs() {
        let cluster = ClusterManager::new("c", vec![node("n1", 1)]).unwrap();
        let scheduler = SchedulerBuilder::new()
            .with_cluster(Arc::new(cluster))
            .build();

        scheduler.submit_job(gpu_job("early", 1));
        scheduler.schedule_once();
        std::thread::sleep(Duration::from_millis(2));
        scheduler.submit_job(gpu_job("late", 1));
        scheduler.mark_running("early");

        let requeued = scheduler.finish_job("early", JobStatus::Preempted).unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.preemption_count, 1);
        assert_eq!(requeued.reason, Some(JobStateReason::Preempted));
        assert_eq!(
            scheduler
                .cluster()
                .total_allocatable_resource()
                .gpu_count(GpuType::A100),
            1
        );

        let report = scheduler.schedule_once();
        assert_eq!(report.placed, 1);
        assert!(scheduler.placement("early").is_some());
        assert!(scheduler.pending_job("late").is_some());
    }

    #[test]
    fn test_release_after_node_deleted() {
        let scheduler = create_test_scheduler(NO_BACKOFF);
        let mut rx = scheduler.subscribe();
        scheduler.submit_job(gpu_job("j1", 1));
        scheduler.schedule_once();

        assert!(scheduler.delete_node("n2"));
        assert!(!scheduler.delete_node("n2"));
        let job = scheduler.finish_job("j1", JobStatus::Completed).unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, SchedulerEvent::NodeRemoved { .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, SchedulerEvent::ResourcesReleased { .. })));
    }

    #[test]
    fn test_add_node_rejects_duplicates() {
        let scheduler = create_test_scheduler(NO_BACKOFF);
        assert!(!scheduler.add_node(node("n1", 4)));
        assert!(scheduler.add_node(node("n3", 4)));
        assert_eq!(scheduler.info().cluster.node_count(), 3);
    }

    #[test]
    fn test_info_serializes() {
        let scheduler = create_test_scheduler(NO_BACKOFF);
        scheduler.submit_job(gpu_job("j1", 1));
        scheduler.submit_job(gpu_job("big", 8));
        scheduler.schedule_once();

        let info = scheduler.info();
        assert_eq!((info.pending, info.deferred, info.placed), (0, 1, 1));
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["cluster"]["kind"], "cluster");
        assert_eq!(json["cluster"]["children"].as_array().unwrap().len(), 2);
    }

    /// Node that resubmits the job it is placing while the allocation is in flight.
    struct ResubmittingNode {
        inner: NodeManager,
        scheduler: Mutex<std::sync::Weak<Scheduler>>,
        resubmitted: Mutex<Option<bool>>,
    }

    impl ResourceManager for ResubmittingNode {
        fn id(&self) -> crate::core::NodeId {
            self.inner.id()
        }
        fn total_resource(&self) -> Resource {
            self.inner.total_resource()
        }
        fn total_allocatable_resource(&self) -> Resource {
            self.inner.total_allocatable_resource()
        }
        fn resources(&self) -> Vec<Resource> {
            self.inner.resources()
        }
        fn allocatable_resources(&self) -> Vec<Resource> {
            self.inner.allocatable_resources()
        }
        fn node_ids(&self) -> Vec<crate::core::NodeId> {
            self.inner.node_ids()
        }
        fn allocatable(&self, demand: &Resource) -> bool {
            self.inner.allocatable(demand)
        }
        fn allocate_resource(&self, demand: &Resource) -> Option<Allocation> {
            let mut resubmitted = lock(&self.resubmitted);
            if resubmitted.is_none() {
                if let Some(scheduler) = lock(&self.scheduler).upgrade() {
                    *resubmitted = Some(scheduler.submit_job(gpu_job("dup", 1)));
                }
            }
            drop(resubmitted);
            self.inner.allocate_resource(demand)
        }
        fn release_resource(&self, grant: &Allocation) -> Option<Resource> {
            self.inner.release_resource(grant)
        }
        fn info(&self) -> crate::core::info::ResourceInfo {
            self.inner.info()
        }
    }

    #[test]
    fn test_resubmit_during_placement_is_rejected() {
        let leaf = Arc::new(ResubmittingNode {
            inner: NodeManager::new(
                Resource::new()
                    .with_gpu(GpuType::A100, 4)
                    .with_cpu_cores(32.0)
                    .with_id("n1"),
            ),
            scheduler: Mutex::new(std::sync::Weak::new()),
            resubmitted: Mutex::new(None),
        });
        let child: Arc<dyn ResourceManager> = leaf.clone();
        let cluster = ClusterManager::new("c", vec![child]).unwrap();
        let scheduler = Arc::new(
            SchedulerBuilder::new()
                .with_cluster(Arc::new(cluster))
                .with_failure_policy(NO_BACKOFF)
                .build(),
        );
        *leaf.scheduler.lock().unwrap() = Arc::downgrade(&scheduler);

        assert!(scheduler.submit_job(gpu_job("dup", 1)));
        assert_eq!(scheduler.schedule_once().placed, 1);
        assert_eq!(*leaf.resubmitted.lock().unwrap(), Some(false));
        assert!(scheduler.schedule_once().is_idle());

        assert_eq!(scheduler.placements().len(), 1);
        assert!(scheduler.pending_jobs().is_empty());
        let a100 = || {
            scheduler
                .cluster()
                .total_allocatable_resource()
                .gpu_count(GpuType::A100)
        };
        assert_eq!(a100(), 3);

        assert!(scheduler.finish_job("dup", JobStatus::Completed).is_some());
        assert_eq!(a100(), 4);
        // Finished ids can be reused.
        assert!(scheduler.submit_job(gpu_job("dup", 1)));
    }

    #[test]
    fn test_id_reusable_after_cancel_and_fail() {
        let scheduler = create_test_scheduler(PlacementFailurePolicy::Fail);
        assert!(scheduler.submit_job(gpu_job("j1", 1)));
        assert!(scheduler.cancel_job("j1"));
        assert!(scheduler.submit_job(gpu_job("j1", 1)));

        assert!(scheduler.submit_job(gpu_job("big", 8)));
        assert_eq!(scheduler.schedule_once().failed, 1);
        assert!(scheduler.submit_job(gpu_job("big", 8)));
        // Placed ids stay taken.
        assert!(!scheduler.submit_job(gpu_job("j1", 1)));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Submit(i64),
            Schedule,
            Finish(usize, bool),
            Cancel(usize),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (1i64..4).prop_map(Op::Submit),
                Just(Op::Schedule),
                (0usize..16, any::<bool>()).prop_map(|(i, preempt)| Op::Finish(i, preempt)),
                (0usize..16).prop_map(Op::Cancel),
            ]
        }

        proptest! {
            /// Property: cluster capacity plus every placed grant always equals the total,
            /// and no job is tracked in two places at once
            #[test]
            fn prop_capacity_is_conserved(ops in prop::collection::vec(op(), 1..60)) {
                let cluster =
                    ClusterManager::new("c", vec![node("n1", 4), node("n2", 2)]).unwrap();
                let scheduler = SchedulerBuilder::new()
                    .with_cluster(Arc::new(cluster))
                    .with_failure_policy(NO_BACKOFF)
                    .build();
                let mut next = 0;

                for op in ops {
                    match op {
                        Op::Submit(gpus) => {
                            let id = format!("j{next}");
                            prop_assert!(scheduler.submit_job(gpu_job(&id, gpus)));
                            next += 1;
                        }
                        Op::Schedule => {
                            scheduler.schedule_once();
                        }
                        Op::Finish(i, preempt) => {
                            let status = if preempt { JobStatus::Preempted } else { JobStatus::Completed };
                            scheduler.finish_job(&format!("j{i}"), status);
                        }
                        Op::Cancel(i) => {
                            scheduler.cancel_job(&format!("j{i}"));
                        }
                    }

                    let held: Resource = scheduler
                        .placements()
                        .iter()
                        .map(|p| &p.allocation.granted)
                        .sum();
                    let accounted = &scheduler.cluster().total_allocatable_resource() + &held;
                    prop_assert_eq!(accounted.gpu_count(GpuType::A100), 6);

                    for p in scheduler.placements() {
                        prop_assert!(scheduler.pending_job(&p.job.id).is_none());
                    }
                }
            }
        }
    }
}
