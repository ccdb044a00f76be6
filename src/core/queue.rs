//! Pending job queue.
//!
//! Two indices sit behind one mutex: a binary heap ordered by [`QueueKey`] and a map
//! from job id to the live job. Removal only touches the map. The heap entry left
//! behind is a ghost, recognised by its stale `seq`, and is dropped the next time it
//! reaches the top of the heap or when the heap is compacted.

use crate::core::job::{Job, JobStatus};
use crate::core::JobId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

/// Ghosts tolerated before compaction is considered at all.
const COMPACT_FLOOR: usize = 64;

/// Ordering key, smallest first: eligibility, then submission time, then arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueKey {
    pub eligibility: u32,
    pub submitted_at: SystemTime,
    /// Queue-wide insertion counter. Also the generation of the heap entry.
    pub seq: u64,
}

#[derive(Debug)]
struct Queued {
    key: QueueKey,
    job: Job,
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Reverse<(QueueKey, JobId)>>,
    jobs: HashMap<JobId, Queued>,
    next_seq: u64,
}

impl Inner {
    fn is_live(&self, key: &QueueKey, id: &str) -> bool {
        self.jobs.get(id).is_some_and(|q| q.key.seq == key.seq)
    }

    /// Drop ghosts sitting on top of the heap.
    fn skip_ghosts(&mut self) {
        while let Some(Reverse((key, id))) = self.heap.peek() {
            if self.is_live(key, id) {
                break;
            }
            self.heap.pop();
        }
    }

    fn ghost_count(&self) -> usize {
        self.heap.len().saturating_sub(self.jobs.len())
    }

    fn maybe_compact(&mut self) {
        let ghosts = self.ghost_count();
        if ghosts <= COMPACT_FLOOR || ghosts <= self.jobs.len() {
            return;
        }
        self.heap = self
            .jobs
            .iter()
            .map(|(id, q)| Reverse((q.key, id.clone())))
            .collect();
        tracing::debug!("Compacted job queue, dropped {} ghost entries", ghosts);
    }
}

#[derive(Debug, Default)]
pub struct JobQueue {
    inner: Mutex<Inner>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a job as Pending.
    ///
    /// A job already queued under the same id is replaced and returned. A job whose status
    /// cannot move to Pending is handed back untouched as the error.
    pub fn enqueue(&self, mut job: Job) -> Result<Option<Job>, Job> {
        if !job.status.can_transition_to(JobStatus::Pending) {
            return Err(job);
        }
        job.set_status(JobStatus::Pending);

        let mut inner = self.lock();
        let key = QueueKey {
            eligibility: job.eligibility,
            submitted_at: job.submitted_at,
            seq: inner.next_seq,
        };
        inner.next_seq += 1;

        let id = job.id.clone();
        inner.heap.push(Reverse((key, id.clone())));
        let replaced = inner.jobs.insert(id, Queued { key, job }).map(|q| q.job);
        if replaced.is_some() {
            inner.maybe_compact();
        }
        Ok(replaced)
    }

    /// Remove and return the job with the smallest key.
    pub fn dequeue(&self) -> Option<Job> {
        let mut inner = self.lock();
        inner.skip_ghosts();
        let Reverse((_, id)) = inner.heap.pop()?;
        inner.jobs.remove(&id).map(|q| q.job)
    }

    /// The job `dequeue` would return, left in place.
    pub fn peek(&self) -> Option<Job> {
        let mut inner = self.lock();
        inner.skip_ghosts();
        let Reverse((_, id)) = inner.heap.peek()?;
        inner.jobs.get(id).map(|q| q.job.clone())
    }

    /// Detach a job from the queue. Its heap entry becomes a ghost.
    pub fn remove(&self, id: &str) -> Option<Job> {
        let mut inner = self.lock();
        let removed = inner.jobs.remove(id)?;
        inner.maybe_compact();
        Some(removed.job)
    }

    /// Same as [`remove`](Self::remove), reporting only whether anything was removed.
    pub fn cancel(&self, id: &str) -> bool {
        self.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.lock().jobs.get(id).map(|q| q.job.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().jobs.contains_key(id)
    }

    pub fn key_of(&self, id: &str) -> Option<QueueKey> {
        self.lock().jobs.get(id).map(|q| q.key)
    }

    /// Live jobs in the order `dequeue` would return them.
    pub fn list_all(&self) -> Vec<Job> {
        let inner = self.lock();
        let mut queued: Vec<&Queued> = inner.jobs.values().collect();
        queued.sort_by_key(|q| q.key);
        queued.into_iter().map(|q| q.job.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    /// Heap entries whose job has been removed or replaced.
    pub fn ghost_count(&self) -> usize {
        self.lock().ghost_count()
    }
}
