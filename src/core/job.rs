use crate::core::resource::Resource;
use crate::core::{random_job_id, JobId};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use strum::{Display, EnumIter};

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Hash, Clone, Copy, Display, EnumIter)]
pub enum JobStatus {
    #[strum(to_string = "Submitted")]
    Submitted,
    #[strum(to_string = "Pending")]
    Pending,
    #[strum(to_string = "Scheduled")]
    Scheduled,
    #[strum(to_string = "Running")]
    Running,
    #[strum(to_string = "Completed")]
    Completed,
    #[strum(to_string = "Failed")]
    Failed,
    #[strum(to_string = "Preempted")]
    Preempted,
    #[strum(to_string = "Terminated")]
    Terminated,
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Submitted, Pending | Terminated)
                | (Pending, Pending | Scheduled | Failed | Terminated)
                | (Scheduled, Running | Completed | Failed | Preempted | Terminated)
                | (Running, Completed | Failed | Preempted | Terminated)
                | (Preempted, Pending | Terminated)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Terminated
        )
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Display)]
pub enum JobStateReason {
    #[strum(to_string = "Waiting for resources")]
    WaitingForResources,
    #[strum(to_string = "No capacity")]
    NoCapacity,
    #[strum(to_string = "Cancelled by user")]
    CancelledByUser,
    #[strum(to_string = "Preempted")]
    Preempted,
    #[strum(to_string = "Duplicate id")]
    DuplicateId,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub name: Option<CompactString>,
    pub user: CompactString,
    pub team: Option<CompactString>,
    /// Demand placed on a single capacity pool
    pub resource: Resource,
    pub replicas: u32,

    /// Lower is served first. Preemptible jobs use 0, everything else 1.
    pub eligibility: u32,
    pub submitted_at: SystemTime,

    pub status: JobStatus,
    pub status_changed_at: SystemTime,
    pub reason: Option<JobStateReason>,
    pub preemption_count: u32,
    pub placement_attempts: u32,
}

impl Job {
    pub fn builder() -> JobBuilder {
        JobBuilder::new()
    }

    /// Move to `next` if the lifecycle allows it, stamping `status_changed_at`.
    pub fn set_status(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                "Job {} cannot move from {} to {}",
                self.id,
                self.status,
                next
            );
            return false;
        }
        self.status = next;
        self.status_changed_at = SystemTime::now();
        true
    }

    pub fn is_preemptible(&self) -> bool {
        self.eligibility == 0
    }
}

#[derive(Default)]
pub struct JobBuilder {
    id: Option<JobId>,
    name: Option<CompactString>,
    user: CompactString,
    team: Option<CompactString>,
    resource: Resource,
    replicas: u32,
    preemptible: bool,
    submitted_at: Option<SystemTime>,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self {
            replicas: 1,
            ..Default::default()
        }
    }

    pub fn id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<CompactString>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn user(mut self, user: impl Into<CompactString>) -> Self {
        self.user = user.into();
        self
    }

    pub fn team(mut self, team: impl Into<CompactString>) -> Self {
        self.team = Some(team.into());
        self
    }

    pub fn resource(mut self, resource: Resource) -> Self {
        self.resource = resource;
        self
    }

    pub fn replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn preemptible(mut self, preemptible: bool) -> Self {
        self.preemptible = preemptible;
        self
    }

    /// Fix the submission time up front. The scheduler stamps it otherwise.
    pub fn submitted_at(mut self, at: SystemTime) -> Self {
        self.submitted_at = Some(at);
        self
    }

    pub fn build(self) -> Job {
        let now = SystemTime::now();
        Job {
            id: self.id.unwrap_or_else(random_job_id),
            name: self.name,
            user: self.user,
            team: self.team,
            resource: self.resource,
            replicas: self.replicas,
            eligibility: if self.preemptible { 0 } else { 1 },
            submitted_at: self.submitted_at.unwrap_or(now),
            status: JobStatus::Submitted,
            status_changed_at: now,
            reason: None,
            preemption_count: 0,
            placement_attempts: 0,
        }
    }
}
