use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::scheduler::job::{Job, JobPriority, JobStatus};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Side data applied together with a status transition.
#[derive(Debug, Default, Clone)]
pub struct TransitionOpts {
    pub result: Option<String>,
    pub error: Option<String>,
    pub agent_id: Option<Uuid>,
}

impl TransitionOpts {
    pub fn with_agent(agent_id: Uuid) -> Self {
        Self {
            agent_id: Some(agent_id),
            ..Default::default()
        }
    }

    pub fn with_result(result: impl Into<String>) -> Self {
        Self {
            result: Some(result.into()),
            ..Default::default()
        }
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Registry of all jobs, serialized behind a single lock by the owner.
///
/// `transition` is the only mutation path for job status and enforces the
/// state machine; illegal transitions are rejected without mutating the job.
#[derive(Debug)]
pub struct JobStore {
    jobs: HashMap<Uuid, Job>,
    max_jobs: usize,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            max_jobs,
        }
    }

    /// Add a new job. Returns false if the store is at capacity.
    pub fn put(&mut self, job: Job) -> bool {
        if self.jobs.len() >= self.max_jobs {
            return false;
        }
        self.jobs.insert(job.id, job);
        true
    }

    pub fn get(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn by_status(&self, status: JobStatus) -> Vec<&Job> {
        self.jobs.values().filter(|j| j.status == status).collect()
    }

    /// All jobs ordered by creation time, newest first.
    pub fn recent_first(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }

    /// Overwrite a job's priority. Used by the retry path for decay.
    pub fn set_priority(&mut self, id: &Uuid, priority: JobPriority) -> Result<()> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or(DispatchError::JobNotFound(*id))?;
        job.priority = priority;
        Ok(())
    }

    /// Apply a status transition, enforcing the job state machine.
    ///
    /// Timestamps are stamped as a side effect: `queued_at` on Queued,
    /// `assigned_at` on Assigned, `started_at` on Running, `completed_at` on
    /// any terminal status. A terminal transition always leaves a result or
    /// an error message set. The Retry transition increments the retry
    /// counter and clears the per-attempt fields.
    pub fn transition(&mut self, id: &Uuid, to: JobStatus, opts: TransitionOpts) -> Result<()> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or(DispatchError::JobNotFound(*id))?;
        let from = job.status;

        if !Self::allowed(job, to) {
            return Err(DispatchError::IllegalTransition {
                job_id: *id,
                from,
                to,
            });
        }

        let now = Utc::now();
        match to {
            JobStatus::Queued => {
                if job.queued_at.is_none() {
                    job.queued_at = Some(now);
                }
                // A send failure bounces Assigned back to Queued; the
                // placement is void.
                job.assigned_agent_id = None;
                job.assigned_at = None;
            }
            JobStatus::Assigned => {
                job.assigned_agent_id = opts.agent_id;
                job.assigned_at = Some(now);
            }
            JobStatus::Running => {
                job.started_at = Some(now);
            }
            JobStatus::Retry => {
                job.retry_count += 1;
                job.assigned_agent_id = None;
                job.assigned_at = None;
                job.started_at = None;
                job.completed_at = None;
                job.result = None;
                job.error_message = None;
            }
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout => {
                job.completed_at = Some(now);
                job.assigned_agent_id = None;
                if let Some(result) = opts.result {
                    job.result = Some(result);
                }
                if let Some(error) = opts.error {
                    job.error_message = Some(error);
                }
                // Terminal invariant: a result or an error is always set.
                if job.result.is_none() && job.error_message.is_none() {
                    match to {
                        JobStatus::Success => job.result = Some("completed".to_string()),
                        JobStatus::Failed => job.error_message = Some("job failed".to_string()),
                        JobStatus::Cancelled => {
                            job.error_message = Some("cancelled by client".to_string())
                        }
                        JobStatus::Timeout => job.error_message = Some("job timed out".to_string()),
                        _ => unreachable!(),
                    }
                }
            }
            JobStatus::Pending => unreachable!("no transition enters Pending"),
        }

        job.status = to;
        tracing::debug!(job_id = %id, %from, %to, "Job transitioned");
        Ok(())
    }

    fn allowed(job: &Job, to: JobStatus) -> bool {
        use JobStatus::*;
        match (job.status, to) {
            (Pending, Queued) => true,
            (Queued, Assigned) => true,
            (Assigned, Running) => true,
            // Send failure voids the placement.
            (Assigned, Queued) => true,
            (Running, Success | Failed | Timeout) => true,
            // Client cancel applies to any non-terminal state.
            (from, Cancelled) if !from.is_terminal() => true,
            // The one exception to terminal finality, guarded by the budget.
            (Failed, Retry) => job.retry_budget_left(),
            (Retry, Queued) => true,
            _ => false,
        }
    }

    /// Retain at most `max` terminal jobs, newest `completed_at` first.
    /// Returns the number of jobs dropped.
    pub fn prune_history(&mut self, max: usize) -> usize {
        let mut terminal: Vec<(Uuid, chrono::DateTime<Utc>)> = self
            .jobs
            .values()
            .filter(|j| j.is_terminal())
            .map(|j| (j.id, j.completed_at.unwrap_or(j.created_at)))
            .collect();
        if terminal.len() <= max {
            return 0;
        }
        terminal.sort_by(|a, b| b.1.cmp(&a.1));
        let doomed: Vec<Uuid> = terminal.split_off(max).into_iter().map(|(id, _)| id).collect();
        for id in &doomed {
            self.jobs.remove(id);
        }
        doomed.len()
    }
}
