use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::pool::AgentPool;
use crate::error::{DispatchError, Result};
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::queue::PriorityQueue;
use crate::scheduler::store::{JobStore, TransitionOpts};
use crate::session::manager::SessionManager;
use crate::transport::AgentTransport;

/// Terminal job handed to the webhook notifier.
#[derive(Debug, Clone)]
pub struct WebhookNotice {
    pub url: String,
    pub job: Job,
}

/// Drains the queue onto idle agents and owns the job completion paths:
/// status callbacks, retries with priority decay, cancellation and agent
/// recycling.
///
/// Locks are held across in-memory updates only; every transport and
/// provisioner call happens with all locks released, and each commit
/// re-checks the world it is writing into.
pub struct Scheduler {
    tick: Duration,
    jobs: Arc<RwLock<JobStore>>,
    queue: Arc<RwLock<PriorityQueue>>,
    pool: Arc<RwLock<AgentPool>>,
    sessions: Arc<SessionManager>,
    transport: Arc<dyn AgentTransport>,
    wake: Notify,
    webhook_tx: Option<mpsc::Sender<WebhookNotice>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tick: Duration,
        jobs: Arc<RwLock<JobStore>>,
        queue: Arc<RwLock<PriorityQueue>>,
        pool: Arc<RwLock<AgentPool>>,
        sessions: Arc<SessionManager>,
        transport: Arc<dyn AgentTransport>,
        webhook_tx: Option<mpsc::Sender<WebhookNotice>>,
    ) -> Self {
        Self {
            tick,
            jobs,
            queue,
            pool,
            sessions,
            transport,
            wake: Notify::new(),
            webhook_tx,
        }
    }

    /// Move a Pending job into the queue and wake the dispatch loop.
    pub async fn enqueue(&self, job_id: Uuid) -> Result<()> {
        let priority = {
            let mut jobs = self.jobs.write().await;
            jobs.transition(&job_id, JobStatus::Queued, TransitionOpts::default())?;
            jobs.get(&job_id)
                .map(|j| j.priority)
                .ok_or(DispatchError::JobNotFound(job_id))?
        };
        self.queue.write().await.push(job_id, priority);
        self.wake.notify_one();
        tracing::debug!(job_id = %job_id, %priority, "Job enqueued");
        Ok(())
    }

    /// Dispatch loop: a fixed tick plus an event-driven wake on enqueue.
    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Scheduler stopped");
                    break;
                }
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }
            self.dispatch_tick().await;
        }
    }

    /// One placement pass. Pops at most the queue length observed at tick
    /// start; jobs no agent fits go back with their original sequence after
    /// the pass so the loop cannot spin on them.
    pub async fn dispatch_tick(&self) {
        let budget = self.queue.read().await.len();
        let mut passed_over = Vec::new();

        for _ in 0..budget {
            if self.pool.read().await.idle_count() == 0 {
                break;
            }
            let Some((job_id, priority, seq)) = self.queue.write().await.pop() else {
                break;
            };

            let Some(job) = self.jobs.read().await.get(&job_id).cloned() else {
                continue;
            };
            if job.status != JobStatus::Queued {
                // Cancelled (or otherwise moved on) while waiting; the
                // entry is stale.
                continue;
            }

            let Some(agent) = self.pool.write().await.pick_and_claim(&job) else {
                passed_over.push((job_id, priority, seq));
                continue;
            };

            let assigned = self.jobs.write().await.transition(
                &job_id,
                JobStatus::Assigned,
                TransitionOpts::with_agent(agent.id),
            );
            if let Err(e) = assigned {
                tracing::warn!(job_id = %job_id, error = %e, "Assignment commit lost, undoing claim");
                let _ = self.pool.write().await.unclaim(&agent.id, None);
                continue;
            }

            let job = self
                .jobs
                .read()
                .await
                .get(&job_id)
                .cloned()
                .unwrap_or(job);

            // Transport I/O with no locks held.
            match self.transport.send_job(&agent, &job).await {
                Ok(()) => {
                    let running = self.jobs.write().await.transition(
                        &job_id,
                        JobStatus::Running,
                        TransitionOpts::default(),
                    );
                    match running {
                        Ok(()) => {
                            if let Err(e) = self.sessions.assign(&agent.session_id, agent.id).await
                            {
                                tracing::warn!(
                                    session_id = %agent.session_id,
                                    error = %e,
                                    "Session assign failed"
                                );
                            }
                            tracing::info!(job_id = %job_id, agent_id = %agent.id, "Job dispatched");
                        }
                        Err(_) => {
                            // Cancelled between send and commit; the cancel
                            // path already released the agent.
                            let _ = self.transport.cancel_job(&agent, job_id).await;
                        }
                    }
                }
                Err(e) => {
                    let requeued = self.jobs.write().await.transition(
                        &job_id,
                        JobStatus::Queued,
                        TransitionOpts::default(),
                    );
                    // A transport-level failure (5xx, timeout) parks the
                    // agent in Error; a rejection or open circuit leaves it
                    // Idle for other jobs.
                    let hard = matches!(
                        e,
                        DispatchError::Transport(_) | DispatchError::Http(_)
                    );
                    let reason = hard.then(|| e.to_string());
                    let _ = self.pool.write().await.unclaim(&agent.id, reason);
                    if requeued.is_ok() {
                        self.queue.write().await.push_with_seq(job_id, priority, seq);
                    }
                    tracing::warn!(
                        job_id = %job_id,
                        agent_id = %agent.id,
                        error = %e,
                        "Send failed, job requeued"
                    );
                }
            }
        }

        if !passed_over.is_empty() {
            let mut queue = self.queue.write().await;
            for (job_id, priority, seq) in passed_over {
                queue.push_with_seq(job_id, priority, seq);
            }
        }
    }

    /// Inbound completion notification from an agent.
    pub async fn handle_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(DispatchError::InvalidInput(format!(
                "status callback must carry a terminal status, got {status}"
            )));
        }
        self.finalize(job_id, status, result, error, true).await
    }

    /// Apply a terminal transition and run the completion machinery:
    /// agent/session release, deferred recycle, retry with priority decay,
    /// webhook notice.
    ///
    /// `release_agent` is false when the agent is already gone (offline
    /// sweep), where releasing would resurrect it.
    pub async fn finalize(
        &self,
        job_id: Uuid,
        terminal: JobStatus,
        result: Option<String>,
        error: Option<String>,
        release_agent: bool,
    ) -> Result<()> {
        let (agent_id, duration, should_retry, finished) = {
            let mut jobs = self.jobs.write().await;
            let job = jobs
                .get(&job_id)
                .ok_or(DispatchError::JobNotFound(job_id))?;
            let agent_id = job.assigned_agent_id;
            let started_at = job.started_at;
            jobs.transition(
                &job_id,
                terminal,
                TransitionOpts {
                    result,
                    error,
                    agent_id: None,
                },
            )?;
            let job = jobs
                .get(&job_id)
                .ok_or(DispatchError::JobNotFound(job_id))?;
            let should_retry = terminal == JobStatus::Failed && job.retry_budget_left();
            let duration = started_at
                .and_then(|s| (Utc::now() - s).to_std().ok());
            (agent_id, duration, should_retry, job.clone())
        };
        tracing::info!(job_id = %job_id, status = %terminal, "Job finished");

        if release_agent {
            if let Some(agent_id) = agent_id {
                let verdict = match terminal {
                    JobStatus::Success => Some(true),
                    JobStatus::Failed | JobStatus::Timeout => Some(false),
                    _ => None,
                };
                self.release_agent(agent_id, verdict, duration).await;
            }
        }

        if should_retry {
            self.requeue_for_retry(job_id).await?;
        } else if let (Some(tx), Some(url)) = (&self.webhook_tx, finished.webhook_url.clone()) {
            let notice = WebhookNotice { url, job: finished };
            if tx.try_send(notice).is_err() {
                tracing::warn!(job_id = %job_id, "Webhook queue full, notice dropped");
            }
        }
        Ok(())
    }

    /// Release an agent after a terminal transition and run a deferred
    /// recycle when the execution threshold was crossed.
    async fn release_agent(
        &self,
        agent_id: Uuid,
        verdict: Option<bool>,
        duration: Option<Duration>,
    ) {
        let outcome = self.pool.write().await.release(&agent_id, verdict, duration);
        match outcome {
            Ok(outcome) => {
                if let Err(e) = self.sessions.release(&outcome.session_id).await {
                    tracing::warn!(session_id = %outcome.session_id, error = %e, "Session release failed");
                }
                if outcome.recycle_due {
                    if let Err(e) = self.recycle_agent(agent_id).await {
                        tracing::error!(agent_id = %agent_id, error = %e, "Deferred recycle failed");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, error = %e, "Agent release failed");
            }
        }
    }

    /// Failed with retry budget left: Retry → decay priority → Queued.
    async fn requeue_for_retry(&self, job_id: Uuid) -> Result<()> {
        let (priority, retry_count) = {
            let mut jobs = self.jobs.write().await;
            jobs.transition(&job_id, JobStatus::Retry, TransitionOpts::default())?;
            let demoted = jobs
                .get(&job_id)
                .ok_or(DispatchError::JobNotFound(job_id))?
                .priority
                .demoted();
            jobs.set_priority(&job_id, demoted)?;
            jobs.transition(&job_id, JobStatus::Queued, TransitionOpts::default())?;
            let job = jobs
                .get(&job_id)
                .ok_or(DispatchError::JobNotFound(job_id))?;
            (demoted, job.retry_count)
        };
        self.queue.write().await.push(job_id, priority);
        self.wake.notify_one();
        tracing::info!(
            job_id = %job_id,
            retry_count,
            %priority,
            "Job requeued for retry"
        );
        Ok(())
    }

    /// Recycle an agent's session: Recycling → provisioner rebuild → Idle,
    /// or Error with the cause recorded.
    pub async fn recycle_agent(&self, agent_id: Uuid) -> Result<()> {
        let session_id = {
            let mut pool = self.pool.write().await;
            pool.begin_recycle(&agent_id)?;
            pool.get(&agent_id)
                .map(|a| a.session_id)
                .ok_or(DispatchError::AgentNotFound(agent_id))?
        };
        let outcome = self.sessions.recycle(&session_id).await;
        self.pool.write().await.finish_recycle(&agent_id, outcome)
    }

    /// Client cancellation. Synchronous in effect: the job flips to
    /// Cancelled immediately; the downstream transport cancel is
    /// best-effort. Returns false when the job was already terminal.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let inflight_agent = {
            let mut jobs = self.jobs.write().await;
            let job = jobs
                .get(&job_id)
                .ok_or(DispatchError::JobNotFound(job_id))?;
            if job.is_terminal() {
                return Ok(false);
            }
            let agent_id = job.assigned_agent_id;
            jobs.transition(&job_id, JobStatus::Cancelled, TransitionOpts::default())?;
            agent_id
        };
        tracing::info!(job_id = %job_id, "Job cancelled");

        if let Some(agent_id) = inflight_agent {
            self.release_agent(agent_id, None, None).await;
            let agent = self.pool.read().await.get(&agent_id).cloned();
            if let Some(agent) = agent {
                if let Err(e) = self.transport.cancel_job(&agent, job_id).await {
                    tracing::debug!(job_id = %job_id, error = %e, "Downstream cancel failed");
                }
            }
        }
        Ok(true)
    }

    /// An agent vanished under its job. An Assigned job's placement is
    /// simply void; a Running job fails (and retries on budget) with the
    /// loss recorded.
    pub async fn handle_agent_loss(&self, job_id: Uuid, reason: &str) -> Result<()> {
        let status = self
            .jobs
            .read()
            .await
            .get(&job_id)
            .map(|j| j.status)
            .ok_or(DispatchError::JobNotFound(job_id))?;
        match status {
            JobStatus::Assigned => {
                let priority = {
                    let mut jobs = self.jobs.write().await;
                    jobs.transition(&job_id, JobStatus::Queued, TransitionOpts::default())?;
                    jobs.get(&job_id)
                        .map(|j| j.priority)
                        .ok_or(DispatchError::JobNotFound(job_id))?
                };
                self.queue.write().await.push(job_id, priority);
                self.wake.notify_one();
                Ok(())
            }
            JobStatus::Running => {
                self.finalize(
                    job_id,
                    JobStatus::Failed,
                    None,
                    Some(reason.to_string()),
                    false,
                )
                .await
            }
            other => {
                tracing::debug!(job_id = %job_id, status = %other, "Agent loss with no live job");
                Ok(())
            }
        }
    }

    /// Nudge the dispatch loop.
    pub fn nudge(&self) {
        self.wake.notify_one();
    }
}
