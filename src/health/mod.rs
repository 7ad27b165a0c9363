//! Background health sweeps and the supervisor that owns every spawned
//! loop's handle.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::pool::AgentPool;
use crate::agent::AgentStatus;
use crate::config::OrchestratorConfig;
use crate::scheduler::job::JobStatus;
use crate::scheduler::store::JobStore;
use crate::scheduler::Scheduler;
use crate::session::manager::SessionManager;
use crate::transport::AgentTransport;

/// Owns the handles of all spawned background loops. Shutdown cancels the
/// shared token and awaits every handle, so no task outlives the process
/// teardown.
pub struct TaskSupervisor {
    token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl TaskSupervisor {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            handles: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(task = name, "Supervised task started");
        self.handles.push((name, tokio::spawn(future)));
    }

    /// Cancel the token and drain every supervised task.
    pub async fn shutdown(self) {
        self.token.cancel();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(task = name, error = %e, "Supervised task ended abnormally");
            }
        }
        tracing::info!("All supervised tasks drained");
    }
}

/// Periodic sweeps over agents, sessions and jobs: offline detection, job
/// timeouts, session recycling, history cleanup and orphan reaping.
///
/// Every sweep logs its failures and carries on; one sweep's errors never
/// abort another.
pub struct HealthMonitor {
    config: OrchestratorConfig,
    jobs: Arc<RwLock<JobStore>>,
    pool: Arc<RwLock<AgentPool>>,
    sessions: Arc<SessionManager>,
    scheduler: Arc<Scheduler>,
    transport: Arc<dyn AgentTransport>,
}

impl HealthMonitor {
    pub fn new(
        config: OrchestratorConfig,
        jobs: Arc<RwLock<JobStore>>,
        pool: Arc<RwLock<AgentPool>>,
        sessions: Arc<SessionManager>,
        scheduler: Arc<Scheduler>,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        Self {
            config,
            jobs,
            pool,
            sessions,
            scheduler,
            transport,
        }
    }

    /// Spawn one supervised task per sweep cadence. The first interval tick
    /// fires immediately and is skipped so a sweep never races startup.
    pub fn spawn_all(self: Arc<Self>, supervisor: &mut TaskSupervisor) {
        let monitor = self.clone();
        let token = supervisor.token();
        supervisor.spawn("agent-sweep", async move {
            let mut interval = tokio::time::interval(monitor.config.health_sweep_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                monitor.sweep_agents().await;
            }
        });

        let monitor = self.clone();
        let token = supervisor.token();
        supervisor.spawn("session-sweep", async move {
            let mut interval = tokio::time::interval(monitor.config.health_sweep_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                monitor.sweep_sessions().await;
            }
        });

        let monitor = self.clone();
        let token = supervisor.token();
        supervisor.spawn("job-sweep", async move {
            let mut interval = tokio::time::interval(monitor.config.health_sweep_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                monitor.sweep_jobs().await;
            }
        });

        let monitor = self;
        let token = supervisor.token();
        supervisor.spawn("cleanup-sweep", async move {
            let mut interval = tokio::time::interval(monitor.config.cleanup_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                monitor.sweep_cleanup().await;
            }
        });
    }

    /// Offline detection: a stale heartbeat alone takes the agent Offline
    /// and fails its in-flight job. A status poll runs afterwards for
    /// diagnostics only; its outcome never gates the Offline decision.
    pub async fn sweep_agents(&self) {
        let stale = self
            .pool
            .read()
            .await
            .stale_agents(self.config.heartbeat_timeout);
        for agent_id in stale {
            let Some(agent) = self.pool.read().await.get(&agent_id).cloned() else {
                continue;
            };

            let lost_job = {
                let mut pool = self.pool.write().await;
                match pool.mark_offline(&agent_id, "heartbeat timeout") {
                    Ok(job) => job,
                    Err(e) => {
                        tracing::warn!(agent_id = %agent_id, error = %e, "Offline mark failed");
                        continue;
                    }
                }
            };
            if let Some(job_id) = lost_job {
                if let Err(e) = self
                    .scheduler
                    .handle_agent_loss(job_id, "agent went offline")
                    .await
                {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to recover lost job");
                }
            }

            // Diagnostic poll: records whether the process is still up even
            // though its heartbeats stopped.
            match self.transport.query_status(&agent).await {
                Ok(remote) => {
                    tracing::warn!(
                        agent_id = %agent_id,
                        remote_status = %remote.status,
                        "Offline agent still answers status polls"
                    );
                }
                Err(poll_err) => {
                    tracing::warn!(agent_id = %agent_id, error = %poll_err, "Offline agent unreachable");
                }
            }
        }
    }

    /// Session probing and recycling: every live session gets a provisioner
    /// health check; unhealthy sessions, inactive sessions and sessions past
    /// their job budget are rebuilt, through the bound agent when one
    /// exists.
    pub async fn sweep_sessions(&self) {
        let live: Vec<Uuid> = self
            .sessions
            .snapshot()
            .await
            .into_iter()
            .filter(|s| s.is_live())
            .map(|s| s.id)
            .collect();
        let mut unhealthy = Vec::new();
        for session_id in live {
            match self.sessions.check_health(&session_id).await {
                Ok(true) => {}
                Ok(false) => unhealthy.push(session_id),
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Session health check errored");
                }
            }
        }

        let mut candidates = self
            .sessions
            .recycle_candidates(
                self.config.session_inactivity_timeout,
                self.config.session_max_jobs,
            )
            .await;
        for session_id in unhealthy {
            if !candidates.contains(&session_id) {
                candidates.push(session_id);
            }
        }
        for session_id in candidates {
            let bound = self.pool.read().await.agent_for_session(&session_id).cloned();
            match bound {
                Some(agent) if agent.status == AgentStatus::Busy => {
                    // A job is in flight; the next sweep gets it.
                    continue;
                }
                Some(agent) => {
                    if let Err(e) = self.scheduler.recycle_agent(agent.id).await {
                        tracing::error!(agent_id = %agent.id, error = %e, "Session-driven recycle failed");
                    }
                }
                None => {
                    if let Err(e) = self.sessions.recycle(&session_id).await {
                        tracing::error!(session_id = %session_id, error = %e, "Unbound session recycle failed");
                    }
                }
            }
        }
    }

    /// Job timeouts: Running jobs past the bound go Timeout, their agent is
    /// released and the remote is told to stop, best-effort.
    pub async fn sweep_jobs(&self) {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.config.job_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let timed_out: Vec<(Uuid, Option<Uuid>)> = {
            let jobs = self.jobs.read().await;
            jobs.by_status(JobStatus::Running)
                .into_iter()
                .filter(|j| j.started_at.map(|s| s < cutoff).unwrap_or(false))
                .map(|j| (j.id, j.assigned_agent_id))
                .collect()
        };
        for (job_id, agent_id) in timed_out {
            let agent = match agent_id {
                Some(id) => self.pool.read().await.get(&id).cloned(),
                None => None,
            };
            let result = self
                .scheduler
                .finalize(
                    job_id,
                    JobStatus::Timeout,
                    None,
                    Some(format!(
                        "job exceeded {} seconds",
                        self.config.job_timeout.as_secs()
                    )),
                    true,
                )
                .await;
            if let Err(e) = result {
                tracing::error!(job_id = %job_id, error = %e, "Timeout transition failed");
                continue;
            }
            tracing::warn!(job_id = %job_id, "Job timed out");
            if let Some(agent) = agent {
                if let Err(e) = self.transport.cancel_job(&agent, job_id).await {
                    tracing::debug!(job_id = %job_id, error = %e, "Downstream cancel failed");
                }
            }
        }
    }

    /// History pruning and orphan-session reaping.
    pub async fn sweep_cleanup(&self) {
        let dropped = self
            .jobs
            .write()
            .await
            .prune_history(self.config.max_completed_history);
        if dropped > 0 {
            tracing::info!(dropped, "Pruned terminal job history");
        }

        let bound = self.pool.read().await.bound_session_ids();
        let orphans = self.sessions.orphans(&bound).await;
        for session_id in orphans {
            tracing::warn!(session_id = %session_id, "Terminating orphan session");
            if let Err(e) = self.sessions.terminate(&session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "Orphan terminate failed");
            }
        }
    }
}
