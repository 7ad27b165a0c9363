use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::agent::agent::{Agent, AgentStatus};
use crate::error::{DispatchError, Result};
use crate::scheduler::job::Job;

/// Outcome of releasing an agent after a terminal job transition.
#[derive(Debug, Clone, Copy)]
pub struct ReleaseOutcome {
    pub session_id: Uuid,
    /// The agent crossed its execution threshold and should be recycled.
    pub recycle_due: bool,
}

/// Registry of agents with capability-based placement.
///
/// All mutations are serialized behind the owner's lock; reads hand out
/// clones so scheduler decisions never interleave with lifecycle
/// transitions.
#[derive(Debug)]
pub struct AgentPool {
    agents: HashMap<Uuid, Agent>,
    recycle_after_jobs: u32,
}

impl AgentPool {
    pub fn new(recycle_after_jobs: u32) -> Self {
        Self {
            agents: HashMap::new(),
            recycle_after_jobs,
        }
    }

    pub fn register(&mut self, agent: Agent) {
        tracing::info!(agent_id = %agent.id, name = %agent.name, "Agent registered");
        self.agents.insert(agent.id, agent);
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Agent> {
        let removed = self.agents.remove(id);
        if removed.is_some() {
            tracing::info!(agent_id = %id, "Agent removed");
        }
        removed
    }

    pub fn get(&self, id: &Uuid) -> Option<&Agent> {
        self.agents.get(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.agents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Snapshot of every agent, cloned.
    pub fn snapshot(&self) -> Vec<Agent> {
        self.agents.values().cloned().collect()
    }

    pub fn idle_count(&self) -> usize {
        self.agents
            .values()
            .filter(|a| a.status == AgentStatus::Idle)
            .count()
    }

    pub fn count_by_status(&self, status: AgentStatus) -> usize {
        self.agents.values().filter(|a| a.status == status).count()
    }

    /// Session ids currently held by any agent. Used by the orphan sweep.
    pub fn bound_session_ids(&self) -> HashSet<Uuid> {
        self.agents.values().map(|a| a.session_id).collect()
    }

    /// Pick the best-fitting idle agent for a job and claim it in the same
    /// critical section: the winner leaves Busy with the job id recorded, so
    /// a double-send cannot be produced.
    ///
    /// Ranking: success rate descending, jobs executed ascending, average
    /// duration ascending, then agent id for determinism.
    pub fn pick_and_claim(&mut self, job: &Job) -> Option<Agent> {
        let mut candidates: Vec<&Agent> = self
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Idle)
            .filter(|a| a.supports(&job.application_path))
            .filter(|a| a.current_job_id.is_none())
            .collect();
        if candidates.is_empty() {
            return None;
        }

        candidates.sort_by(|a, b| {
            b.metrics
                .success_rate()
                .partial_cmp(&a.metrics.success_rate())
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.jobs_executed.cmp(&b.jobs_executed))
                .then_with(|| {
                    a.metrics
                        .average_duration_ms
                        .partial_cmp(&b.metrics.average_duration_ms)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.id.cmp(&b.id))
        });

        let winner_id = candidates[0].id;
        let agent = self.agents.get_mut(&winner_id)?;
        agent.status = AgentStatus::Busy;
        agent.current_job_id = Some(job.id);
        tracing::debug!(agent_id = %winner_id, job_id = %job.id, "Agent claimed");
        Some(agent.clone())
    }

    /// Undo a claim after a failed send. A transport-level failure (5xx,
    /// timeout) parks the agent in Error; a rejection leaves it Idle.
    pub fn unclaim(&mut self, id: &Uuid, error: Option<String>) -> Result<()> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or(DispatchError::AgentNotFound(*id))?;
        agent.current_job_id = None;
        match error {
            Some(reason) => {
                tracing::warn!(agent_id = %id, %reason, "Agent marked error after failed send");
                agent.status = AgentStatus::Error;
                agent.last_error = Some(reason);
            }
            None => {
                agent.status = AgentStatus::Idle;
            }
        }
        Ok(())
    }

    /// Release an agent after a terminal job transition: bump the execution
    /// counter, fold metrics, return to Idle and refresh the heartbeat.
    ///
    /// `verdict` is None for a cancelled job, which counts toward the
    /// execution total but not the success rate.
    pub fn release(
        &mut self,
        id: &Uuid,
        verdict: Option<bool>,
        duration: Option<Duration>,
    ) -> Result<ReleaseOutcome> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or(DispatchError::AgentNotFound(*id))?;
        agent.jobs_executed += 1;
        if let Some(success) = verdict {
            let duration_ms = duration.map(|d| d.as_millis() as f64).unwrap_or(0.0);
            agent.metrics.record(success, duration_ms);
        }
        agent.current_job_id = None;
        agent.status = AgentStatus::Idle;
        agent.last_heartbeat = Some(Utc::now());
        let recycle_due = agent.jobs_executed >= self.recycle_after_jobs;
        tracing::debug!(
            agent_id = %id,
            jobs_executed = agent.jobs_executed,
            recycle_due,
            "Agent released"
        );
        Ok(ReleaseOutcome {
            session_id: agent.session_id,
            recycle_due,
        })
    }

    /// Refresh an agent's heartbeat. An Offline agent with no job in flight
    /// recovers to Idle; one holding a job keeps its state, which the job
    /// completion path re-asserts.
    pub fn heartbeat(&mut self, id: &Uuid) -> Result<()> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or(DispatchError::AgentNotFound(*id))?;
        agent.last_heartbeat = Some(Utc::now());
        if agent.status == AgentStatus::Offline && agent.current_job_id.is_none() {
            tracing::info!(agent_id = %id, "Offline agent recovered via heartbeat");
            agent.status = AgentStatus::Idle;
        }
        Ok(())
    }

    /// Agents whose heartbeat is older than `timeout` and that are not
    /// already Offline.
    pub fn stale_agents(&self, timeout: Duration) -> Vec<Uuid> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        self.agents
            .values()
            .filter(|a| a.status != AgentStatus::Offline)
            .filter(|a| match a.last_heartbeat {
                Some(hb) => hb < cutoff,
                None => a.created_at < cutoff,
            })
            .map(|a| a.id)
            .collect()
    }

    /// Transition an agent to Offline; returns the job it held, if any, so
    /// the caller can fail it.
    pub fn mark_offline(&mut self, id: &Uuid, reason: impl Into<String>) -> Result<Option<Uuid>> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or(DispatchError::AgentNotFound(*id))?;
        let reason = reason.into();
        tracing::warn!(agent_id = %id, %reason, "Agent offline");
        agent.status = AgentStatus::Offline;
        agent.last_error = Some(reason);
        Ok(agent.current_job_id.take())
    }

    pub fn mark_terminating(&mut self, id: &Uuid) -> Result<Option<Uuid>> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or(DispatchError::AgentNotFound(*id))?;
        agent.status = AgentStatus::Terminating;
        Ok(agent.current_job_id.take())
    }

    /// Enter the Recycling state. Only an agent with no job in flight can be
    /// recycled; a Busy agent is left for the next sweep.
    pub fn begin_recycle(&mut self, id: &Uuid) -> Result<()> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or(DispatchError::AgentNotFound(*id))?;
        if agent.current_job_id.is_some() {
            return Err(DispatchError::Internal(format!(
                "agent {id} cannot recycle with a job in flight"
            )));
        }
        agent.status = AgentStatus::Recycling;
        Ok(())
    }

    /// Commit the recycle outcome: success zeroes the counters and returns
    /// the agent to Idle; failure parks it in Error with the cause recorded.
    pub fn finish_recycle(&mut self, id: &Uuid, outcome: Result<()>) -> Result<()> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or(DispatchError::AgentNotFound(*id))?;
        match outcome {
            Ok(()) => {
                agent.jobs_executed = 0;
                agent.last_error = None;
                agent.metrics.reset();
                agent.status = AgentStatus::Idle;
                agent.last_heartbeat = Some(Utc::now());
                tracing::info!(agent_id = %id, "Agent recycled");
            }
            Err(e) => {
                tracing::error!(agent_id = %id, error = %e, "Agent recycle failed");
                agent.status = AgentStatus::Error;
                agent.last_error = Some(e.to_string());
            }
        }
        Ok(())
    }

    /// The agent bound to a session, if any.
    pub fn agent_for_session(&self, session_id: &Uuid) -> Option<&Agent> {
        self.agents.values().find(|a| a.session_id == *session_id)
    }
}
