use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::session::session::{Session, SessionStatus};

/// Port draw attempts before a create fails.
const PORT_DRAW_ATTEMPTS: u32 = 8;
/// Width of the random port window above the base port.
const PORT_RANGE: u16 = 1000;

/// Host-side provisioning of isolated sessions: ensure the user exists,
/// build the session, start the agent process.
///
/// The orchestrator only drives this interface; what "session" means on the
/// host (RDP, VNC, container desktop) is the implementation's business.
#[async_trait]
pub trait SessionProvisioner: Send + Sync {
    async fn provision(&self, user: &str, port: u16) -> Result<()>;
    async fn destroy(&self, user: &str, port: u16) -> Result<()>;
    async fn check_health(&self, user: &str, port: u16) -> Result<bool>;
}

/// Provisioner that accepts everything. Stands in until a real host backend
/// is wired; also the default for local demos.
pub struct NoopProvisioner;

#[async_trait]
impl SessionProvisioner for NoopProvisioner {
    async fn provision(&self, user: &str, port: u16) -> Result<()> {
        tracing::debug!(user, port, "Noop provision");
        Ok(())
    }

    async fn destroy(&self, user: &str, port: u16) -> Result<()> {
        tracing::debug!(user, port, "Noop destroy");
        Ok(())
    }

    async fn check_health(&self, _user: &str, _port: u16) -> Result<bool> {
        Ok(true)
    }
}

/// Owns all sessions and their 1:1 binding to agents.
///
/// The registry lock is internal and never held across provisioner calls:
/// state is staged before the I/O and committed after.
pub struct SessionManager {
    sessions: RwLock<HashMap<Uuid, Session>>,
    provisioner: Arc<dyn SessionProvisioner>,
    base_port: u16,
}

impl SessionManager {
    pub fn new(provisioner: Arc<dyn SessionProvisioner>, base_port: u16) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            provisioner,
            base_port,
        }
    }

    /// Create and provision a session for a host user. Provisioning errors
    /// fail fast back to the caller and leave no registry entry behind.
    pub async fn create(&self, host_user: &str) -> Result<Session> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let port = Self::draw_port(self.base_port, &sessions)?;
            let mut session = Session::new(host_user, port);
            session.status = SessionStatus::Starting;
            sessions.insert(session.id, session.clone());
            session
        };

        match self
            .provisioner
            .provision(&session.host_user, session.port)
            .await
        {
            Ok(()) => {
                let mut sessions = self.sessions.write().await;
                let s = sessions
                    .get_mut(&session.id)
                    .ok_or(DispatchError::SessionNotFound(session.id))?;
                s.status = SessionStatus::Active;
                s.last_activity = Utc::now();
                tracing::info!(
                    session_id = %s.id,
                    user = %s.host_user,
                    port = s.port,
                    "Session created"
                );
                Ok(s.clone())
            }
            Err(e) => {
                self.sessions.write().await.remove(&session.id);
                Err(DispatchError::Provisioning(e.to_string()))
            }
        }
    }

    fn draw_port(base: u16, sessions: &HashMap<Uuid, Session>) -> Result<u16> {
        let used: HashSet<u16> = sessions
            .values()
            .filter(|s| s.status != SessionStatus::Terminated)
            .map(|s| s.port)
            .collect();
        let mut rng = rand::thread_rng();
        for _ in 0..PORT_DRAW_ATTEMPTS {
            let port = base + rng.gen_range(0..PORT_RANGE);
            if !used.contains(&port) {
                return Ok(port);
            }
        }
        Err(DispatchError::Provisioning(format!(
            "no free session port after {PORT_DRAW_ATTEMPTS} draws above {base}"
        )))
    }

    /// Tear a session down and drop it from the registry. Returns false for
    /// an unknown id.
    pub async fn terminate(&self, id: &Uuid) -> Result<bool> {
        let staged = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(id) {
                Some(s) => {
                    s.status = SessionStatus::Terminating;
                    Some((s.host_user.clone(), s.port))
                }
                None => None,
            }
        };
        let Some((user, port)) = staged else {
            return Ok(false);
        };

        if let Err(e) = self.provisioner.destroy(&user, port).await {
            tracing::warn!(session_id = %id, error = %e, "Session destroy reported an error");
        }

        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get_mut(id) {
            s.status = SessionStatus::Terminated;
            s.terminated_at = Some(Utc::now());
        }
        sessions.remove(id);
        tracing::info!(session_id = %id, "Session terminated");
        Ok(true)
    }

    /// Bind an agent for the duration of a job.
    pub async fn assign(&self, id: &Uuid, agent_id: Uuid) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or(DispatchError::SessionNotFound(*id))?;
        if let Some(existing) = session.assigned_agent_id {
            if existing != agent_id {
                return Err(DispatchError::Internal(format!(
                    "session {id} already bound to agent {existing}"
                )));
            }
        }
        session.assigned_agent_id = Some(agent_id);
        session.status = SessionStatus::Busy;
        session.last_activity = Utc::now();
        Ok(())
    }

    /// Release the session after a job completes.
    pub async fn release(&self, id: &Uuid) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or(DispatchError::SessionNotFound(*id))?;
        if session.status == SessionStatus::Busy {
            session.status = SessionStatus::Active;
        }
        session.jobs_processed += 1;
        session.last_activity = Utc::now();
        Ok(())
    }

    /// Destroy the underlying session and build a fresh one for the same
    /// user, preserving the externally visible id. The generation counter
    /// records the rebuild.
    pub async fn recycle(&self, id: &Uuid) -> Result<()> {
        let staged = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(id)
                .ok_or(DispatchError::SessionNotFound(*id))?;
            session.status = SessionStatus::Recycling;
            (session.host_user.clone(), session.port)
        };
        let (user, old_port) = staged;

        if let Err(e) = self.provisioner.destroy(&user, old_port).await {
            tracing::warn!(session_id = %id, error = %e, "Old session destroy reported an error");
        }

        let new_port = {
            let sessions = self.sessions.read().await;
            Self::draw_port(self.base_port, &sessions)?
        };

        match self.provisioner.provision(&user, new_port).await {
            Ok(()) => {
                let mut sessions = self.sessions.write().await;
                let session = sessions
                    .get_mut(id)
                    .ok_or(DispatchError::SessionNotFound(*id))?;
                session.port = new_port;
                session.generation += 1;
                session.jobs_processed = 0;
                session.status = SessionStatus::Active;
                session.last_activity = Utc::now();
                tracing::info!(
                    session_id = %id,
                    generation = session.generation,
                    port = new_port,
                    "Session recycled"
                );
                Ok(())
            }
            Err(e) => {
                let mut sessions = self.sessions.write().await;
                if let Some(session) = sessions.get_mut(id) {
                    session.status = SessionStatus::Error;
                }
                Err(DispatchError::Provisioning(e.to_string()))
            }
        }
    }

    /// Ask the provisioner about a session. False marks it Unhealthy; true
    /// recovers it to Active. The sweep decides what to do about unhealthy
    /// sessions.
    pub async fn check_health(&self, id: &Uuid) -> Result<bool> {
        let staged = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(id)
                .ok_or(DispatchError::SessionNotFound(*id))?;
            (session.host_user.clone(), session.port)
        };
        let healthy = self.provisioner.check_health(&staged.0, staged.1).await?;

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id) {
            session.last_health_check = Some(Utc::now());
            if healthy && session.status == SessionStatus::Unhealthy {
                session.status = SessionStatus::Active;
            } else if !healthy && session.is_live() {
                tracing::warn!(session_id = %id, "Session unhealthy");
                session.status = SessionStatus::Unhealthy;
            }
        }
        Ok(healthy)
    }

    pub async fn get(&self, id: &Uuid) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn live_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_live())
            .count()
    }

    /// Sessions past the inactivity bound or the per-session job budget.
    pub async fn recycle_candidates(
        &self,
        inactivity_timeout: Duration,
        max_jobs: u32,
    ) -> Vec<Uuid> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(inactivity_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_live())
            .filter(|s| s.last_activity < cutoff || s.jobs_processed >= max_jobs)
            .map(|s| s.id)
            .collect()
    }

    /// Live sessions not held by any agent.
    pub async fn orphans(&self, bound: &HashSet<Uuid>) -> Vec<Uuid> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_live())
            .filter(|s| !bound.contains(&s.id))
            .map(|s| s.id)
            .collect()
    }
}
