//! Agent-facing transport: job dispatch, cancellation and status polls over
//! the agents' HTTP endpoints.

pub mod circuit;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::agent::agent::Agent;
use crate::error::{DispatchError, Result};
use crate::scheduler::job::Job;
use crate::transport::circuit::CircuitBreaker;

/// Status payload reported by an agent's `/status` endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAgentStatus {
    pub status: String,
    #[serde(default)]
    pub current_job_id: Option<Uuid>,
}

/// Outbound calls the orchestrator makes against an agent endpoint.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Deliver a job. Success means the remote acknowledged acceptance.
    async fn send_job(&self, agent: &Agent, job: &Job) -> Result<()>;

    /// Best-effort cancellation of an in-flight job. No retry.
    async fn cancel_job(&self, agent: &Agent, job_id: Uuid) -> Result<()>;

    /// Poll the agent's live status.
    async fn query_status(&self, agent: &Agent) -> Result<RemoteAgentStatus>;
}

/// Backoff schedule between send attempts.
const SEND_BACKOFF_MS: [u64; 3] = [250, 500, 1000];
/// One initial attempt plus one retry per backoff gap.
const SEND_ATTEMPTS: usize = SEND_BACKOFF_MS.len() + 1;

/// HTTP transport with retry, exponential backoff and a per-agent circuit
/// breaker.
///
/// Network errors and 5xx responses are retried after 250, 500 and 1000 ms;
/// a 4xx response is a terminal rejection. One failed send counts one
/// failure toward the breaker regardless of how many attempts it burned.
pub struct HttpAgentTransport {
    client: reqwest::Client,
    breaker: CircuitBreaker,
    send_timeout: Duration,
}

impl HttpAgentTransport {
    pub fn new(
        send_timeout: Duration,
        circuit_failure_threshold: u32,
        circuit_cooldown: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            breaker: CircuitBreaker::new(circuit_failure_threshold, circuit_cooldown),
            send_timeout,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn post_job_once(&self, agent: &Agent, job: &Job) -> Result<()> {
        let url = format!("{}/jobs", agent.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .timeout(self.send_timeout)
            .json(job)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(DispatchError::SendRejected(format!("{status}: {body}")))
        } else {
            Err(DispatchError::Transport(format!("{status}: {body}")))
        }
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn send_job(&self, agent: &Agent, job: &Job) -> Result<()> {
        if !self.breaker.allow(&agent.id) {
            return Err(DispatchError::CircuitOpen(agent.id));
        }

        let mut last_err = DispatchError::Transport("no attempt made".to_string());
        for attempt in 0..SEND_ATTEMPTS {
            match self.post_job_once(agent, job).await {
                Ok(()) => {
                    self.breaker.record_success(&agent.id);
                    tracing::debug!(agent_id = %agent.id, job_id = %job.id, attempt, "Job sent");
                    return Ok(());
                }
                // 4xx is terminal: the endpoint is reachable, the request
                // is what it objects to.
                Err(e @ DispatchError::SendRejected(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        agent_id = %agent.id,
                        job_id = %job.id,
                        attempt,
                        error = %e,
                        "Send attempt failed"
                    );
                    last_err = e;
                    if attempt + 1 < SEND_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(SEND_BACKOFF_MS[attempt])).await;
                    }
                }
            }
        }
        self.breaker.record_failure(&agent.id);
        Err(last_err)
    }

    async fn cancel_job(&self, agent: &Agent, job_id: Uuid) -> Result<()> {
        let url = format!(
            "{}/jobs/{}/cancel",
            agent.endpoint.trim_end_matches('/'),
            job_id
        );
        let response = self
            .client
            .post(&url)
            .timeout(self.send_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DispatchError::Transport(format!(
                "cancel returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn query_status(&self, agent: &Agent) -> Result<RemoteAgentStatus> {
        if !self.breaker.allow(&agent.id) {
            return Err(DispatchError::CircuitOpen(agent.id));
        }
        let url = format!("{}/status", agent.endpoint.trim_end_matches('/'));
        let result = async {
            let response = self
                .client
                .get(&url)
                .timeout(self.send_timeout)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(DispatchError::Transport(format!(
                    "status returned {}",
                    response.status()
                )));
            }
            Ok(response.json::<RemoteAgentStatus>().await?)
        }
        .await;
        match &result {
            Ok(_) => self.breaker.record_success(&agent.id),
            Err(_) => self.breaker.record_failure(&agent.id),
        }
        result
    }
}
