use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::agent::pool::AgentPool;
use crate::api::{create_router, ApiState};
use crate::config::OrchestratorConfig;
use crate::error::{DispatchError, Result};
use crate::health::{HealthMonitor, TaskSupervisor};
use crate::scheduler::dispatcher::WebhookNotice;
use crate::scheduler::queue::PriorityQueue;
use crate::scheduler::store::JobStore;
use crate::scheduler::Scheduler;
use crate::session::manager::{SessionManager, SessionProvisioner};
use crate::template::catalog::builtin_engine;
use crate::template::engine::TemplateEngine;
use crate::transport::AgentTransport;

const WEBHOOK_QUEUE_DEPTH: usize = 256;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolve once the process receives SIGTERM or SIGINT.
///
/// The binary bridges this into the orchestrator's cancellation token; the
/// scheduler and health sweeps drain their in-flight tick once the token
/// fires, and in-flight jobs on agents are left to run.
pub async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
}

/// Single-process orchestrator: owns the four state containers, the
/// scheduler, the health sweeps and the ingress API.
///
/// Everything is explicitly constructed and injected; there are no globals,
/// so tests build as many orchestrators side by side as they like.
pub struct Orchestrator {
    config: OrchestratorConfig,
    jobs: Arc<RwLock<JobStore>>,
    queue: Arc<RwLock<PriorityQueue>>,
    pool: Arc<RwLock<AgentPool>>,
    sessions: Arc<SessionManager>,
    scheduler: Arc<Scheduler>,
    templates: Arc<TemplateEngine>,
    transport: Arc<dyn AgentTransport>,
    webhook_rx: mpsc::Receiver<WebhookNotice>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        provisioner: Arc<dyn SessionProvisioner>,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        let jobs = Arc::new(RwLock::new(JobStore::new()));
        let queue = Arc::new(RwLock::new(PriorityQueue::new()));
        let pool = Arc::new(RwLock::new(AgentPool::new(config.recycle_after_jobs)));
        let sessions = Arc::new(SessionManager::new(
            provisioner,
            config.session_base_port,
        ));
        let (webhook_tx, webhook_rx) = mpsc::channel(WEBHOOK_QUEUE_DEPTH);
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler_tick,
            jobs.clone(),
            queue.clone(),
            pool.clone(),
            sessions.clone(),
            transport.clone(),
            Some(webhook_tx),
        ));

        Self {
            config,
            jobs,
            queue,
            pool,
            sessions,
            scheduler,
            templates: Arc::new(builtin_engine()),
            transport,
            webhook_rx,
        }
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            config: self.config.clone(),
            jobs: self.jobs.clone(),
            queue: self.queue.clone(),
            pool: self.pool.clone(),
            sessions: self.sessions.clone(),
            scheduler: self.scheduler.clone(),
            templates: self.templates.clone(),
        }
    }

    /// Run the orchestrator until the token is cancelled: spawns the
    /// scheduler, the health sweeps and the webhook notifier under the
    /// supervisor, then serves the ingress API.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let mut supervisor = TaskSupervisor::new(token.clone());

        let scheduler = self.scheduler.clone();
        let scheduler_token = supervisor.token();
        supervisor.spawn("scheduler", async move {
            scheduler.run(scheduler_token).await;
        });

        let monitor = Arc::new(HealthMonitor::new(
            self.config.clone(),
            self.jobs.clone(),
            self.pool.clone(),
            self.sessions.clone(),
            self.scheduler.clone(),
            self.transport.clone(),
        ));
        monitor.spawn_all(&mut supervisor);

        let notifier_token = supervisor.token();
        let mut webhook_rx = self.webhook_rx;
        supervisor.spawn("webhook-notifier", async move {
            let client = reqwest::Client::new();
            loop {
                let notice = tokio::select! {
                    _ = notifier_token.cancelled() => break,
                    notice = webhook_rx.recv() => match notice {
                        Some(n) => n,
                        None => break,
                    },
                };
                let result = client
                    .post(&notice.url)
                    .timeout(WEBHOOK_TIMEOUT)
                    .json(&notice.job)
                    .send()
                    .await;
                match result {
                    Ok(response) if response.status().is_success() => {
                        tracing::debug!(job_id = %notice.job.id, url = %notice.url, "Webhook delivered");
                    }
                    Ok(response) => {
                        tracing::warn!(
                            job_id = %notice.job.id,
                            url = %notice.url,
                            status = %response.status(),
                            "Webhook rejected"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %notice.job.id, url = %notice.url, error = %e, "Webhook delivery failed");
                    }
                }
            }
        });

        let state = ApiState {
            config: self.config.clone(),
            jobs: self.jobs,
            queue: self.queue,
            pool: self.pool,
            sessions: self.sessions,
            scheduler: self.scheduler,
            templates: self.templates,
        };
        let app = create_router(state);

        tracing::info!(addr = %self.config.listen_addr, "Ingress API listening");
        let listener = tokio::net::TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| DispatchError::Internal(format!("failed to bind ingress: {e}")))?;

        let shutdown_token = token.clone();
        let serve_result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_token.cancelled().await;
            })
            .await;

        supervisor.shutdown().await;
        serve_result.map_err(|e| DispatchError::Internal(format!("ingress server failed: {e}")))
    }
}
