//! Ingress HTTP surface: job submission, template execution, agent
//! registration, heartbeats and status callbacks.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::agent::agent::{Agent, AgentCapabilities, AgentStatus};
use crate::agent::pool::AgentPool;
use crate::config::OrchestratorConfig;
use crate::error::DispatchError;
use crate::scheduler::job::{Job, JobSpec, JobStatus};
use crate::scheduler::queue::PriorityQueue;
use crate::scheduler::store::JobStore;
use crate::scheduler::Scheduler;
use crate::session::manager::SessionManager;
use crate::template::engine::{ExpandOptions, TemplateEngine};

const MAX_PAGE_SIZE: usize = 100;

#[derive(Clone)]
pub struct ApiState {
    pub config: OrchestratorConfig,
    pub jobs: Arc<RwLock<JobStore>>,
    pub queue: Arc<RwLock<PriorityQueue>>,
    pub pool: Arc<RwLock<AgentPool>>,
    pub sessions: Arc<SessionManager>,
    pub scheduler: Arc<Scheduler>,
    pub templates: Arc<TemplateEngine>,
}

/// API error mapped onto the client-facing failure shape
/// `{success:false, errorMessage, errors[]}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => {
                let correlation_id = Uuid::new_v4();
                tracing::error!(%correlation_id, error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("internal error, correlation id {correlation_id}"),
                )
            }
        };
        (
            status,
            Json(json!({
                "success": false,
                "errorMessage": message,
                "errors": [message],
            })),
        )
            .into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::JobNotFound(_)
            | DispatchError::AgentNotFound(_)
            | DispatchError::SessionNotFound(_)
            | DispatchError::TemplateNotFound(_) => ApiError::NotFound(err.to_string()),
            DispatchError::InvalidInput(_) | DispatchError::IllegalTransition { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            DispatchError::Provisioning(_) => ApiError::Unavailable(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn create_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/jobs", post(create_job_handler))
        .route("/jobs", get(list_jobs_handler))
        .route("/jobs/:id", get(get_job_handler))
        .route("/jobs/:id/cancel", post(cancel_job_handler))
        .route("/jobs/:id/status", patch(status_callback_handler))
        .route("/templates", get(list_templates_handler))
        .route("/templates/:id", get(get_template_handler))
        .route("/templates/:id/execute", post(execute_template_handler))
        .route("/agents", post(register_agent_handler))
        .route("/agents", get(list_agents_handler))
        .route("/agents/:id", get(get_agent_handler))
        .route("/agents/:id", delete(unregister_agent_handler))
        .route("/agents/:id/heartbeat", post(heartbeat_handler))
        .route("/queue", get(queue_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Jobs
// =============================================================================

fn validate_job_spec(spec: &JobSpec) -> ApiResult<()> {
    if spec.name.trim().is_empty() {
        return Err(ApiError::BadRequest("job name is required".to_string()));
    }
    if spec.application_path.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "application path is required".to_string(),
        ));
    }
    if spec.steps.is_empty() {
        return Err(ApiError::BadRequest(
            "a job needs at least one step".to_string(),
        ));
    }
    Ok(())
}

/// Store a new job and enqueue it. Returns 201 with the job id, or 202 with
/// the queued job when no agent currently has capacity (the job stays
/// queued; this is not an error).
pub async fn create_job_handler(
    State(state): State<ApiState>,
    Json(spec): Json<JobSpec>,
) -> ApiResult<Response> {
    validate_job_spec(&spec)?;
    store_and_enqueue(&state, Job::new(spec)).await
}

async fn store_and_enqueue(state: &ApiState, job: Job) -> ApiResult<Response> {
    let job_id = job.id;
    if !state.jobs.write().await.put(job) {
        return Err(ApiError::Unavailable("job store is at capacity".to_string()));
    }
    state.scheduler.enqueue(job_id).await?;

    let idle = state.pool.read().await.idle_count();
    if idle == 0 {
        let queued = state
            .jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or_else(|| ApiError::Internal("queued job vanished".to_string()))?;
        return Ok((StatusCode::ACCEPTED, Json(json!(queued))).into_response());
    }
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "jobId": job_id })),
    )
        .into_response())
}

pub async fn get_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    let job = state
        .jobs
        .read()
        .await
        .get(&id)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("Job not found: {id}")))?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub take: Option<usize>,
}

/// Jobs ordered by creation time, newest first.
pub async fn list_jobs_handler(
    State(state): State<ApiState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let filter = match &query.status {
        Some(raw) => Some(
            raw.parse::<JobStatus>()
                .map_err(ApiError::BadRequest)?,
        ),
        None => None,
    };
    let skip = query.skip.unwrap_or(0);
    let take = query.take.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE);

    let jobs = state.jobs.read().await;
    let page: Vec<Job> = jobs
        .recent_first()
        .into_iter()
        .filter(|j| filter.map(|f| j.status == f).unwrap_or(true))
        .skip(skip)
        .take(take)
        .cloned()
        .collect();
    Ok(Json(page))
}

pub async fn cancel_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let cancelled = state.scheduler.cancel(id).await?;
    Ok(Json(json!({ "success": cancelled })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCallbackBody {
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Entry point for agent-side completion notifications.
pub async fn status_callback_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<StatusCallbackBody>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .scheduler
        .handle_status(id, body.status, body.result, body.error)
        .await?;
    Ok(Json(json!({ "success": true })))
}

// =============================================================================
// Templates
// =============================================================================

pub async fn list_templates_handler(
    State(state): State<ApiState>,
) -> Json<Vec<crate::template::engine::Template>> {
    Json(state.templates.list().into_iter().cloned().collect())
}

pub async fn get_template_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<crate::template::engine::Template>> {
    let template = state
        .templates
        .get(&id)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("Template not found: {id}")))?;
    Ok(Json(template))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteTemplateBody {
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub priority: Option<crate::scheduler::job::JobPriority>,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Expand a template and submit the resulting job.
pub async fn execute_template_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<ExecuteTemplateBody>,
) -> ApiResult<Response> {
    let params: HashMap<String, String> = body
        .parameters
        .into_iter()
        .map(|(k, v)| {
            let s = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (k, s)
        })
        .collect();
    let job = state.templates.expand(
        &id,
        &params,
        ExpandOptions {
            priority: body.priority,
            webhook_url: body.webhook_url,
            max_retries: None,
        },
    )?;
    store_and_enqueue(&state, job).await
}

// =============================================================================
// Agents
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgentBody {
    pub name: String,
    pub user: String,
    #[serde(default)]
    pub capabilities: Option<AgentCapabilities>,
}

/// Provision a session, bind a fresh agent to it and return the agent in
/// its settled Idle state. Provisioning failures fail fast with 503.
pub async fn register_agent_handler(
    State(state): State<ApiState>,
    Json(body): Json<RegisterAgentBody>,
) -> ApiResult<(StatusCode, Json<Agent>)> {
    if body.name.trim().is_empty() || body.user.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "agent name and user are required".to_string(),
        ));
    }

    let session = state.sessions.create(&body.user).await?;
    let endpoint = format!("http://127.0.0.1:{}", session.port);
    let mut agent = Agent::new(
        body.name,
        session.id,
        body.user,
        body.capabilities.unwrap_or_default(),
        endpoint,
    );
    // Starting is momentary: the session is up and the agent process is
    // launched, so the agent settles Idle before the call returns.
    agent.status = AgentStatus::Idle;
    agent.last_heartbeat = Some(chrono::Utc::now());

    state.pool.write().await.register(agent.clone());
    state.scheduler.nudge();
    Ok((StatusCode::CREATED, Json(agent)))
}

pub async fn list_agents_handler(State(state): State<ApiState>) -> Json<Vec<Agent>> {
    let mut agents = state.pool.read().await.snapshot();
    agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Json(agents)
}

pub async fn get_agent_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Agent>> {
    let agent = state
        .pool
        .read()
        .await
        .get(&id)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("Agent not found: {id}")))?;
    Ok(Json(agent))
}

pub async fn heartbeat_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    state.pool.write().await.heartbeat(&id)?;
    Ok(Json(json!({ "success": true })))
}

/// Remove an agent and terminate its session. A job in flight fails and
/// goes back through the retry path.
pub async fn unregister_agent_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let lost_job = state.pool.write().await.mark_terminating(&id)?;
    if let Some(job_id) = lost_job {
        if let Err(e) = state
            .scheduler
            .finalize(
                job_id,
                JobStatus::Failed,
                None,
                Some("agent unregistered".to_string()),
                false,
            )
            .await
        {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to fail job of unregistered agent");
        }
    }

    let removed = state.pool.write().await.remove(&id);
    let Some(agent) = removed else {
        return Err(ApiError::NotFound(format!("Agent not found: {id}")));
    };
    state.sessions.terminate(&agent.session_id).await?;
    Ok(Json(json!({ "success": true })))
}

// =============================================================================
// Introspection
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueResponse {
    pub depth: usize,
    pub job_ids: Vec<Uuid>,
}

pub async fn queue_handler(State(state): State<ApiState>) -> Json<QueueResponse> {
    let queue = state.queue.read().await;
    Json(QueueResponse {
        depth: queue.len(),
        job_ids: queue.snapshot(),
    })
}

pub async fn health_handler(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let (total_jobs, running, queued) = {
        let jobs = state.jobs.read().await;
        (
            jobs.len(),
            jobs.by_status(JobStatus::Running).len(),
            jobs.by_status(JobStatus::Queued).len(),
        )
    };
    let (agents, idle, busy) = {
        let pool = state.pool.read().await;
        (
            pool.len(),
            pool.idle_count(),
            pool.count_by_status(AgentStatus::Busy),
        )
    };
    Json(json!({
        "status": "ok",
        "jobs": { "total": total_jobs, "running": running, "queued": queued },
        "agents": { "total": agents, "idle": idle, "busy": busy },
        "queueDepth": state.queue.read().await.len(),
        "activeSessions": state.sessions.live_count().await,
    }))
}
