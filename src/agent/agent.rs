use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Starting,
    Idle,
    Busy,
    Error,
    Offline,
    Recycling,
    Terminating,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Starting => write!(f, "starting"),
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Offline => write!(f, "offline"),
            AgentStatus::Recycling => write!(f, "recycling"),
            AgentStatus::Terminating => write!(f, "terminating"),
        }
    }
}

fn default_max_concurrent_jobs() -> u32 {
    1
}

/// Declared capabilities of an agent. An empty application list accepts
/// every job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    #[serde(default)]
    pub supported_applications: Vec<String>,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            supported_applications: Vec::new(),
            max_concurrent_jobs: 1,
        }
    }
}

/// Rolling execution metrics for one agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    pub total_completed: u64,
    pub total_failed: u64,
    pub average_duration_ms: f64,
    pub last_completed_at: Option<DateTime<Utc>>,
}

impl AgentMetrics {
    /// Completed over all finished jobs. A cold agent rates 1.0 so it
    /// competes with veterans instead of ranking last.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_completed + self.total_failed;
        if total == 0 {
            return 1.0;
        }
        self.total_completed as f64 / total as f64
    }

    /// Fold one finished job into the running average.
    pub fn record(&mut self, success: bool, duration_ms: f64) {
        if success {
            self.total_completed += 1;
        } else {
            self.total_failed += 1;
        }
        let n = (self.total_completed + self.total_failed) as f64;
        self.average_duration_ms += (duration_ms - self.average_duration_ms) / n;
        self.last_completed_at = Some(Utc::now());
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A worker process that executes jobs against a desktop UI, bound 1:1 to an
/// isolated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub session_id: Uuid,
    pub host_user: String,
    pub capabilities: AgentCapabilities,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub current_job_id: Option<Uuid>,
    pub jobs_executed: u32,
    pub last_error: Option<String>,
    pub endpoint: String,
    pub metrics: AgentMetrics,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        session_id: Uuid,
        host_user: impl Into<String>,
        capabilities: AgentCapabilities,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            session_id,
            host_user: host_user.into(),
            capabilities,
            status: AgentStatus::Starting,
            created_at: Utc::now(),
            last_heartbeat: None,
            current_job_id: None,
            jobs_executed: 0,
            last_error: None,
            endpoint: endpoint.into(),
            metrics: AgentMetrics::default(),
        }
    }

    /// Capability fit: an empty declaration accepts everything; otherwise
    /// the job's application target must contain one declared application as
    /// a case-insensitive substring.
    pub fn supports(&self, application: &str) -> bool {
        if self.capabilities.supported_applications.is_empty() {
            return true;
        }
        let target = application.to_lowercase();
        self.capabilities
            .supported_applications
            .iter()
            .any(|app| target.contains(&app.to_lowercase()))
    }
}
