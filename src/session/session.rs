use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Creating,
    Starting,
    Active,
    Busy,
    Recycling,
    Terminating,
    Terminated,
    Unhealthy,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Creating => write!(f, "creating"),
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Busy => write!(f, "busy"),
            SessionStatus::Recycling => write!(f, "recycling"),
            SessionStatus::Terminating => write!(f, "terminating"),
            SessionStatus::Terminated => write!(f, "terminated"),
            SessionStatus::Unhealthy => write!(f, "unhealthy"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

/// An isolated execution environment bound to at most one agent.
///
/// The id is stable across recycles; `generation` counts how many times the
/// underlying session has been rebuilt behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub host_user: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub assigned_agent_id: Option<Uuid>,
    pub jobs_processed: u32,
    pub last_activity: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub port: u16,
    pub generation: u32,
}

impl Session {
    pub fn new(host_user: impl Into<String>, port: u16) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            host_user: host_user.into(),
            status: SessionStatus::Creating,
            created_at: now,
            terminated_at: None,
            assigned_agent_id: None,
            jobs_processed: 0,
            last_activity: now,
            last_health_check: None,
            port,
            generation: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Active | SessionStatus::Busy | SessionStatus::Unhealthy
        )
    }
}
