use uuid::Uuid;

use thiserror::Error;

use crate::scheduler::job::JobStatus;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Illegal transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("No agents available")]
    NoCapacity,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Agent rejected the request: {0}")]
    SendRejected(String),

    #[error("Circuit open for agent {0}")]
    CircuitOpen(Uuid),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Session provisioning failed: {0}")]
    Provisioning(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
