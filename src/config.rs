use std::net::SocketAddr;
use std::time::Duration;

/// Orchestrator configuration.
///
/// Durations are stored as `Duration` so integration tests can shrink them
/// to milliseconds; the CLI populates them from the flat keys in natural
/// units (minutes, hours, seconds).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Address the ingress API listens on.
    pub listen_addr: SocketAddr,
    /// Base port for isolated session allocation; the actual port is
    /// `base + random(0..1000)`.
    pub session_base_port: u16,
    /// Scheduler dispatch tick.
    pub scheduler_tick: Duration,
    /// Timeout for a single job-send to an agent endpoint.
    pub send_timeout: Duration,
    /// Heartbeat staleness bound before an agent is considered offline.
    pub heartbeat_timeout: Duration,
    /// Session inactivity bound before it is marked for recycle.
    pub session_inactivity_timeout: Duration,
    /// Jobs processed by one session before it is marked for recycle.
    pub session_max_jobs: u32,
    /// Running-job age bound before the job is timed out.
    pub job_timeout: Duration,
    /// Terminal jobs retained by the cleanup sweep.
    pub max_completed_history: usize,
    /// Jobs executed by one agent before a recycle is triggered.
    pub recycle_after_jobs: u32,
    /// Consecutive transport failures before an agent circuit opens.
    pub circuit_failure_threshold: u32,
    /// How long an open circuit short-circuits sends.
    pub circuit_cooldown: Duration,
    /// Cadence of the agent/session/job health sweeps.
    pub health_sweep_interval: Duration,
    /// Cadence of the history/orphan cleanup sweep.
    pub cleanup_interval: Duration,
    /// Stub agents registered at startup for local demos.
    pub default_agent_count: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".parse().unwrap(),
            session_base_port: 3390,
            scheduler_tick: Duration::from_secs(5),
            send_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(5 * 60),
            session_inactivity_timeout: Duration::from_secs(2 * 60 * 60),
            session_max_jobs: 50,
            job_timeout: Duration::from_secs(30 * 60),
            max_completed_history: 1000,
            recycle_after_jobs: 50,
            circuit_failure_threshold: 5,
            circuit_cooldown: Duration::from_secs(30),
            health_sweep_interval: Duration::from_secs(2 * 60),
            cleanup_interval: Duration::from_secs(4 * 60 * 60),
            default_agent_count: 2,
        }
    }
}

impl OrchestratorConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }
}
