pub mod agent;
pub mod pool;

pub use agent::{Agent, AgentCapabilities, AgentMetrics, AgentStatus};
pub use pool::{AgentPool, ReleaseOutcome};
