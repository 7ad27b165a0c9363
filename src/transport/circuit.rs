use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Per-agent failure counter that short-circuits transport after a
/// threshold, for a cooldown window.
///
/// After the cooldown elapses the next call is allowed through; a failure
/// re-opens the circuit immediately, a success closes it.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    states: Mutex<HashMap<Uuid, BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a call to this agent's endpoint may proceed.
    pub fn allow(&self, agent_id: &Uuid) -> bool {
        let mut states = self.states.lock().unwrap();
        let state = match states.get_mut(agent_id) {
            Some(s) => s,
            None => return true,
        };
        match state.open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                // Cooldown elapsed; let one trial through. The failure
                // count stays at the threshold so another failure re-opens.
                state.open_until = None;
                true
            }
            None => true,
        }
    }

    pub fn record_success(&self, agent_id: &Uuid) {
        let mut states = self.states.lock().unwrap();
        states.remove(agent_id);
    }

    pub fn record_failure(&self, agent_id: &Uuid) {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(*agent_id).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.failure_threshold {
            state.open_until = Some(Instant::now() + self.cooldown);
            tracing::warn!(
                agent_id = %agent_id,
                failures = state.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit opened for agent endpoint"
            );
        }
    }

    /// Forget an agent's state entirely, e.g. on unregister.
    pub fn forget(&self, agent_id: &Uuid) {
        let mut states = self.states.lock().unwrap();
        states.remove(agent_id);
    }

    pub fn is_open(&self, agent_id: &Uuid) -> bool {
        let states = self.states.lock().unwrap();
        states
            .get(agent_id)
            .and_then(|s| s.open_until)
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }
}
