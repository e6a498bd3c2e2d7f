use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::AgentId;

/// Breaker state for one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    failure_count: u32,
    last_failure_time: Option<Instant>,
    state: BreakerState,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            failure_count: 0,
            last_failure_time: None,
            state: BreakerState::Closed,
        }
    }
}

/// Point-in-time view of one agent's breaker
#[derive(Debug, Clone, Copy)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
}

/// Process-wide circuit breaker table, keyed by agent id.
///
/// Shared by cloning an `Arc` across workflows; all mutation happens under a
/// single mutex so concurrent steps targeting the same agent observe a
/// consistent state. An open breaker admits exactly one half-open trial once
/// the reset timeout elapses: the trial's success closes the breaker, its
/// failure re-opens it immediately.
pub struct CircuitBreakers {
    entries: Mutex<HashMap<AgentId, BreakerEntry>>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreakers {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            failure_threshold,
            reset_timeout,
        }
    }

    /// Whether a call to this agent may proceed. Transitions open -> half-open
    /// when the reset timeout has elapsed, admitting that caller as the trial;
    /// concurrent callers keep failing fast until the trial resolves.
    pub fn check(&self, agent_id: &AgentId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(agent_id.clone())
            .or_insert_with(BreakerEntry::new);

        match entry.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = entry
                    .last_failure_time
                    .map(|t| t.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    entry.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record an exhausted-retry failure. Returns true if this call opened
    /// the breaker.
    pub fn record_failure(&self, agent_id: &AgentId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(agent_id.clone())
            .or_insert_with(BreakerEntry::new);

        entry.failure_count += 1;
        entry.last_failure_time = Some(Instant::now());

        let should_open = entry.state == BreakerState::HalfOpen
            || entry.failure_count >= self.failure_threshold;
        let opened = should_open && entry.state != BreakerState::Open;
        if should_open {
            entry.state = BreakerState::Open;
        }
        opened
    }

    /// Record a success. Returns true if this call closed a non-closed
    /// breaker (a confirmed half-open trial).
    pub fn record_success(&self, agent_id: &AgentId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(agent_id.clone())
            .or_insert_with(BreakerEntry::new);

        let closed = entry.state != BreakerState::Closed;
        entry.failure_count = 0;
        entry.last_failure_time = None;
        entry.state = BreakerState::Closed;
        closed
    }

    pub fn snapshot(&self, agent_id: &AgentId) -> BreakerSnapshot {
        let entries = self.entries.lock().unwrap();
        match entries.get(agent_id) {
            Some(entry) => BreakerSnapshot {
                state: entry.state,
                failure_count: entry.failure_count,
            },
            None => BreakerSnapshot {
                state: BreakerState::Closed,
                failure_count: 0,
            },
        }
    }
}
