use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::types::{AgentId, PlanId, StepId, WorkflowId};

/// An event in a workflow's execution log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub workflow_id: WorkflowId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(workflow_id: WorkflowId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Lifecycle events emitted by the engine and step executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle
    RunStarted {
        plan_id: PlanId,
        intent: String,
    },
    RunCompleted {
        duration_ms: u64,
    },
    RunFailed {
        error: String,
        duration_ms: u64,
    },
    RunCancelled {
        reason: String,
    },

    // Step lifecycle
    StepStarted {
        step_id: StepId,
        attempt: u32,
    },
    StepCompleted {
        step_id: StepId,
        attempts: u32,
        duration_ms: u64,
    },
    StepFailed {
        step_id: StepId,
        error: String,
        attempt: u32,
        will_retry: bool,
    },
    StepSkipped {
        step_id: StepId,
        reason: String,
    },

    // Circuit breaker transitions
    BreakerOpened {
        agent_id: AgentId,
    },
    BreakerClosed {
        agent_id: AgentId,
    },
}

/// Sink for execution events. The library ships an in-memory log; hosts that
/// need durable history wire in their own implementation.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events recorded for a workflow
    async fn events_for(&self, workflow_id: WorkflowId) -> anyhow::Result<Vec<Event>>;
}

/// Default event log: an append-only in-memory vector
#[derive(Default)]
pub struct InMemoryEventLog {
    events: Mutex<Vec<Event>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: Event) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn events_for(&self, workflow_id: WorkflowId) -> anyhow::Result<Vec<Event>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_log_filters_by_workflow() {
        let log = InMemoryEventLog::new();
        let wf_a = WorkflowId::new();
        let wf_b = WorkflowId::new();

        log.append(Event::new(
            wf_a,
            EventType::StepStarted {
                step_id: StepId::new("fetch"),
                attempt: 1,
            },
        ))
        .await
        .unwrap();
        log.append(Event::new(
            wf_b,
            EventType::RunCancelled {
                reason: "host shutdown".to_string(),
            },
        ))
        .await
        .unwrap();

        let events = log.events_for(wf_a).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].event_type,
            EventType::StepStarted { .. }
        ));
    }
}
