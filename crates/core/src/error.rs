//! Error taxonomy for the engine.
//!
//! Only plan rejection (`EngineError`) ever crosses the engine boundary as an
//! `Err`; every run-time step failure is classified into an [`ErrorKind`] and
//! recorded on the workflow state instead.

use serde::{Deserialize, Serialize};

use crate::types::StepId;

/// Pre-execution plan rejection. Detected before any agent invocation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The step graph contains a cycle involving the named step.
    #[error("dependency cycle involving step '{step_id}'")]
    DependencyCycle { step_id: StepId },

    /// Malformed plan: duplicate step ids, dangling references, bad loop spec.
    #[error("invalid plan: {0}")]
    Validation(String),
}

/// Classification of a recorded step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The agent invocation exceeded its timeout (retryable).
    Timeout,
    /// The agent was unreachable (retryable, trips the circuit breaker).
    AgentUnavailable,
    /// The agent's breaker was open; the call was never made.
    CircuitOpen,
    /// The step's condition expression failed to evaluate.
    Condition,
    /// The step was cancelled while in flight.
    Cancelled,
    /// The agent ran the task and reported failure (not retryable).
    TaskFailed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::AgentUnavailable => "agent_unavailable",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Condition => "condition",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TaskFailed => "task_failed",
        };
        write!(f, "{}", s)
    }
}

/// One recorded failure, as surfaced in `WorkflowResult.errors`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub step_id: StepId,
    pub error_kind: ErrorKind,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(step_id: StepId, error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            step_id,
            error_kind,
            message: message.into(),
        }
    }
}

/// Classified failure returned by the agent invocation boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvokeError {
    /// The agent could not be reached at all.
    #[error("agent unavailable: {0}")]
    Unavailable(String),

    /// The boundary itself timed out waiting on the agent.
    #[error("agent invocation timed out")]
    Timeout,

    /// The agent ran the task and reported a failure.
    #[error("task failed: {0}")]
    Task(String),
}

impl InvokeError {
    /// Timeouts and unavailability are transient; task failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InvokeError::Unavailable(_) | InvokeError::Timeout)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            InvokeError::Unavailable(_) => ErrorKind::AgentUnavailable,
            InvokeError::Timeout => ErrorKind::Timeout,
            InvokeError::Task(_) => ErrorKind::TaskFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_classification() {
        assert!(InvokeError::Unavailable("down".into()).is_retryable());
        assert!(InvokeError::Timeout.is_retryable());
        assert!(!InvokeError::Task("bad input".into()).is_retryable());
    }

    #[test]
    fn test_error_kind_wire_names() {
        let record = ErrorRecord::new(
            StepId::new("fetch"),
            ErrorKind::AgentUnavailable,
            "connection refused",
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["error_kind"], "agent_unavailable");
        assert_eq!(json["step_id"], "fetch");
    }
}
