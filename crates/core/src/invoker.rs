use async_trait::async_trait;

use crate::error::InvokeError;
use crate::types::{AgentId, StepId, WorkflowId};

/// Read-only execution context handed to the agent for one attempt
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    /// 1-based attempt number
    pub attempt: u32,
    /// Outputs of the step's declared dependencies, keyed by step id
    pub inputs: serde_json::Map<String, serde_json::Value>,
}

/// One agent invocation as seen from the engine
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub agent_id: AgentId,
    pub task_type: String,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub context: StepContext,
}

/// Boundary to external task executors. The engine treats the callee as
/// opaque: latency and correctness are outside its control, and every failure
/// must come back classified as an [`InvokeError`].
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: InvokeRequest) -> Result<serde_json::Value, InvokeError>;
}
