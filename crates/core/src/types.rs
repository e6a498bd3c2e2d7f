use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ErrorRecord;

/// Unique identifier for a single plan execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an execution plan (assigned by the plan builder)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanId(pub String);

impl PlanId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a step within a plan
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Key for a loop-iteration copy of this step (`step_id#<index>`)
    pub fn for_iteration(&self, index: usize) -> Self {
        Self(format!("{}#{}", self.0, index))
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an external agent (already resolved by the registry)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling strategy for a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Declared array order, one step at a time
    Sequential,
    /// Level by level, concurrent within a level
    Parallel,
    /// Level by level, one step at a time within a level
    Conditional,
    /// Repeat a named sub-sequence per the plan's loop descriptor
    Loop,
}

/// Backoff shape between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    Fixed,
    Exponential,
}

/// Retry policy for a step (falls back to `EngineConfig::default_retry`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_type: BackoffType,
    /// Delay before the first retry, in milliseconds
    pub initial_delay: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_multiplier() -> f64 {
    2.0
}

impl RetryPolicy {
    /// Backoff before the retry following `retry_index` failed attempts
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        match self.backoff_type {
            BackoffType::Fixed => Duration::from_millis(self.initial_delay),
            BackoffType::Exponential => {
                let millis = self.initial_delay as f64 * self.multiplier.powi(retry_index as i32);
                Duration::from_millis(millis as u64)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_type: BackoffType::Fixed,
            initial_delay: 1000,
            multiplier: default_multiplier(),
        }
    }
}

fn default_required() -> bool {
    true
}

/// One unit of work delegated to an external agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    pub step_id: StepId,
    pub agent_id: AgentId,
    pub task_type: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    /// Constrained boolean expression over accumulated results (see `workflow::condition`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Per-invocation timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// A required step's exhausted-retry failure aborts the whole plan
    #[serde(default = "default_required")]
    pub required: bool,
}

/// Loop descriptor for `Strategy::Loop` plans
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSpec {
    /// The sub-sequence of step ids that form the loop body
    pub steps: Vec<StepId>,
    #[serde(flatten)]
    pub kind: LoopKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoopKind {
    /// One iteration per item; `item` and `index` are visible to conditions
    ForEach { items: Vec<serde_json::Value> },
    /// Re-evaluated before each iteration, bounded by `max_iterations`
    While { condition: String, max_iterations: u32 },
}

/// Immutable description of steps, dependencies, and scheduling strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub plan_id: PlanId,
    pub intent: String,
    pub strategy: Strategy,
    pub steps: Vec<AgentStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_spec: Option<LoopSpec>,
}

impl ExecutionPlan {
    pub fn step(&self, step_id: &StepId) -> Option<&AgentStep> {
        self.steps.iter().find(|s| &s.step_id == step_id)
    }
}

/// Status of a whole plan execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Per-step status (terminal once past `Running`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Attempt accounting attached to every task result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub attempts: u32,
    pub duration_ms: u64,
    pub agent_id: AgentId,
}

/// Outcome of one step, as recorded in workflow state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub step_id: StepId,
    pub status: StepStatus,
    #[serde(default)]
    pub data: serde_json::Value,
    pub metadata: TaskMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ErrorRecord>>,
}

impl TaskResult {
    /// A step recorded as skipped without any agent invocation
    pub fn skipped(step_id: StepId, agent_id: AgentId) -> Self {
        Self {
            step_id,
            status: StepStatus::Skipped,
            data: serde_json::Value::Object(serde_json::Map::new()),
            metadata: TaskMetadata {
                attempts: 0,
                duration_ms: 0,
                agent_id,
            },
            errors: None,
        }
    }
}

/// Mutable record of a single plan execution's progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub results: HashMap<StepId, TaskResult>,
    pub errors: Vec<ErrorRecord>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Final aggregated output of one plan execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    /// step_id -> the step's result payload (succeeded steps only)
    pub data: HashMap<StepId, serde_json::Value>,
    pub errors: Vec<ErrorRecord>,
    /// Wall-clock duration in fractional seconds
    pub duration: f64,
    pub steps_executed: usize,
    pub steps_skipped: usize,
}

/// What to do when a step's condition fails to evaluate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionPolicy {
    /// The step fails (and aborts the plan if required)
    #[default]
    FailStep,
    /// The step is skipped as if the condition were false
    TreatAsFalse,
}

/// Engine-level defaults and bounds, set by the host per engine instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum in-flight steps within one level
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Default per-step timeout in seconds
    #[serde(default = "default_step_timeout")]
    pub default_timeout: u64,

    #[serde(default)]
    pub default_retry: RetryPolicy,

    /// Optional aggregate timeout per level in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_timeout: Option<u64>,

    #[serde(default)]
    pub condition_policy: ConditionPolicy,

    /// Consecutive failures before an agent's breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open breaker waits before admitting a half-open trial
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout: u64,

    /// Hard cap on loop iterations regardless of the loop descriptor
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,
}

fn default_max_parallel() -> usize {
    4
}

fn default_step_timeout() -> u64 {
    60
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout() -> u64 {
    30
}

fn default_max_loop_iterations() -> u32 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            default_timeout: default_step_timeout(),
            default_retry: RetryPolicy::default(),
            level_timeout: None,
            condition_policy: ConditionPolicy::default(),
            failure_threshold: default_failure_threshold(),
            reset_timeout: default_reset_timeout(),
            max_loop_iterations: default_max_loop_iterations(),
        }
    }
}
