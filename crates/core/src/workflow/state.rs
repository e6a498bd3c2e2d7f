use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::ErrorRecord;
use crate::types::{StepId, StepStatus, TaskResult, WorkflowId, WorkflowState, WorkflowStatus};

/// Single source of truth for one workflow's mutable state.
///
/// Cheap to clone; all clones share the same state behind an async `RwLock`,
/// so concurrent steps of a parallel level can record results safely.
/// Results merge by step id, which makes the view order-independent.
#[derive(Clone)]
pub struct StateManager {
    workflow_id: WorkflowId,
    inner: Arc<RwLock<WorkflowState>>,
}

impl StateManager {
    pub fn new(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            inner: Arc::new(RwLock::new(WorkflowState {
                workflow_id,
                status: WorkflowStatus::Pending,
                results: HashMap::new(),
                errors: Vec::new(),
                start_time: Utc::now(),
                end_time: None,
            })),
        }
    }

    /// Apply a status transition. Transitions are monotonic: once the
    /// workflow is terminal the status is frozen and this returns false.
    pub async fn set_status(&self, next: WorkflowStatus) -> bool {
        let mut state = self.inner.write().await;
        if state.status.is_terminal() {
            return false;
        }
        state.status = next;
        if next.is_terminal() {
            state.end_time = Some(Utc::now());
        }
        true
    }

    pub async fn status(&self) -> WorkflowStatus {
        self.inner.read().await.status
    }

    /// Record a step's terminal result, carrying its errors (in order) into
    /// the workflow error list.
    pub async fn record_result(&self, result: TaskResult) {
        let mut state = self.inner.write().await;
        if let Some(errors) = &result.errors {
            state.errors.extend(errors.iter().cloned());
        }
        state.results.insert(result.step_id.clone(), result);
    }

    pub async fn record_error(&self, error: ErrorRecord) {
        self.inner.write().await.errors.push(error);
    }

    pub async fn result(&self, step_id: &StepId) -> Option<TaskResult> {
        self.inner.read().await.results.get(step_id).cloned()
    }

    /// Project a step's input context from its declared dependencies only;
    /// a step never observes unrelated results. A skipped dependency is
    /// satisfied with empty data.
    pub async fn inputs_for(&self, dependencies: &[StepId]) -> serde_json::Map<String, Value> {
        let state = self.inner.read().await;
        let mut inputs = serde_json::Map::new();
        for dep in dependencies {
            let data = match state.results.get(dep) {
                Some(result) if result.status == StepStatus::Succeeded => result.data.clone(),
                _ => json!({}),
            };
            inputs.insert(dep.0.clone(), data);
        }
        inputs
    }

    /// Read-only projection for condition evaluation:
    /// `{ step_id: { data, status, metadata: { attempts, agent_id } } }`.
    pub async fn condition_scope(&self) -> Value {
        let state = self.inner.read().await;
        let mut scope = serde_json::Map::new();
        for (id, result) in &state.results {
            scope.insert(
                id.0.clone(),
                json!({
                    "data": result.data,
                    "status": result.status,
                    "metadata": {
                        "attempts": result.metadata.attempts,
                        "agent_id": result.metadata.agent_id,
                    },
                }),
            );
        }
        Value::Object(scope)
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    /// Fresh isolated scope for one loop iteration.
    pub fn child_scope(&self) -> Self {
        Self::new(self.workflow_id)
    }

    /// Merge a finished iteration back under `step_id#<index>` keys so
    /// repeated step ids across iterations never collide.
    pub async fn merge_iteration(&self, child: &StateManager, index: usize) {
        let child_state = child.inner.read().await.clone();
        let mut state = self.inner.write().await;
        for (id, mut result) in child_state.results {
            let qualified = id.for_iteration(index);
            result.step_id = qualified.clone();
            if let Some(errors) = &mut result.errors {
                for error in errors.iter_mut() {
                    error.step_id = qualified.clone();
                }
            }
            state.results.insert(qualified, result);
        }
        for mut error in child_state.errors {
            error.step_id = error.step_id.for_iteration(index);
            state.errors.push(error);
        }
    }

    pub async fn snapshot(&self) -> WorkflowState {
        self.inner.read().await.clone()
    }
}
