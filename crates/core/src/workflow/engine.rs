use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::breaker::CircuitBreakers;
use super::condition;
use super::levels::DependencyLevels;
use super::result;
use super::state::StateManager;
use super::step_executor::StepExecutor;
use crate::error::{EngineError, ErrorKind, ErrorRecord};
use crate::events::{Event, EventLog, EventType, InMemoryEventLog};
use crate::invoker::AgentInvoker;
use crate::types::{
    AgentStep, ConditionPolicy, EngineConfig, ExecutionPlan, LoopKind, LoopSpec, StepId,
    StepStatus, Strategy, TaskMetadata, TaskResult, WorkflowId, WorkflowResult, WorkflowStatus,
};

/// How a strategy run ended, before the terminal status is stamped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

/// Decision for a step's condition gate
enum Gate {
    Run,
    Skip,
    Fail(ErrorRecord),
}

/// Coordinates one plan execution: validates the plan, orders it into
/// dependency levels, dispatches steps per the plan's strategy, and compiles
/// the final result. Runtime step failures never surface as errors; only
/// pre-execution plan rejection does.
pub struct WorkflowEngine {
    invoker: Arc<dyn AgentInvoker>,
    breakers: Arc<CircuitBreakers>,
    event_log: Arc<dyn EventLog>,
    step_executor: Arc<StepExecutor>,
    config: EngineConfig,
    // Track active runs for cancellation
    active: Mutex<HashMap<WorkflowId, CancellationToken>>,
}

impl WorkflowEngine {
    pub fn new(invoker: Arc<dyn AgentInvoker>, config: EngineConfig) -> Self {
        let breakers = Arc::new(CircuitBreakers::new(
            config.failure_threshold,
            Duration::from_secs(config.reset_timeout),
        ));
        let event_log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        Self::assemble(invoker, breakers, event_log, config)
    }

    /// Replace the default in-memory event log (host-provided persistence)
    pub fn with_event_log(self, event_log: Arc<dyn EventLog>) -> Self {
        Self::assemble(self.invoker, self.breakers, event_log, self.config)
    }

    /// Share a breaker table across several engines in one process
    pub fn with_breakers(self, breakers: Arc<CircuitBreakers>) -> Self {
        Self::assemble(self.invoker, breakers, self.event_log, self.config)
    }

    fn assemble(
        invoker: Arc<dyn AgentInvoker>,
        breakers: Arc<CircuitBreakers>,
        event_log: Arc<dyn EventLog>,
        config: EngineConfig,
    ) -> Self {
        let step_executor = Arc::new(StepExecutor::new(
            invoker.clone(),
            breakers.clone(),
            event_log.clone(),
            Duration::from_secs(config.default_timeout),
            config.default_retry.clone(),
        ));
        Self {
            invoker,
            breakers,
            event_log,
            step_executor,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn breakers(&self) -> Arc<CircuitBreakers> {
        self.breakers.clone()
    }

    /// Workflows currently executing on this engine
    pub fn active_workflows(&self) -> Vec<WorkflowId> {
        self.active.lock().unwrap().keys().copied().collect()
    }

    /// Request cancellation of a running workflow. In-flight steps are marked
    /// cancelled; the run terminates with status `cancelled`.
    pub fn cancel(&self, workflow_id: WorkflowId) -> bool {
        let active = self.active.lock().unwrap();
        match active.get(&workflow_id) {
            Some(token) => {
                tracing::info!("Cancellation requested for workflow {}", workflow_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Execute a plan to completion and return the aggregated result.
    ///
    /// Returns `Err` only for pre-execution rejection (validation failure or
    /// a dependency cycle); every run-time failure is reported through the
    /// returned `WorkflowResult`.
    pub async fn execute(&self, plan: &ExecutionPlan) -> Result<WorkflowResult, EngineError> {
        let levels = DependencyLevels::analyze(plan)?;

        let workflow_id = WorkflowId::new();
        let state = StateManager::new(workflow_id);
        let cancel = CancellationToken::new();
        self.active
            .lock()
            .unwrap()
            .insert(workflow_id, cancel.clone());
        // Unregisters the run even if this future is dropped mid-execution
        let _active = ActiveGuard {
            engine: self,
            workflow_id,
        };

        tracing::info!(
            "Starting workflow {} for plan {} (strategy {:?})",
            workflow_id,
            plan.plan_id,
            plan.strategy
        );
        self.emit(Event::new(
            workflow_id,
            EventType::RunStarted {
                plan_id: plan.plan_id.clone(),
                intent: plan.intent.clone(),
            },
        ))
        .await;
        state.set_status(WorkflowStatus::Running).await;

        let outcome = match plan.strategy {
            Strategy::Sequential => self.run_sequential(plan, &state, &cancel).await,
            Strategy::Parallel => self.run_leveled(plan, &levels, &state, &cancel, true).await,
            Strategy::Conditional => self.run_leveled(plan, &levels, &state, &cancel, false).await,
            Strategy::Loop => self.run_loop(plan, &state, &cancel).await,
        };

        let final_status = match outcome {
            Outcome::Completed => WorkflowStatus::Completed,
            Outcome::Failed => WorkflowStatus::Failed,
            Outcome::Cancelled => WorkflowStatus::Cancelled,
        };
        state.set_status(final_status).await;

        let snapshot = state.snapshot().await;
        let compiled = result::compile(&snapshot);
        let duration_ms = (compiled.duration * 1000.0) as u64;

        match final_status {
            WorkflowStatus::Completed => {
                tracing::info!("Workflow {} completed", workflow_id);
                self.emit(Event::new(
                    workflow_id,
                    EventType::RunCompleted { duration_ms },
                ))
                .await;
            }
            WorkflowStatus::Failed => {
                let error = snapshot
                    .errors
                    .last()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "required step failed".to_string());
                tracing::error!("Workflow {} failed: {}", workflow_id, error);
                self.emit(Event::new(
                    workflow_id,
                    EventType::RunFailed { error, duration_ms },
                ))
                .await;
            }
            _ => {
                tracing::warn!("Workflow {} cancelled", workflow_id);
                self.emit(Event::new(
                    workflow_id,
                    EventType::RunCancelled {
                        reason: "cancellation requested".to_string(),
                    },
                ))
                .await;
            }
        }

        Ok(compiled)
    }

    /// Declared array order, one at a time, ignoring dependency levels.
    async fn run_sequential(
        &self,
        plan: &ExecutionPlan,
        state: &StateManager,
        cancel: &CancellationToken,
    ) -> Outcome {
        for step in &plan.steps {
            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
            match self.run_step(step, state, cancel, None, None).await {
                StepStatus::Failed if step.required => return Outcome::Failed,
                StepStatus::Cancelled => return Outcome::Cancelled,
                _ => {}
            }
        }
        Outcome::Completed
    }

    /// Level by level; `concurrent` selects the within-level scheduling
    /// policy (parallel vs one-at-a-time).
    async fn run_leveled(
        &self,
        plan: &ExecutionPlan,
        levels: &DependencyLevels,
        state: &StateManager,
        cancel: &CancellationToken,
        concurrent: bool,
    ) -> Outcome {
        for level in levels.levels() {
            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
            let outcome = if concurrent {
                self.run_level_parallel(plan, level, state, cancel).await
            } else {
                self.run_level_sequential(plan, level, state, cancel).await
            };
            if outcome != Outcome::Completed {
                return outcome;
            }
        }
        Outcome::Completed
    }

    async fn run_level_sequential(
        &self,
        plan: &ExecutionPlan,
        level: &[StepId],
        state: &StateManager,
        cancel: &CancellationToken,
    ) -> Outcome {
        for step_id in level {
            let Some(step) = plan.step(step_id) else {
                continue;
            };
            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
            match self.run_step(step, state, cancel, None, None).await {
                StepStatus::Failed if step.required => return Outcome::Failed,
                StepStatus::Cancelled => return Outcome::Cancelled,
                _ => {}
            }
        }
        Outcome::Completed
    }

    /// Dispatch one level concurrently, bounded by `max_parallel`, and
    /// suspend at the barrier until every step is terminal or the level
    /// timeout fires. A required failure cancels the level's remaining
    /// in-flight steps (best-effort) and fails the run.
    async fn run_level_parallel(
        &self,
        plan: &ExecutionPlan,
        level: &[StepId],
        state: &StateManager,
        cancel: &CancellationToken,
    ) -> Outcome {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let level_cancel = cancel.child_token();

        let mut in_flight = FuturesUnordered::new();
        for step_id in level {
            let Some(step) = plan.step(step_id) else {
                continue;
            };
            let semaphore = semaphore.clone();
            let level_cancel = level_cancel.clone();
            in_flight.push(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    // The level-local semaphore is never closed; if it were,
                    // dispatching anyway would break the concurrency bound.
                    Err(_) => return (step.required, StepStatus::Cancelled),
                };
                let status = self
                    .run_step(step, state, &level_cancel, None, None)
                    .await;
                (step.required, status)
            });
        }

        let deadline = self
            .config
            .level_timeout
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
        let mut timed_out = false;
        let mut level_failed = false;

        loop {
            let item = match deadline {
                Some(deadline) if !timed_out => {
                    tokio::select! {
                        item = in_flight.next() => item,
                        _ = tokio::time::sleep_until(deadline) => {
                            tracing::warn!("Level timed out; cancelling in-flight steps");
                            timed_out = true;
                            level_cancel.cancel();
                            continue;
                        }
                    }
                }
                _ => in_flight.next().await,
            };
            let Some((required, status)) = item else {
                break;
            };
            match status {
                StepStatus::Failed if required => {
                    // Barrier still waits for the rest of the level to
                    // reach a terminal status before the run fails.
                    level_failed = true;
                    level_cancel.cancel();
                }
                StepStatus::Cancelled if required && timed_out => {
                    level_failed = true;
                }
                _ => {}
            }
        }

        if cancel.is_cancelled() {
            Outcome::Cancelled
        } else if level_failed {
            Outcome::Failed
        } else {
            Outcome::Completed
        }
    }

    /// Non-loop steps run sequentially in declared order; the loop body runs
    /// per the plan's loop descriptor when first reached.
    async fn run_loop(
        &self,
        plan: &ExecutionPlan,
        state: &StateManager,
        cancel: &CancellationToken,
    ) -> Outcome {
        let Some(spec) = &plan.loop_spec else {
            // Unreachable past validation
            return Outcome::Completed;
        };
        let body: Vec<&AgentStep> = plan
            .steps
            .iter()
            .filter(|s| spec.steps.contains(&s.step_id))
            .collect();

        let mut loop_ran = false;
        for step in &plan.steps {
            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
            if spec.steps.contains(&step.step_id) {
                if !loop_ran {
                    loop_ran = true;
                    let outcome = self.run_loop_body(spec, &body, state, cancel).await;
                    if outcome != Outcome::Completed {
                        return outcome;
                    }
                }
                continue;
            }
            match self.run_step(step, state, cancel, None, None).await {
                StepStatus::Failed if step.required => return Outcome::Failed,
                StepStatus::Cancelled => return Outcome::Cancelled,
                _ => {}
            }
        }
        Outcome::Completed
    }

    async fn run_loop_body(
        &self,
        spec: &LoopSpec,
        body: &[&AgentStep],
        state: &StateManager,
        cancel: &CancellationToken,
    ) -> Outcome {
        match &spec.kind {
            LoopKind::ForEach { items } => {
                let cap = self.config.max_loop_iterations as usize;
                for (index, item) in items.iter().enumerate().take(cap) {
                    if cancel.is_cancelled() {
                        return Outcome::Cancelled;
                    }
                    let mut iteration_vars = serde_json::Map::new();
                    iteration_vars.insert("item".to_string(), item.clone());
                    iteration_vars.insert("index".to_string(), json!(index));

                    let child = state.child_scope();
                    let outcome = self
                        .run_iteration(body, state, &child, cancel, index, &iteration_vars)
                        .await;
                    if outcome != Outcome::Completed {
                        return outcome;
                    }
                }
                Outcome::Completed
            }
            LoopKind::While {
                condition: expr,
                max_iterations,
            } => {
                let cap = (*max_iterations).min(self.config.max_loop_iterations);
                let mut index: u32 = 0;
                let mut last_body: Option<Value> = None;
                while index < cap {
                    if cancel.is_cancelled() {
                        return Outcome::Cancelled;
                    }

                    let mut scope = state.condition_scope().await;
                    if let Value::Object(map) = &mut scope {
                        // The previous iteration's results stay addressable
                        // under their declared step ids; the merged parent
                        // state only carries the qualified `#<index>` keys.
                        if let Some(Value::Object(body_scope)) = &last_body {
                            for (key, value) in body_scope {
                                map.insert(key.clone(), value.clone());
                            }
                        }
                        map.insert("index".to_string(), json!(index));
                    }
                    match condition::evaluate(expr, &scope) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => match self.config.condition_policy {
                            ConditionPolicy::TreatAsFalse => break,
                            ConditionPolicy::FailStep => {
                                let step_id = body[0].step_id.clone();
                                state
                                    .record_error(ErrorRecord::new(
                                        step_id,
                                        ErrorKind::Condition,
                                        e.to_string(),
                                    ))
                                    .await;
                                return Outcome::Failed;
                            }
                        },
                    }

                    let mut iteration_vars = serde_json::Map::new();
                    iteration_vars.insert("index".to_string(), json!(index));
                    let child = state.child_scope();
                    let outcome = self
                        .run_iteration(body, state, &child, cancel, index as usize, &iteration_vars)
                        .await;
                    last_body = Some(child.condition_scope().await);
                    if outcome != Outcome::Completed {
                        return outcome;
                    }
                    index += 1;
                }
                Outcome::Completed
            }
        }
    }

    /// One loop iteration in the caller's isolated child scope, merged back
    /// into the parent under `step_id#<index>` keys. The caller keeps the
    /// child so a while condition can still read the iteration's results by
    /// their declared ids.
    async fn run_iteration(
        &self,
        body: &[&AgentStep],
        state: &StateManager,
        child: &StateManager,
        cancel: &CancellationToken,
        index: usize,
        iteration_vars: &serde_json::Map<String, Value>,
    ) -> Outcome {
        for step in body {
            if cancel.is_cancelled() {
                state.merge_iteration(child, index).await;
                return Outcome::Cancelled;
            }

            let mut inputs = self.iteration_inputs(step, child, state).await;
            for (key, value) in iteration_vars {
                inputs.insert(key.clone(), value.clone());
            }

            // Gate against parent results, earlier body steps of this
            // iteration, and the iteration variables.
            let mut extra = iteration_vars.clone();
            if let Value::Object(child_scope) = child.condition_scope().await {
                for (key, value) in child_scope {
                    extra.insert(key, value);
                }
            }

            let status = self
                .run_step(step, child, cancel, Some(&extra), Some(inputs))
                .await;
            match status {
                StepStatus::Failed if step.required => {
                    state.merge_iteration(child, index).await;
                    return Outcome::Failed;
                }
                StepStatus::Cancelled => {
                    state.merge_iteration(child, index).await;
                    return Outcome::Cancelled;
                }
                _ => {}
            }
        }

        state.merge_iteration(child, index).await;
        Outcome::Completed
    }

    async fn iteration_inputs(
        &self,
        step: &AgentStep,
        child: &StateManager,
        parent: &StateManager,
    ) -> serde_json::Map<String, Value> {
        let mut inputs = serde_json::Map::new();
        for dep in &step.dependencies {
            let data = match child.result(dep).await {
                Some(result) if result.status == StepStatus::Succeeded => result.data,
                Some(_) => json!({}),
                None => match parent.result(dep).await {
                    Some(result) if result.status == StepStatus::Succeeded => result.data,
                    _ => json!({}),
                },
            };
            inputs.insert(dep.0.clone(), data);
        }
        inputs
    }

    /// Gate, project inputs, execute, and record one step. Returns the
    /// step's terminal status.
    async fn run_step(
        &self,
        step: &AgentStep,
        state: &StateManager,
        cancel: &CancellationToken,
        extra_scope: Option<&serde_json::Map<String, Value>>,
        inputs: Option<serde_json::Map<String, Value>>,
    ) -> StepStatus {
        let workflow_id = state.workflow_id();

        match self.evaluate_gate(step, state, extra_scope).await {
            Gate::Run => {}
            Gate::Skip => {
                tracing::info!("Skipping step {}: condition is false", step.step_id);
                self.emit(Event::new(
                    workflow_id,
                    EventType::StepSkipped {
                        step_id: step.step_id.clone(),
                        reason: "condition evaluated to false".to_string(),
                    },
                ))
                .await;
                state
                    .record_result(TaskResult::skipped(
                        step.step_id.clone(),
                        step.agent_id.clone(),
                    ))
                    .await;
                return StepStatus::Skipped;
            }
            Gate::Fail(record) => {
                tracing::warn!(
                    "Step {} failed to evaluate its condition: {}",
                    step.step_id,
                    record.message
                );
                self.emit(Event::new(
                    workflow_id,
                    EventType::StepFailed {
                        step_id: step.step_id.clone(),
                        error: record.message.clone(),
                        attempt: 0,
                        will_retry: false,
                    },
                ))
                .await;
                state
                    .record_result(unattempted(step, StepStatus::Failed, record))
                    .await;
                return StepStatus::Failed;
            }
        }

        if cancel.is_cancelled() {
            let record = ErrorRecord::new(
                step.step_id.clone(),
                ErrorKind::Cancelled,
                "cancelled before dispatch",
            );
            state
                .record_result(unattempted(step, StepStatus::Cancelled, record))
                .await;
            return StepStatus::Cancelled;
        }

        let inputs = match inputs {
            Some(inputs) => inputs,
            None => state.inputs_for(&step.dependencies).await,
        };
        let result = self
            .step_executor
            .execute(workflow_id, step, inputs, cancel)
            .await;
        let status = result.status;
        state.record_result(result).await;
        status
    }

    async fn evaluate_gate(
        &self,
        step: &AgentStep,
        state: &StateManager,
        extra_scope: Option<&serde_json::Map<String, Value>>,
    ) -> Gate {
        let Some(expr) = &step.condition else {
            return Gate::Run;
        };

        let mut scope = state.condition_scope().await;
        if let (Value::Object(map), Some(extra)) = (&mut scope, extra_scope) {
            for (key, value) in extra {
                map.insert(key.clone(), value.clone());
            }
        }

        match condition::evaluate(expr, &scope) {
            Ok(true) => Gate::Run,
            Ok(false) => Gate::Skip,
            Err(e) => match self.config.condition_policy {
                ConditionPolicy::TreatAsFalse => Gate::Skip,
                ConditionPolicy::FailStep => Gate::Fail(ErrorRecord::new(
                    step.step_id.clone(),
                    ErrorKind::Condition,
                    e.to_string(),
                )),
            },
        }
    }

    async fn emit(&self, event: Event) {
        if let Err(e) = self.event_log.append(event).await {
            tracing::warn!("Failed to append event: {}", e);
        }
    }
}

/// Removes a run from the engine's active map when it ends, including when
/// the owning `execute` future is dropped before completion.
struct ActiveGuard<'a> {
    engine: &'a WorkflowEngine,
    workflow_id: WorkflowId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.engine.active.lock() {
            active.remove(&self.workflow_id);
        }
    }
}

/// Result for a step that never reached the agent boundary
fn unattempted(step: &AgentStep, status: StepStatus, record: ErrorRecord) -> TaskResult {
    TaskResult {
        step_id: step.step_id.clone(),
        status,
        data: Value::Null,
        metadata: TaskMetadata {
            attempts: 0,
            duration_ms: 0,
            agent_id: step.agent_id.clone(),
        },
        errors: Some(vec![record]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvokeError;
    use crate::invoker::InvokeRequest;
    use crate::types::{AgentId, PlanId, StepId};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    /// Replays canned responses keyed by step id and records every call
    struct ScriptedAgent {
        responses: HashMap<String, Value>,
        fail: HashSet<String>,
        calls: StdMutex<Vec<(String, Value)>>,
    }

    impl ScriptedAgent {
        fn new(responses: &[(&str, Value)]) -> Self {
            Self {
                responses: responses
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                fail: HashSet::new(),
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn failing(mut self, steps: &[&str]) -> Self {
            self.fail = steps.iter().map(|s| s.to_string()).collect();
            self
        }

        fn call_order(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _)| id.clone())
                .collect()
        }

        fn inputs_of(&self, step: &str) -> Option<Value> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .find(|(id, _)| id == step)
                .map(|(_, inputs)| inputs.clone())
        }
    }

    #[async_trait]
    impl AgentInvoker for ScriptedAgent {
        async fn invoke(&self, request: InvokeRequest) -> Result<Value, InvokeError> {
            let id = request.context.step_id.0.clone();
            self.calls
                .lock()
                .unwrap()
                .push((id.clone(), Value::Object(request.context.inputs.clone())));
            if self.fail.contains(&id) {
                return Err(InvokeError::Task("scripted failure".into()));
            }
            Ok(self.responses.get(&id).cloned().unwrap_or_else(|| json!({})))
        }
    }

    /// Gated steps rendezvous at a barrier before responding
    struct BarrierAgent {
        barrier: tokio::sync::Barrier,
        gated: HashSet<String>,
        calls: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentInvoker for BarrierAgent {
        async fn invoke(&self, request: InvokeRequest) -> Result<Value, InvokeError> {
            let id = request.context.step_id.0.clone();
            self.calls.lock().unwrap().push(id.clone());
            if self.gated.contains(&id) {
                self.barrier.wait().await;
            }
            Ok(json!({}))
        }
    }

    /// Never responds within any reasonable deadline
    struct StallingAgent;

    #[async_trait]
    impl AgentInvoker for StallingAgent {
        async fn invoke(&self, _request: InvokeRequest) -> Result<Value, InvokeError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!({}))
        }
    }

    /// Echoes the loop item from its input context
    struct ItemEchoAgent;

    #[async_trait]
    impl AgentInvoker for ItemEchoAgent {
        async fn invoke(&self, request: InvokeRequest) -> Result<Value, InvokeError> {
            let item = request
                .context
                .inputs
                .get("item")
                .cloned()
                .unwrap_or(Value::Null);
            Ok(json!({ "value": item }))
        }
    }

    fn step(id: &str, deps: &[&str]) -> AgentStep {
        AgentStep {
            step_id: StepId::new(id),
            agent_id: AgentId::new("agent"),
            task_type: "task".to_string(),
            parameters: serde_json::Map::new(),
            dependencies: deps.iter().map(|d| StepId::new(*d)).collect(),
            condition: None,
            retry_policy: None,
            timeout: None,
            required: true,
        }
    }

    fn plan(strategy: Strategy, steps: Vec<AgentStep>) -> ExecutionPlan {
        ExecutionPlan {
            plan_id: PlanId::new("test-plan"),
            intent: "test".to_string(),
            strategy,
            steps,
            loop_spec: None,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            default_timeout: 5,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_end_to_end_parallel_chain() {
        let agent = Arc::new(ScriptedAgent::new(&[
            ("fetch", json!({"rows": 10})),
            ("analyze", json!({"mean": 5})),
            ("report", json!({"summary": "ok"})),
        ]));
        let engine = WorkflowEngine::new(agent.clone(), config());

        let result = engine
            .execute(&plan(
                Strategy::Parallel,
                vec![
                    step("fetch", &[]),
                    step("analyze", &["fetch"]),
                    step("report", &["analyze"]),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.steps_executed, 3);
        assert_eq!(result.steps_skipped, 0);
        assert!(result.errors.is_empty());
        assert_eq!(result.data[&StepId::new("fetch")], json!({"rows": 10}));
        assert_eq!(result.data[&StepId::new("analyze")], json!({"mean": 5}));
        assert_eq!(result.data[&StepId::new("report")], json!({"summary": "ok"}));

        // Each step saw exactly its declared dependency's output
        assert_eq!(
            agent.inputs_of("analyze").unwrap(),
            json!({"fetch": {"rows": 10}})
        );
        assert_eq!(
            agent.inputs_of("report").unwrap(),
            json!({"analyze": {"mean": 5}})
        );
    }

    #[tokio::test]
    async fn test_sequential_runs_declared_order_ignoring_levels() {
        let agent = Arc::new(ScriptedAgent::new(&[]));
        let engine = WorkflowEngine::new(agent.clone(), config());

        // "report" is declared first even though it depends on "fetch"
        let result = engine
            .execute(&plan(
                Strategy::Sequential,
                vec![step("report", &["fetch"]), step("fetch", &[])],
            ))
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(agent.call_order(), vec!["report", "fetch"]);
        // The not-yet-run dependency projects as empty data
        assert_eq!(agent.inputs_of("report").unwrap(), json!({"fetch": {}}));
    }

    #[tokio::test]
    async fn test_parallel_level_dispatches_concurrently() {
        let agent = Arc::new(BarrierAgent {
            barrier: tokio::sync::Barrier::new(3),
            gated: ["a", "b", "c"].iter().map(|s| s.to_string()).collect(),
            calls: StdMutex::new(Vec::new()),
        });
        let engine = WorkflowEngine::new(agent.clone(), config());

        // a, b, c can only finish if all three are in flight at once; d must wait
        let result = engine
            .execute(&plan(
                Strategy::Parallel,
                vec![
                    step("a", &[]),
                    step("b", &[]),
                    step("c", &[]),
                    step("d", &["a", "b", "c"]),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        let calls = agent.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[3], "d");
    }

    #[tokio::test]
    async fn test_conditional_false_skips_without_failing() {
        let agent = Arc::new(ScriptedAgent::new(&[("fetch", json!({"rows": 10}))]));
        let engine = WorkflowEngine::new(agent.clone(), config());

        let mut publish = step("publish", &["fetch"]);
        publish.condition = Some("fetch.data.rows > 100".to_string());
        let mut notify = step("notify", &["fetch"]);
        notify.condition = Some("fetch.data.rows > 5".to_string());
        let archive = step("archive", &["publish"]);

        let result = engine
            .execute(&plan(
                Strategy::Conditional,
                vec![step("fetch", &[]), publish, notify, archive],
            ))
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.steps_skipped, 1);
        assert_eq!(result.steps_executed, 3);
        assert!(result.errors.is_empty());
        // The skipped step was never invoked
        assert!(agent.inputs_of("publish").is_none());
        assert!(agent.inputs_of("notify").is_some());
        // Its dependent treats it as satisfied with empty data
        assert_eq!(agent.inputs_of("archive").unwrap(), json!({"publish": {}}));
    }

    #[tokio::test]
    async fn test_required_failure_aborts_later_levels() {
        let agent = Arc::new(ScriptedAgent::new(&[]).failing(&["extract"]));
        let engine = WorkflowEngine::new(agent.clone(), config());

        let result = engine
            .execute(&plan(
                Strategy::Parallel,
                vec![step("extract", &[]), step("load", &["extract"])],
            ))
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(!result.errors.is_empty());
        assert_eq!(result.errors[0].error_kind, ErrorKind::TaskFailed);
        // The dependent level was never dispatched, so it has no result entry
        assert!(agent.inputs_of("load").is_none());
        assert_eq!(result.steps_executed, 1);
    }

    #[tokio::test]
    async fn test_optional_failure_records_and_continues() {
        let agent = Arc::new(ScriptedAgent::new(&[]).failing(&["advisory"]));
        let engine = WorkflowEngine::new(agent.clone(), config());

        let mut advisory = step("advisory", &[]);
        advisory.required = false;

        let result = engine
            .execute(&plan(
                Strategy::Sequential,
                vec![advisory, step("main", &[])],
            ))
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.errors.len(), 1);
        assert!(agent.inputs_of("main").is_some());
    }

    #[tokio::test]
    async fn test_cancel_marks_in_flight_steps_cancelled() {
        let engine = Arc::new(WorkflowEngine::new(Arc::new(StallingAgent), config()));

        let run = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute(&plan(Strategy::Parallel, vec![step("slow", &[])]))
                    .await
                    .unwrap()
            })
        };

        // Wait for the run to register, then cancel it
        let workflow_id = loop {
            if let Some(id) = engine.active_workflows().first().copied() {
                break id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(engine.cancel(workflow_id));

        let result = run.await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Cancelled);
        assert!(result
            .errors
            .iter()
            .any(|e| e.error_kind == ErrorKind::Cancelled));
        // The run is no longer active, and a second cancel is a no-op
        assert!(!engine.cancel(workflow_id));
    }

    #[tokio::test]
    async fn test_dropped_run_unregisters_from_active() {
        let engine = Arc::new(WorkflowEngine::new(Arc::new(StallingAgent), config()));

        let run = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute(&plan(Strategy::Parallel, vec![step("slow", &[])]))
                    .await
            })
        };

        while engine.active_workflows().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Aborting the task drops the execute future mid-run
        run.abort();
        let _ = run.await;

        assert!(engine.active_workflows().is_empty());
    }

    #[tokio::test]
    async fn test_foreach_loop_qualifies_iteration_results() {
        let engine = WorkflowEngine::new(Arc::new(ItemEchoAgent), config());

        let mut p = plan(Strategy::Loop, vec![step("process", &[])]);
        p.loop_spec = Some(LoopSpec {
            steps: vec![StepId::new("process")],
            kind: LoopKind::ForEach {
                items: vec![json!("alpha"), json!("beta"), json!("gamma")],
            },
        });

        let result = engine.execute(&p).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.steps_executed, 3);
        assert_eq!(
            result.data[&StepId::new("process#0")],
            json!({"value": "alpha"})
        );
        assert_eq!(
            result.data[&StepId::new("process#1")],
            json!({"value": "beta"})
        );
        assert_eq!(
            result.data[&StepId::new("process#2")],
            json!({"value": "gamma"})
        );
    }

    #[tokio::test]
    async fn test_while_loop_stops_when_condition_false() {
        let engine = WorkflowEngine::new(Arc::new(ScriptedAgent::new(&[])), config());

        let mut p = plan(Strategy::Loop, vec![step("tick", &[])]);
        p.loop_spec = Some(LoopSpec {
            steps: vec![StepId::new("tick")],
            kind: LoopKind::While {
                condition: "index < 3".to_string(),
                max_iterations: 10,
            },
        });

        let result = engine.execute(&p).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.steps_executed, 3);
        assert!(result.data.contains_key(&StepId::new("tick#2")));
        assert!(!result.data.contains_key(&StepId::new("tick#3")));
    }

    #[tokio::test]
    async fn test_while_loop_condition_reads_body_results() {
        // Reports done on the third call
        struct CountdownAgent {
            calls: std::sync::atomic::AtomicU32,
        }

        #[async_trait]
        impl AgentInvoker for CountdownAgent {
            async fn invoke(&self, _request: InvokeRequest) -> Result<Value, InvokeError> {
                let call = self
                    .calls
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                    + 1;
                Ok(json!({ "done": call >= 3 }))
            }
        }

        let engine = WorkflowEngine::new(
            Arc::new(CountdownAgent {
                calls: std::sync::atomic::AtomicU32::new(0),
            }),
            config(),
        );

        let mut p = plan(Strategy::Loop, vec![step("work", &[])]);
        p.loop_spec = Some(LoopSpec {
            steps: vec![StepId::new("work")],
            kind: LoopKind::While {
                condition: "work.data.done != true".to_string(),
                max_iterations: 10,
            },
        });

        let result = engine.execute(&p).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.steps_executed, 3);
        assert_eq!(result.data[&StepId::new("work#2")], json!({"done": true}));
        assert!(!result.data.contains_key(&StepId::new("work#3")));
    }

    #[tokio::test]
    async fn test_while_loop_bounded_by_max_iterations() {
        let engine = WorkflowEngine::new(Arc::new(ScriptedAgent::new(&[])), config());

        let mut p = plan(Strategy::Loop, vec![step("tick", &[])]);
        p.loop_spec = Some(LoopSpec {
            steps: vec![StepId::new("tick")],
            kind: LoopKind::While {
                condition: "true".to_string(),
                max_iterations: 4,
            },
        });

        let result = engine.execute(&p).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.steps_executed, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_timeout_fails_the_run() {
        let mut cfg = config();
        cfg.level_timeout = Some(1);
        let engine = WorkflowEngine::new(Arc::new(StallingAgent), cfg);

        let mut slow = step("slow", &[]);
        slow.timeout = Some(7200);

        let result = engine
            .execute(&plan(Strategy::Parallel, vec![slow]))
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result
            .errors
            .iter()
            .any(|e| e.error_kind == ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_any_invocation() {
        let agent = Arc::new(ScriptedAgent::new(&[]));
        let engine = WorkflowEngine::new(agent.clone(), config());

        let err = engine
            .execute(&plan(
                Strategy::Parallel,
                vec![step("a", &["b"]), step("b", &["a"])],
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::DependencyCycle { .. }));
        assert!(agent.call_order().is_empty());
    }

    #[tokio::test]
    async fn test_condition_error_fails_step_by_default() {
        let engine = WorkflowEngine::new(Arc::new(ScriptedAgent::new(&[])), config());

        let mut broken = step("broken", &[]);
        broken.condition = Some("fetch.data.rows >".to_string());

        let result = engine
            .execute(&plan(Strategy::Sequential, vec![broken]))
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.errors[0].error_kind, ErrorKind::Condition);
    }

    #[tokio::test]
    async fn test_host_wired_event_log_records_run_lifecycle() {
        let log = Arc::new(InMemoryEventLog::new());
        let breakers = Arc::new(CircuitBreakers::new(5, Duration::from_secs(30)));
        let engine = WorkflowEngine::new(Arc::new(ScriptedAgent::new(&[])), config())
            .with_event_log(log.clone())
            .with_breakers(breakers.clone());
        assert!(Arc::ptr_eq(&engine.breakers(), &breakers));

        let result = engine
            .execute(&plan(Strategy::Sequential, vec![step("only", &[])]))
            .await
            .unwrap();

        let events = log.events_for(result.workflow_id).await.unwrap();
        assert!(matches!(events[0].event_type, EventType::RunStarted { .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e.event_type, EventType::StepCompleted { .. })));
        assert!(matches!(
            events.last().unwrap().event_type,
            EventType::RunCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn test_condition_error_policy_treat_as_false() {
        let mut cfg = config();
        cfg.condition_policy = ConditionPolicy::TreatAsFalse;
        let engine = WorkflowEngine::new(Arc::new(ScriptedAgent::new(&[])), cfg);

        let mut broken = step("broken", &[]);
        broken.condition = Some("fetch.data.rows >".to_string());

        let result = engine
            .execute(&plan(Strategy::Sequential, vec![broken]))
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.steps_skipped, 1);
    }
}
