use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use super::breaker::{BreakerState, CircuitBreakers};
use crate::error::{ErrorKind, ErrorRecord, InvokeError};
use crate::events::{Event, EventLog, EventType};
use crate::invoker::{AgentInvoker, InvokeRequest, StepContext};
use crate::types::{
    AgentStep, RetryPolicy, StepStatus, TaskMetadata, TaskResult, WorkflowId,
};

/// Runs one step with circuit-breaker, timeout, and retry policy.
///
/// Never returns an error to the engine: every failure mode is classified
/// and folded into the returned `TaskResult`.
pub struct StepExecutor {
    invoker: Arc<dyn AgentInvoker>,
    breakers: Arc<CircuitBreakers>,
    event_log: Arc<dyn EventLog>,
    default_timeout: Duration,
    default_retry: RetryPolicy,
}

impl StepExecutor {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        breakers: Arc<CircuitBreakers>,
        event_log: Arc<dyn EventLog>,
        default_timeout: Duration,
        default_retry: RetryPolicy,
    ) -> Self {
        Self {
            invoker,
            breakers,
            event_log,
            default_timeout,
            default_retry,
        }
    }

    pub async fn execute(
        &self,
        workflow_id: WorkflowId,
        step: &AgentStep,
        inputs: serde_json::Map<String, serde_json::Value>,
        cancel: &CancellationToken,
    ) -> TaskResult {
        let policy = step
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.default_retry.clone());
        let step_timeout = step
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let started = Instant::now();
        let mut attempts: u32 = 0;
        let mut errors: Vec<ErrorRecord> = Vec::new();

        loop {
            // Breaker gate: fails fast, is never retried, and does not itself
            // count as an agent failure.
            if !self.breakers.check(&step.agent_id) {
                let message = format!("circuit open for agent '{}'", step.agent_id);
                tracing::warn!("Step {} rejected: {}", step.step_id, message);
                errors.push(ErrorRecord::new(
                    step.step_id.clone(),
                    ErrorKind::CircuitOpen,
                    message.clone(),
                ));
                self.emit(Event::new(
                    workflow_id,
                    EventType::StepFailed {
                        step_id: step.step_id.clone(),
                        error: message,
                        attempt: attempts,
                        will_retry: false,
                    },
                ))
                .await;
                return self.finish(step, StepStatus::Failed, serde_json::Value::Null, attempts, started, errors);
            }

            // The gate just admitted this call, so a half-open reading means
            // this attempt is the trial.
            let trial =
                self.breakers.snapshot(&step.agent_id).state == BreakerState::HalfOpen;

            attempts += 1;
            self.emit(Event::new(
                workflow_id,
                EventType::StepStarted {
                    step_id: step.step_id.clone(),
                    attempt: attempts,
                },
            ))
            .await;

            let request = InvokeRequest {
                agent_id: step.agent_id.clone(),
                task_type: step.task_type.clone(),
                parameters: step.parameters.clone(),
                context: StepContext {
                    workflow_id,
                    step_id: step.step_id.clone(),
                    attempt: attempts,
                    inputs: inputs.clone(),
                },
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return self.cancelled(step, attempts, started, errors);
                }
                invoked = timeout(step_timeout, self.invoker.invoke(request)) => {
                    match invoked {
                        Ok(result) => result,
                        Err(_) => Err(InvokeError::Timeout),
                    }
                }
            };

            match outcome {
                Ok(data) => {
                    if self.breakers.record_success(&step.agent_id) {
                        self.emit(Event::new(
                            workflow_id,
                            EventType::BreakerClosed {
                                agent_id: step.agent_id.clone(),
                            },
                        ))
                        .await;
                    }
                    self.emit(Event::new(
                        workflow_id,
                        EventType::StepCompleted {
                            step_id: step.step_id.clone(),
                            attempts,
                            duration_ms: started.elapsed().as_millis() as u64,
                        },
                    ))
                    .await;
                    tracing::info!(
                        "Step {} succeeded after {} attempt(s)",
                        step.step_id,
                        attempts
                    );
                    return self.finish(step, StepStatus::Succeeded, data, attempts, started, errors);
                }
                Err(error) => {
                    let retryable = error.is_retryable();
                    // A half-open trial gets exactly one attempt; retrying
                    // would loop back into a gate that now reads half-open
                    // and the trial would never resolve. Its failure falls
                    // through to record_failure below and re-opens.
                    let will_retry = retryable && !trial && attempts <= policy.max_retries;
                    errors.push(ErrorRecord::new(
                        step.step_id.clone(),
                        error.kind(),
                        error.to_string(),
                    ));
                    self.emit(Event::new(
                        workflow_id,
                        EventType::StepFailed {
                            step_id: step.step_id.clone(),
                            error: error.to_string(),
                            attempt: attempts,
                            will_retry,
                        },
                    ))
                    .await;

                    if !will_retry {
                        // An exhausted transient failure counts against the
                        // agent's breaker; a task-level failure does not.
                        if retryable && self.breakers.record_failure(&step.agent_id) {
                            tracing::warn!("Circuit opened for agent {}", step.agent_id);
                            self.emit(Event::new(
                                workflow_id,
                                EventType::BreakerOpened {
                                    agent_id: step.agent_id.clone(),
                                },
                            ))
                            .await;
                        }
                        tracing::warn!(
                            "Step {} failed after {} attempt(s): {}",
                            step.step_id,
                            attempts,
                            error
                        );
                        return self.finish(step, StepStatus::Failed, serde_json::Value::Null, attempts, started, errors);
                    }

                    let backoff = policy.delay_for(attempts - 1);
                    tracing::info!(
                        "Retrying step {} after {:?} (attempt {})",
                        step.step_id,
                        backoff,
                        attempts + 1
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return self.cancelled(step, attempts, started, errors);
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    fn finish(
        &self,
        step: &AgentStep,
        status: StepStatus,
        data: serde_json::Value,
        attempts: u32,
        started: Instant,
        errors: Vec<ErrorRecord>,
    ) -> TaskResult {
        TaskResult {
            step_id: step.step_id.clone(),
            status,
            data,
            metadata: TaskMetadata {
                attempts,
                duration_ms: started.elapsed().as_millis() as u64,
                agent_id: step.agent_id.clone(),
            },
            errors: if errors.is_empty() { None } else { Some(errors) },
        }
    }

    fn cancelled(
        &self,
        step: &AgentStep,
        attempts: u32,
        started: Instant,
        mut errors: Vec<ErrorRecord>,
    ) -> TaskResult {
        tracing::warn!("Step {} cancelled in flight", step.step_id);
        errors.push(ErrorRecord::new(
            step.step_id.clone(),
            ErrorKind::Cancelled,
            "step cancelled in flight",
        ));
        self.finish(
            step,
            StepStatus::Cancelled,
            serde_json::Value::Null,
            attempts,
            started,
            errors,
        )
    }

    async fn emit(&self, event: Event) {
        if let Err(e) = self.event_log.append(event).await {
            tracing::warn!("Failed to append event: {}", e);
        }
    }
}
