use std::collections::HashMap;

use crate::types::{StepStatus, WorkflowResult, WorkflowState};

/// Compile the final aggregated output from a terminal workflow state.
///
/// `data` carries succeeded steps' payloads keyed by step id; skipped steps
/// contribute to `steps_skipped` but not to `data`. The overall status is
/// whatever terminal status the engine settled on, `completed` only when
/// every required step succeeded or was legitimately skipped.
pub fn compile(state: &WorkflowState) -> WorkflowResult {
    let mut data = HashMap::new();
    let mut steps_executed = 0;
    let mut steps_skipped = 0;

    for (step_id, result) in &state.results {
        match result.status {
            StepStatus::Succeeded => {
                steps_executed += 1;
                data.insert(step_id.clone(), result.data.clone());
            }
            StepStatus::Failed | StepStatus::Cancelled => steps_executed += 1,
            StepStatus::Skipped => steps_skipped += 1,
            StepStatus::Pending | StepStatus::Running => {}
        }
    }

    let duration = match state.end_time {
        Some(end) => (end - state.start_time).num_milliseconds() as f64 / 1000.0,
        None => 0.0,
    };

    WorkflowResult {
        workflow_id: state.workflow_id,
        status: state.status,
        data,
        errors: state.errors.clone(),
        duration,
        steps_executed,
        steps_skipped,
    }
}
