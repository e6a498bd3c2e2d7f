use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

use crate::error::EngineError;
use crate::types::{ExecutionPlan, StepId, Strategy};

/// Leveled ordering of a plan's step graph.
///
/// Level 0 holds the steps with no dependencies; every later level holds the
/// steps whose dependencies are all satisfied by prior levels. Every strategy
/// except `sequential` honors this ordering.
#[derive(Debug)]
pub struct DependencyLevels {
    levels: Vec<Vec<StepId>>,
    dependencies: HashMap<StepId, Vec<StepId>>,
}

impl DependencyLevels {
    /// Validate the plan's step graph and peel it into concurrency levels.
    ///
    /// Rejects duplicate step ids, dangling dependency references, malformed
    /// loop descriptors, and cycles, all before any step executes.
    pub fn analyze(plan: &ExecutionPlan) -> Result<Self, EngineError> {
        let mut graph: DiGraph<StepId, ()> = DiGraph::new();
        let mut indices: HashMap<StepId, NodeIndex> = HashMap::new();

        for step in &plan.steps {
            if indices.contains_key(&step.step_id) {
                return Err(EngineError::Validation(format!(
                    "duplicate step id '{}'",
                    step.step_id
                )));
            }
            let node = graph.add_node(step.step_id.clone());
            indices.insert(step.step_id.clone(), node);
        }

        let mut dependencies: HashMap<StepId, Vec<StepId>> = HashMap::new();
        for step in &plan.steps {
            let step_idx = indices[&step.step_id];
            for dep in &step.dependencies {
                let dep_idx = *indices.get(dep).ok_or_else(|| {
                    EngineError::Validation(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.step_id, dep
                    ))
                })?;
                if dep_idx == step_idx {
                    return Err(EngineError::DependencyCycle {
                        step_id: step.step_id.clone(),
                    });
                }
                // Edge from dependency to dependent (dep -> step)
                graph.add_edge(dep_idx, step_idx, ());
            }
            dependencies.insert(step.step_id.clone(), step.dependencies.clone());
        }

        validate_loop_spec(plan)?;

        // Kahn peeling: collect the zero-in-degree frontier into one level,
        // in declaration order, then remove it and repeat.
        let mut in_degree: HashMap<StepId, usize> = plan
            .steps
            .iter()
            .map(|s| {
                let idx = indices[&s.step_id];
                let count = graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .count();
                (s.step_id.clone(), count)
            })
            .collect();

        let mut resolved: HashSet<StepId> = HashSet::new();
        let mut levels: Vec<Vec<StepId>> = Vec::new();

        while resolved.len() < plan.steps.len() {
            let level: Vec<StepId> = plan
                .steps
                .iter()
                .map(|s| s.step_id.clone())
                .filter(|id| !resolved.contains(id) && in_degree[id] == 0)
                .collect();

            if level.is_empty() {
                // Remaining steps all wait on each other: a cycle. Name the
                // first unresolved step in declaration order.
                let stuck = plan
                    .steps
                    .iter()
                    .map(|s| s.step_id.clone())
                    .find(|id| !resolved.contains(id))
                    .expect("unresolved step must exist");
                return Err(EngineError::DependencyCycle { step_id: stuck });
            }

            for id in &level {
                resolved.insert(id.clone());
                let idx = indices[id];
                for dependent in graph.neighbors_directed(idx, petgraph::Direction::Outgoing) {
                    let dep_id = &graph[dependent];
                    if let Some(count) = in_degree.get_mut(dep_id) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
            levels.push(level);
        }

        Ok(Self {
            levels,
            dependencies,
        })
    }

    pub fn levels(&self) -> &[Vec<StepId>] {
        &self.levels
    }

    /// Declared dependencies of a step (empty slice for unknown ids)
    pub fn dependencies(&self, step_id: &StepId) -> &[StepId] {
        self.dependencies
            .get(step_id)
            .map(|d| d.as_slice())
            .unwrap_or(&[])
    }

    /// Index of the level containing the step
    pub fn level_of(&self, step_id: &StepId) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.contains(step_id))
    }
}

fn validate_loop_spec(plan: &ExecutionPlan) -> Result<(), EngineError> {
    match (&plan.strategy, &plan.loop_spec) {
        (Strategy::Loop, None) => Err(EngineError::Validation(
            "loop strategy requires a loop_spec".to_string(),
        )),
        (Strategy::Loop, Some(spec)) => {
            if spec.steps.is_empty() {
                return Err(EngineError::Validation(
                    "loop_spec names no steps".to_string(),
                ));
            }
            for id in &spec.steps {
                if plan.step(id).is_none() {
                    return Err(EngineError::Validation(format!(
                        "loop_spec names unknown step '{}'",
                        id
                    )));
                }
            }
            Ok(())
        }
        (_, Some(_)) => Err(EngineError::Validation(
            "loop_spec is only valid with the loop strategy".to_string(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentId, AgentStep, PlanId};

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

    fn plan(steps: Vec<AgentStep>) -> ExecutionPlan {
        ExecutionPlan {
            plan_id: PlanId::new("test"),
            intent: "test".to_string(),
            strategy: Strategy::Parallel,
            steps,
            loop_spec: None,
        }
    }

    #[test]
    fn test_independent_steps_form_one_level() {
        let levels =
            DependencyLevels::analyze(&plan(vec![step("a", &[]), step("b", &[]), step("c", &[])]))
                .unwrap();

        assert_eq!(levels.levels().len(), 1);
        assert_eq!(levels.levels()[0].len(), 3);
    }

    #[test]
    fn test_chain_degenerates_to_one_step_per_level() {
        let levels = DependencyLevels::analyze(&plan(vec![
            step("fetch", &[]),
            step("analyze", &["fetch"]),
            step("report", &["analyze"]),
        ]))
        .unwrap();

        assert_eq!(levels.levels().len(), 3);
        assert_eq!(levels.levels()[0], vec![StepId::new("fetch")]);
        assert_eq!(levels.levels()[1], vec![StepId::new("analyze")]);
        assert_eq!(levels.levels()[2], vec![StepId::new("report")]);
    }

    #[test]
    fn test_every_step_lands_after_its_dependencies() {
        let levels = DependencyLevels::analyze(&plan(vec![
            step("a", &[]),
            step("b", &[]),
            step("c", &["a", "b"]),
            step("d", &["c"]),
            step("e", &["a"]),
        ]))
        .unwrap();

        for id in ["a", "b", "c", "d", "e"] {
            let id = StepId::new(id);
            let step_level = levels.level_of(&id).unwrap();
            for dep in levels.dependencies(&id) {
                assert!(
                    levels.level_of(dep).unwrap() < step_level,
                    "{} must be strictly after {}",
                    id,
                    dep
                );
            }
        }
    }

    #[test]
    fn test_two_step_cycle_rejected() {
        let err = DependencyLevels::analyze(&plan(vec![step("a", &["b"]), step("b", &["a"])]))
            .unwrap_err();

        match err {
            EngineError::DependencyCycle { step_id } => {
                assert!(step_id == StepId::new("a") || step_id == StepId::new("b"));
            }
            other => panic!("expected cycle error, got {other}"),
        }
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err = DependencyLevels::analyze(&plan(vec![step("a", &["a"])])).unwrap_err();
        assert!(matches!(err, EngineError::DependencyCycle { .. }));
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let err =
            DependencyLevels::analyze(&plan(vec![step("a", &[]), step("a", &[])])).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let err = DependencyLevels::analyze(&plan(vec![step("a", &["ghost"])])).unwrap_err();
        match err {
            EngineError::Validation(msg) => assert!(msg.contains("ghost")),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_loop_strategy_requires_spec() {
        let mut p = plan(vec![step("a", &[])]);
        p.strategy = Strategy::Loop;
        let err = DependencyLevels::analyze(&p).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
