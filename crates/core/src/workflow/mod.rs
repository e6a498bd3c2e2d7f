pub mod breaker;
pub mod condition;
pub mod engine;
pub mod levels;
pub mod result;
pub mod state;
pub mod step_executor;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreakers};
pub use engine::WorkflowEngine;
pub use levels::DependencyLevels;
pub use state::StateManager;
pub use step_executor::StepExecutor;
