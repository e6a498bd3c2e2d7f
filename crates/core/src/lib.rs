// Core engine for Weft workflow orchestration

pub mod error;
pub mod events;
pub mod invoker;
pub mod types;
pub mod workflow;

pub use types::*;

pub use error::{EngineError, ErrorKind, ErrorRecord, InvokeError};
pub use events::{Event, EventLog, EventType, InMemoryEventLog};
pub use invoker::{AgentInvoker, InvokeRequest, StepContext};
pub use workflow::WorkflowEngine;
