pub mod context;
pub mod dsl;
pub mod executor;
pub mod handler;
pub mod handlers;
pub mod lifecycle;
pub mod run_log;
pub mod variables;

pub use context::ExecutionContext;
pub use executor::{GraphExecutor, GraphRunResult, NodeRecord, RunOptions, RunOutcome};
pub use handler::{Collaborators, HandlerRegistry, NodeExecutionResult, NodeHandler};
pub use lifecycle::WorkflowEngine;
pub use run_log::RunLogger;
