// Execution Engine Module
// Dependency graphs, scheduling strategies, chain construction and the chain runtime

pub mod chain;
pub mod context;
pub mod dataflow;
pub mod events;
pub mod executor;
pub mod graph;
pub mod runtime;
pub mod strategy;

// Re-export key types
pub use chain::{ChainBuilder, ToolChain, ToolChainStep};
pub use context::ExecutionContext;
pub use dataflow::{resolve_mapping, PriorResults, ResolutionWarning};
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressSender};
pub use executor::{PlanExecutor, PlanRun, PreparedRun};
pub use graph::{extract_dependencies, DependencyGraph, GraphError, GraphErrorKind};
pub use runtime::{
    ChainResult, ChainRuntime, DecisionHook, GroupedChainRuntime, StepResult, StepStatus,
    ToolCall, ToolError, ToolHandler, ToolHandlerRegistry,
};
pub use strategy::{
    create_execution_groups, determine_strategy, topological_order, ExecutionPlanTrace,
    ExecutionStrategy,
};
