// Plan Engine Library
// Plan orchestration: dependency graphs, execution strategies, tool chains and the stage pipeline

pub mod config;
pub mod error;
pub mod execution;
pub mod plan;
pub mod registry;
pub mod stages;
pub mod trace;
pub mod utils;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};

// Re-export plan types
pub use plan::{
    Budget, Intent, ParseError, ParseErrorKind, Plan, PlanParser, PlanRoute, PlanValidator,
    Reference, ToolDependency, ToolKind, ToolSpec, ValidationError,
};

// Re-export execution types
pub use execution::{
    ChainBuilder, ChainResult, ChainRuntime, DependencyGraph, ExecutionContext, ExecutionEvent,
    ExecutionPlanTrace, ExecutionStrategy, GraphError, GroupedChainRuntime, PlanExecutor,
    ProgressSender, StepResult, StepStatus, ToolCall, ToolChain, ToolError, ToolHandler,
    ToolHandlerRegistry,
};

// Re-export registry types
pub use registry::{
    Asset, AssetError, AssetRegistry, InMemoryAssetRegistry, InMemoryToolRegistry, ToolInfo,
    ToolInfoProvider,
};

// Re-export pipeline types
pub use stages::{PipelineRun, PresentationBlock, StageName, StageOutput, StagePipeline};
pub use trace::{JsonFileTraceSink, MemoryTraceSink, RunTrace, TraceSink};
