// Plan Executor
// Runs the graph -> strategy -> chain -> runtime sequence for one plan

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::chain::{ChainBuilder, ToolChain};
use crate::execution::context::ExecutionContext;
use crate::execution::graph::extract_dependencies;
use crate::execution::runtime::{ChainResult, ChainRuntime};
use crate::execution::strategy::{
    create_execution_groups, determine_strategy, ExecutionGroups, ExecutionPlanTrace,
    ExecutionStrategy,
};
use crate::plan::models::{Plan, ToolDependency};
use crate::plan::validator::PlanValidator;
use crate::registry::ToolInfoProvider;

use std::sync::Arc;

/// Everything decided before any tool runs
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub dependencies: Vec<ToolDependency>,
    pub strategy: ExecutionStrategy,
    pub groups: ExecutionGroups,
    pub plan_trace: ExecutionPlanTrace,
    pub chain: ToolChain,
}

/// A prepared run plus what the runtime returned
#[derive(Debug, Clone)]
pub struct PlanRun {
    pub prepared: PreparedRun,
    pub chain_result: ChainResult,
}

/// Drives one plan through scheduling and execution
pub struct PlanExecutor {
    config: EngineConfig,
    runtime: Arc<dyn ChainRuntime>,
    tool_info: Option<Arc<dyn ToolInfoProvider>>,
}

impl PlanExecutor {
    pub fn new(config: EngineConfig, runtime: Arc<dyn ChainRuntime>) -> Self {
        Self {
            config,
            runtime,
            tool_info: None,
        }
    }

    /// Set the tool registry consulted by dependency inference
    pub fn with_tool_info(mut self, tool_info: Arc<dyn ToolInfoProvider>) -> Self {
        self.tool_info = Some(tool_info);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tool_info(&self) -> Option<&dyn ToolInfoProvider> {
        self.tool_info.as_deref()
    }

    /// Build the schedule and chain. Structural errors surface here, before execution.
    pub fn prepare(&self, plan: &Plan, ctx: &ExecutionContext) -> EngineResult<PreparedRun> {
        let dependencies = extract_dependencies(plan, self.tool_info.as_deref());

        PlanValidator::validate(plan, &dependencies).map_err(EngineError::Validation)?;

        let strategy = determine_strategy(&dependencies);
        let groups = create_execution_groups(&dependencies, strategy)?;
        let plan_trace = ExecutionPlanTrace::build(plan, &dependencies, strategy, &groups);
        let chain = ChainBuilder::new(&self.config).build(
            plan,
            &dependencies,
            &plan_trace,
            &ctx.tenant_id,
        );

        tracing::info!(
            trace_id = %ctx.trace_id,
            strategy = %strategy,
            groups = groups.len(),
            tools = dependencies.len(),
            "prepared execution plan"
        );

        Ok(PreparedRun {
            dependencies,
            strategy,
            groups,
            plan_trace,
            chain,
        })
    }

    /// Prepare and run through the chain runtime
    pub async fn execute(&self, plan: &Plan, ctx: &ExecutionContext) -> EngineResult<PlanRun> {
        let prepared = self.prepare(plan, ctx)?;
        let chain_result = self
            .runtime
            .execute_chain(&prepared.chain, ctx, &prepared.plan_trace)
            .await?;

        Ok(PlanRun {
            prepared,
            chain_result,
        })
    }
}
