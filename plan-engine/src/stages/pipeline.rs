// Stage Pipeline
// Runs route_plan -> validate -> execute -> compose -> present and records the run trace

use crate::execution::context::ExecutionContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::executor::PlanExecutor;
use crate::plan::models::PlanRoute;
use crate::registry::AssetRegistry;
use crate::stages::handlers::{
    ComposeHandler, ExecuteHandler, PresentHandler, RoutePlanHandler, RunState, StageHandler,
    ValidateHandler,
};
use crate::stages::models::{StageInput, StageName, StageOutput};
use crate::stages::presentation::PresentationBlock;
use crate::trace::{RunTrace, TraceSink};
use crate::utils::panic_message;

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

/// Outcome of one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub trace: RunTrace,
    pub blocks: Vec<PresentationBlock>,
}

impl PipelineRun {
    pub fn succeeded(&self) -> bool {
        self.trace.failed_stages().is_empty()
    }
}

/// Fixed five-stage pipeline. Every stage runs and is logged, even after a failure.
pub struct StagePipeline {
    handlers: Vec<Arc<dyn StageHandler>>,
    trace_sink: Option<Arc<dyn TraceSink>>,
    event_tx: Option<ProgressSender>,
}

impl StagePipeline {
    pub fn new(executor: Arc<PlanExecutor>, assets: Arc<dyn AssetRegistry>) -> Self {
        let config = Arc::new(executor.config().clone());
        let handlers: Vec<Arc<dyn StageHandler>> = vec![
            Arc::new(RoutePlanHandler::new(config.clone())),
            Arc::new(ValidateHandler::new(assets, executor.clone())),
            Arc::new(ExecuteHandler::new(executor)),
            Arc::new(ComposeHandler),
            Arc::new(PresentHandler::new(config)),
        ];
        Self {
            handlers,
            trace_sink: None,
            event_tx: None,
        }
    }

    /// Replace the handler for the stage it declares
    pub fn with_handler(mut self, handler: Arc<dyn StageHandler>) -> Self {
        let stage = handler.stage();
        if let Some(slot) = self.handlers.iter_mut().find(|h| h.stage() == stage) {
            *slot = handler;
        }
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Run all five stages for a routing decision
    pub async fn run(&self, route: PlanRoute, ctx: &ExecutionContext) -> PipelineRun {
        let started_at = Utc::now();
        let started = Instant::now();
        let route_kind = route.kind().to_string();
        let mut state = RunState::new(route);
        let mut stage_inputs = Vec::with_capacity(self.handlers.len());
        let mut stage_outputs = Vec::with_capacity(self.handlers.len());

        tracing::info!(
            trace_id = %ctx.trace_id,
            tenant_id = %ctx.tenant_id,
            route = %route_kind,
            test_mode = ctx.test_mode,
            "pipeline started"
        );

        for handler in &self.handlers {
            let stage = handler.stage();
            let input = stage_input(stage, &state, ctx);

            self.event_tx.send_event(ExecutionEvent::StageStarted {
                stage: stage.to_string(),
            });
            let stage_started = Instant::now();

            let mut output = run_stage(handler.as_ref(), ctx, &input, &mut state).await;
            output.applied_assets = state.assets_for(stage);

            let ok = output.diagnostics.is_ok();
            tracing::info!(
                trace_id = %ctx.trace_id,
                stage = %stage,
                ok,
                warnings = output.diagnostics.warnings.len(),
                duration_ms = output.duration_ms,
                "stage completed"
            );
            self.event_tx.send_event(ExecutionEvent::stage_completed(
                stage.as_str(),
                ok,
                stage_started.elapsed(),
            ));

            stage_inputs.push(input);
            stage_outputs.push(output);
        }

        let trace = RunTrace {
            trace_id: ctx.trace_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            test_mode: ctx.test_mode,
            route_kind,
            started_at,
            finished_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            applied_assets: state.applied_assets.clone(),
            execution_plan: state
                .plan_run
                .as_ref()
                .map(|run| run.prepared.plan_trace.clone()),
            stage_inputs,
            stage_outputs,
        };

        tracing::info!(
            trace_id = %trace.trace_id,
            duration_ms = trace.duration_ms,
            failed_stages = trace.failed_stages().len(),
            "pipeline finished"
        );

        if let Some(sink) = &self.trace_sink {
            sink.emit(&trace);
        }

        PipelineRun {
            trace,
            blocks: state.blocks,
        }
    }
}

/// Run one handler, turning errors and panics into an error-status output
pub async fn run_stage(
    handler: &dyn StageHandler,
    ctx: &ExecutionContext,
    input: &StageInput,
    state: &mut RunState,
) -> StageOutput {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(handler.handle(ctx, input, state))
        .catch_unwind()
        .await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(payload)) => StageOutput::from_payload(input, payload, duration_ms),
        Ok(Err(e)) => {
            tracing::warn!(trace_id = %ctx.trace_id, stage = %input.stage, error = %e, "stage failed");
            StageOutput::failed(input, e.to_string(), duration_ms)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(trace_id = %ctx.trace_id, stage = %input.stage, panic = %message, "stage panicked");
            StageOutput::failed(input, format!("stage panicked: {}", message), duration_ms)
        }
    }
}

fn stage_input(stage: StageName, state: &RunState, ctx: &ExecutionContext) -> StageInput {
    let intent = state
        .intent()
        .map(|i| json!(i))
        .unwrap_or(Value::Null);

    let input = StageInput::new(stage).with_assets(state.assets_for(stage));
    match stage {
        StageName::RoutePlan => input
            .with_param("route_kind", json!(state.route.kind()))
            .with_param("test_mode", json!(ctx.test_mode)),
        StageName::Validate => input.with_param("route_kind", json!(state.route.kind())),
        StageName::Execute => {
            let tool_ids: Vec<&str> = state
                .route
                .plan()
                .map(|plan| plan.tools.iter().map(|t| t.id.as_str()).collect())
                .unwrap_or_default();
            input
                .with_param("tool_ids", json!(tool_ids))
                .with_param("is_valid", json!(state.is_valid))
        }
        StageName::Compose => input
            .with_param("intent", intent)
            .with_param("step_results", json!(state.execution_results.len())),
        StageName::Present => input
            .with_param("intent", intent)
            .with_param("test_mode", json!(ctx.test_mode)),
    }
}
