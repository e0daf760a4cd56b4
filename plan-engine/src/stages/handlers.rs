// Stage Handlers
// The five stage implementations and the run state they share

use crate::config::{EngineConfig, ASSET_MAPPING, ASSET_SCREEN};
use crate::error::EngineResult;
use crate::execution::context::ExecutionContext;
use crate::execution::executor::{PlanExecutor, PlanRun};
use crate::execution::graph::extract_dependencies;
use crate::execution::runtime::{StepResult, StepStatus};
use crate::plan::error::ValidationError;
use crate::plan::models::{merge_references, GraphMode, Intent, PlanRoute, Reference, ToolKind};
use crate::plan::validator::PlanValidator;
use crate::registry::AssetRegistry;
use crate::stages::models::{StageInput, StageName, StagePayload};
use crate::stages::presentation::{build_blocks, result_rows, PresentationBlock};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// State handed from stage to stage within one run
#[derive(Debug)]
pub struct RunState {
    pub route: PlanRoute,
    /// asset_type -> applied asset reference
    pub applied_assets: BTreeMap<String, String>,
    /// Asset types replaced by a test-mode override
    pub overridden_assets: Vec<String>,
    pub is_valid: bool,
    pub validation_errors: Vec<ValidationError>,
    pub plan_run: Option<PlanRun>,
    pub execution_results: Vec<StepResult>,
    pub references: Vec<Reference>,
    pub composed: Value,
    pub blocks: Vec<PresentationBlock>,
}

impl RunState {
    pub fn new(route: PlanRoute) -> Self {
        Self {
            route,
            applied_assets: BTreeMap::new(),
            overridden_assets: Vec::new(),
            is_valid: false,
            validation_errors: Vec::new(),
            plan_run: None,
            execution_results: Vec::new(),
            references: Vec::new(),
            composed: Value::Null,
            blocks: Vec::new(),
        }
    }

    pub fn intent(&self) -> Option<Intent> {
        self.route.plan().and_then(|plan| plan.intent)
    }

    /// Assets recorded against a stage for audit
    pub fn assets_for(&self, stage: StageName) -> BTreeMap<String, String> {
        let only = |asset_type: &str| {
            self.applied_assets
                .iter()
                .filter(|(t, _)| t.as_str() == asset_type)
                .map(|(t, r)| (t.clone(), r.clone()))
                .collect()
        };
        match stage {
            StageName::RoutePlan | StageName::Validate => self.applied_assets.clone(),
            StageName::Execute => BTreeMap::new(),
            StageName::Compose => only(ASSET_MAPPING),
            StageName::Present => only(ASSET_SCREEN),
        }
    }
}

/// One pipeline stage
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> StageName;

    async fn handle(
        &self,
        ctx: &ExecutionContext,
        input: &StageInput,
        state: &mut RunState,
    ) -> EngineResult<StagePayload>;
}

/// Default asset references, with test-mode overrides substituted.
/// Returns the applied map and the asset types that were overridden.
pub fn resolve_applied_assets(
    config: &EngineConfig,
    ctx: &ExecutionContext,
) -> (BTreeMap<String, String>, Vec<String>) {
    let mut applied = BTreeMap::new();
    let mut overridden = Vec::new();

    for (asset_type, default_key) in &config.default_assets {
        let asset_ref = match ctx.asset_override(asset_type, default_key) {
            Some(replacement) => {
                overridden.push(asset_type.clone());
                replacement.to_string()
            }
            None => format!("{}:{}", asset_type, default_key),
        };
        applied.insert(asset_type.clone(), asset_ref);
    }

    (applied, overridden)
}

fn count_rows(value: &Value) -> usize {
    let rows = result_rows(value);
    if !rows.is_empty() {
        return rows.len();
    }
    match value {
        Value::Object(map) if map.contains_key("rows") || map.contains_key("items") => 0,
        Value::Object(map) => usize::from(!map.is_empty()),
        Value::Null => 0,
        _ => 1,
    }
}

fn validation_error_json(error: &ValidationError) -> Value {
    json!({
        "message": error.message,
        "path": error.path,
        "suggestion": error.suggestion,
    })
}

// =============================================================================
// route_plan
// =============================================================================

/// Passes the routing decision through and fixes the applied assets
pub struct RoutePlanHandler {
    config: Arc<EngineConfig>,
}

impl RoutePlanHandler {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StageHandler for RoutePlanHandler {
    fn stage(&self) -> StageName {
        StageName::RoutePlan
    }

    async fn handle(
        &self,
        ctx: &ExecutionContext,
        _input: &StageInput,
        state: &mut RunState,
    ) -> EngineResult<StagePayload> {
        let (applied, overridden) = resolve_applied_assets(&self.config, ctx);
        state.applied_assets = applied;
        state.overridden_assets = overridden;

        let route = serde_json::to_value(&state.route)?;
        let result_count = usize::from(!matches!(state.route, PlanRoute::Reject { .. }));

        Ok(StagePayload::new(json!({
            "route": route,
            "kind": state.route.kind(),
            "applied_assets": state.applied_assets,
            "overridden_assets": state.overridden_assets,
        }))
        .with_result_count(result_count)
        .with_count("overridden_assets", state.overridden_assets.len()))
    }
}

// =============================================================================
// validate
// =============================================================================

/// Loads every applied asset and checks the plan; never halts the pipeline
pub struct ValidateHandler {
    assets: Arc<dyn AssetRegistry>,
    executor: Arc<PlanExecutor>,
}

impl ValidateHandler {
    pub fn new(assets: Arc<dyn AssetRegistry>, executor: Arc<PlanExecutor>) -> Self {
        Self { assets, executor }
    }
}

#[async_trait]
impl StageHandler for ValidateHandler {
    fn stage(&self) -> StageName {
        StageName::Validate
    }

    async fn handle(
        &self,
        _ctx: &ExecutionContext,
        _input: &StageInput,
        state: &mut RunState,
    ) -> EngineResult<StagePayload> {
        let mut errors: Vec<ValidationError> = Vec::new();
        let mut assets = Map::new();

        for (asset_type, asset_ref) in &state.applied_assets {
            let overridden = state.overridden_assets.contains(asset_type);
            let entry = match self.assets.load_asset(asset_ref).await {
                Ok(asset) => json!({
                    "status": "valid",
                    "overridden": overridden,
                    "asset_ref": asset_ref,
                    "version": asset.version,
                }),
                Err(e) => {
                    errors.push(ValidationError::new(
                        format!("asset '{}' could not be loaded: {}", asset_ref, e),
                        format!("assets.{}", asset_type),
                    ));
                    json!({
                        "status": "invalid",
                        "overridden": overridden,
                        "asset_ref": asset_ref,
                        "error": e.to_string(),
                    })
                }
            };
            assets.insert(asset_type.clone(), entry);
        }

        if let Some(plan) = state.route.plan() {
            errors.extend(PlanValidator::check_plan_shape(plan));
            let deps = extract_dependencies(plan, self.executor.tool_info());
            if let Err(structural) = PlanValidator::validate(plan, &deps) {
                errors.extend(structural);
            }
        }

        state.is_valid = errors.is_empty();
        state.validation_errors = errors;
        let asset_count = assets.len();

        let mut payload = StagePayload::new(json!({
            "is_valid": state.is_valid,
            "validation_errors": state
                .validation_errors
                .iter()
                .map(validation_error_json)
                .collect::<Vec<_>>(),
            "assets": assets,
        }))
        .with_result_count(asset_count)
        .with_count("validation_errors", state.validation_errors.len())
        .with_count("assets", asset_count);

        for error in &state.validation_errors {
            payload = payload.with_warning(error.to_string());
        }
        Ok(payload)
    }
}

// =============================================================================
// execute
// =============================================================================

/// Runs graph -> strategy -> chain -> runtime for the routed plan
pub struct ExecuteHandler {
    executor: Arc<PlanExecutor>,
}

impl ExecuteHandler {
    pub fn new(executor: Arc<PlanExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl StageHandler for ExecuteHandler {
    fn stage(&self) -> StageName {
        StageName::Execute
    }

    async fn handle(
        &self,
        ctx: &ExecutionContext,
        _input: &StageInput,
        state: &mut RunState,
    ) -> EngineResult<StagePayload> {
        let Some(plan) = state.route.plan() else {
            return Ok(StagePayload::new(json!({
                "skipped": true,
                "reason": format!("route kind '{}' runs no tools", state.route.kind()),
                "execution_results": [],
            })));
        };

        let run = self.executor.execute(plan, ctx).await?;
        let results = &run.chain_result.step_results;

        let mut payload = StagePayload::new(Value::Null);
        let (mut succeeded, mut failed, mut skipped) = (0, 0, 0);
        for result in results {
            match result.status {
                StepStatus::Succeeded => succeeded += 1,
                StepStatus::Failed => {
                    failed += 1;
                    payload = payload.with_warning(format!(
                        "tool '{}' failed: {}",
                        result.step_id,
                        result.error.as_deref().unwrap_or("unknown error")
                    ));
                }
                StepStatus::Skipped => skipped += 1,
            }
            for warning in &result.warnings {
                payload = payload.with_warning(format!("{}: {}", result.step_id, warning));
            }
        }

        let references = run.chain_result.references();
        payload.result = json!({
            "strategy": run.prepared.strategy,
            "execution_groups": run.prepared.groups,
            "execution_results": results,
            "success": run.chain_result.success,
        });
        let payload = payload
            .with_result_count(succeeded)
            .with_references(&references)
            .with_count("steps", results.len())
            .with_count("succeeded", succeeded)
            .with_count("failed", failed)
            .with_count("skipped", skipped)
            .with_count("groups", run.prepared.groups.len());

        state.execution_results = results.clone();
        merge_references(&mut state.references, &references);
        state.plan_run = Some(run);

        Ok(payload)
    }
}

// =============================================================================
// compose
// =============================================================================

/// Merges execution results according to the plan's intent
pub struct ComposeHandler;

impl ComposeHandler {
    fn preferred_kinds(intent: Option<Intent>) -> &'static [ToolKind] {
        match intent {
            Some(Intent::Lookup) | None => &[ToolKind::Lookup, ToolKind::SecondaryLookup],
            Some(Intent::Aggregate) => &[ToolKind::Aggregate],
            Some(Intent::Path) => &[ToolKind::GraphExpand],
            Some(Intent::Metric) => &[ToolKind::Metric],
            Some(Intent::History) => &[ToolKind::History],
            Some(Intent::Search) => &[ToolKind::DocumentSearch],
        }
    }
}

#[async_trait]
impl StageHandler for ComposeHandler {
    fn stage(&self) -> StageName {
        StageName::Compose
    }

    async fn handle(
        &self,
        _ctx: &ExecutionContext,
        _input: &StageInput,
        state: &mut RunState,
    ) -> EngineResult<StagePayload> {
        match &state.route {
            PlanRoute::Direct { answer } => {
                state.composed = json!({
                    "primary_result": {"answer": answer},
                    "results_summary": {"route": "direct", "text": answer},
                });
                return Ok(StagePayload::new(state.composed.clone()).with_result_count(1));
            }
            PlanRoute::Reject { reason } => {
                state.composed = json!({
                    "primary_result": null,
                    "rejected": reason,
                    "results_summary": {"route": "reject", "text": format!("Request rejected: {}", reason)},
                });
                return Ok(StagePayload::new(state.composed.clone())
                    .with_warning(format!("request rejected: {}", reason)));
            }
            PlanRoute::Plan { .. } => {}
        }

        let intent = state.intent();
        let succeeded: Vec<&StepResult> = state
            .execution_results
            .iter()
            .filter(|r| r.succeeded())
            .collect();
        let preferred = Self::preferred_kinds(intent);

        let primary = succeeded
            .iter()
            .find(|r| preferred.contains(&r.tool_kind))
            .or_else(|| succeeded.first())
            .copied();

        let path_results: Vec<Value> = if intent == Some(Intent::Path) {
            let graphs: Vec<&StepResult> = succeeded
                .iter()
                .filter(|r| r.tool_kind == ToolKind::GraphExpand)
                .copied()
                .collect();
            let path_mode: Vec<Value> = graphs
                .iter()
                .filter(|r| {
                    r.resolved_inputs.get("mode").and_then(Value::as_str)
                        == Some(GraphMode::Path.as_str())
                })
                .map(|r| r.output.clone())
                .collect();
            if path_mode.is_empty() {
                graphs.iter().map(|r| r.output.clone()).collect()
            } else {
                path_mode
            }
        } else {
            Vec::new()
        };

        let supporting: Map<String, Value> = succeeded
            .iter()
            .filter(|r| Some(r.step_id.as_str()) != primary.map(|p| p.step_id.as_str()))
            .map(|r| (r.step_id.clone(), r.output.clone()))
            .collect();

        let total = state.execution_results.len();
        let failed = state
            .execution_results
            .iter()
            .filter(|r| r.status == StepStatus::Failed)
            .count();
        let primary_value = primary.map(|p| p.output.clone()).unwrap_or(Value::Null);
        let path_count = path_results.len();
        let row_count = count_rows(&primary_value) + path_count;
        let text = if total == 0 {
            "No tools were run".to_string()
        } else {
            format!(
                "{} result rows from {} of {} tools",
                row_count,
                succeeded.len(),
                total
            )
        };

        state.composed = json!({
            "primary_result": primary_value,
            "primary_step": primary.map(|p| p.step_id.clone()),
            "path_results": path_results,
            "supporting_results": supporting,
            "results_summary": {
                "intent": intent,
                "strategy": state.plan_run.as_ref().map(|r| r.prepared.strategy),
                "total_steps": total,
                "succeeded": succeeded.len(),
                "failed": failed,
                "row_count": row_count,
                "text": text,
            },
        });

        let mut payload = StagePayload::new(state.composed.clone())
            .with_result_count(row_count)
            .with_references(&state.references)
            .with_count("rows", row_count)
            .with_count("path_results", path_count);
        if failed > 0 {
            payload = payload.with_warning(format!(
                "{} of {} tools failed; result is partial",
                failed, total
            ));
        }
        Ok(payload)
    }
}

// =============================================================================
// present
// =============================================================================

/// Turns the composed result into presentation blocks
pub struct PresentHandler {
    config: Arc<EngineConfig>,
}

impl PresentHandler {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StageHandler for PresentHandler {
    fn stage(&self) -> StageName {
        StageName::Present
    }

    async fn handle(
        &self,
        ctx: &ExecutionContext,
        _input: &StageInput,
        state: &mut RunState,
    ) -> EngineResult<StagePayload> {
        let mut blocks = match &state.route {
            PlanRoute::Direct { answer } => vec![PresentationBlock::text(answer.clone())],
            PlanRoute::Reject { .. } => Vec::new(),
            PlanRoute::Plan { .. } => build_blocks(state.intent(), &state.composed),
        };
        let block_count = blocks.len();

        // Fallback text is shown but does not count as a result
        if blocks.is_empty() {
            let question = ctx.question().or_else(|| {
                state
                    .route
                    .plan()
                    .and_then(|plan| plan.question.as_deref())
            });
            let text = match (&state.route, question) {
                (PlanRoute::Reject { reason }, _) => format!("Request rejected: {}", reason),
                (_, Some(question)) => format!("No results found for \"{}\"", question),
                _ => "No results found".to_string(),
            };
            blocks.push(PresentationBlock::text(text));
        }

        let mut result = json!({
            "intent": state.intent(),
            "blocks": blocks,
        });

        if ctx.test_mode {
            let baseline = ctx
                .baseline_trace_id
                .clone()
                .or_else(|| self.config.baseline_trace_id.clone());
            if let Some(obj) = result.as_object_mut() {
                obj.insert("compare".to_string(), json!(baseline.is_some()));
                obj.insert("baseline_trace_id".to_string(), json!(baseline));
            }
        }

        let mut payload = StagePayload::new(result)
            .with_block_count(block_count)
            .with_references(&state.references)
            .with_count("blocks", block_count);
        if block_count == 0 {
            payload = payload.with_warning("no presentable results, showing fallback text");
        }

        state.blocks = blocks;
        Ok(payload)
    }
}
