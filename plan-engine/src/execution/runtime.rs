// Chain Runtime
// Runtime contract plus the default grouped runtime: fan-out per group, barrier between groups

use crate::error::EngineResult;
use crate::execution::chain::{ToolChain, ToolChainStep};
use crate::execution::context::ExecutionContext;
use crate::execution::dataflow::{resolve_mapping, PriorResults};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::strategy::ExecutionPlanTrace;
use crate::plan::models::{merge_references, Reference, ToolKind};
use crate::utils::{panic_message, truncate_for_log, truncate_json_for_log};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Errors returned by tool handlers; always recovered per step
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("no handler registered for tool kind '{0}'")]
    NoHandler(ToolKind),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("tool failed: {0}")]
    Failed(String),

    #[error("tool panicked: {0}")]
    Panicked(String),
}

/// A single dispatch: static parameters merged with resolved mapped inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub step_id: String,
    pub tool_kind: ToolKind,
    pub parameters: Map<String, Value>,
}

/// Performs one unit of work for a tool kind
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, call: &ToolCall, ctx: &ExecutionContext) -> Result<Value, ToolError>;
}

/// Kind -> handler table, built once at startup
#[derive(Clone, Default)]
pub struct ToolHandlerRegistry {
    handlers: HashMap<ToolKind, Arc<dyn ToolHandler>>,
    fallback: Option<Arc<dyn ToolHandler>>,
}

impl ToolHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: ToolKind, handler: Arc<dyn ToolHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Handler used for kinds without a dedicated entry
    pub fn with_fallback(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn get(&self, kind: ToolKind) -> Option<Arc<dyn ToolHandler>> {
        self.handlers
            .get(&kind)
            .or(self.fallback.as_ref())
            .cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Outcome of one chain step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub tool_kind: ToolKind,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub references: Vec<Reference>,
    #[serde(default)]
    pub resolved_inputs: Map<String, Value>,
    pub duration_ms: u64,
}

impl StepResult {
    fn skipped(step: &ToolChainStep, reason: impl Into<String>) -> Self {
        Self {
            step_id: step.step_id.clone(),
            tool_kind: step.tool_kind,
            status: StepStatus::Skipped,
            output: Value::Null,
            error: Some(reason.into()),
            warnings: Vec::new(),
            references: Vec::new(),
            resolved_inputs: Map::new(),
            duration_ms: 0,
        }
    }

    fn failed(step: &ToolChainStep, error: impl Into<String>, warnings: Vec<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            warnings,
            ..Self::skipped(step, error)
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Outcome of a whole chain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainResult {
    pub step_results: Vec<StepResult>,
    pub success: bool,
    pub duration_ms: u64,
}

impl ChainResult {
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }

    /// References from every step, deduplicated in step order
    pub fn references(&self) -> Vec<Reference> {
        let mut merged = Vec::new();
        for result in &self.step_results {
            merge_references(&mut merged, &result.references);
        }
        merged
    }
}

/// Executes a chain; at most one invocation per step per run
#[async_trait]
pub trait ChainRuntime: Send + Sync {
    async fn execute_chain(
        &self,
        chain: &ToolChain,
        ctx: &ExecutionContext,
        plan_trace: &ExecutionPlanTrace,
    ) -> EngineResult<ChainResult>;
}

/// Optional hook consulted before dispatching each step when a plan opts in
#[async_trait]
pub trait DecisionHook: Send + Sync {
    async fn should_execute_next(
        &self,
        tool_id: &str,
        prior_results: &PriorResults,
        question: Option<&str>,
    ) -> Result<bool, ToolError>;
}

/// Pull `references` out of a tool result payload
pub fn extract_references(output: &Value) -> Vec<Reference> {
    output
        .get("references")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Default runtime: groups run in order, steps within a group run concurrently
pub struct GroupedChainRuntime {
    handlers: ToolHandlerRegistry,
    /// Maximum concurrent steps in a group (0 = unlimited)
    max_parallel_steps: usize,
    decision_hook: Option<Arc<dyn DecisionHook>>,
    event_tx: Option<ProgressSender>,
    max_log_value_chars: usize,
}

type StepOutcome = (ToolCall, Vec<String>, Result<Value, ToolError>, Duration);

impl GroupedChainRuntime {
    pub fn new(handlers: ToolHandlerRegistry) -> Self {
        Self {
            handlers,
            max_parallel_steps: 0,
            decision_hook: None,
            event_tx: None,
            max_log_value_chars: 2000,
        }
    }

    pub fn with_max_parallel_steps(mut self, max_parallel_steps: usize) -> Self {
        self.max_parallel_steps = max_parallel_steps;
        self
    }

    pub fn with_decision_hook(mut self, hook: Arc<dyn DecisionHook>) -> Self {
        self.decision_hook = Some(hook);
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_max_log_value_chars(mut self, max: usize) -> Self {
        self.max_log_value_chars = max;
        self
    }

    /// Consulted between groups only, never for the first group. Fail-open: a hook error means proceed
    async fn should_dispatch(
        &self,
        step: &ToolChainStep,
        chain: &ToolChain,
        prior: &PriorResults,
        ctx: &ExecutionContext,
    ) -> bool {
        let Some(hook) = self.decision_hook.as_ref() else {
            return true;
        };
        if !chain.metadata.intermediate_decisions || step.group_index == 0 {
            return true;
        }

        let question = ctx.question().or(chain.metadata.question.as_deref());
        match hook.should_execute_next(&step.step_id, prior, question).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(
                    trace_id = %ctx.trace_id,
                    tool_id = %step.step_id,
                    error = %e,
                    "decision hook failed, proceeding"
                );
                true
            }
        }
    }
}

#[async_trait]
impl ChainRuntime for GroupedChainRuntime {
    async fn execute_chain(
        &self,
        chain: &ToolChain,
        ctx: &ExecutionContext,
        plan_trace: &ExecutionPlanTrace,
    ) -> EngineResult<ChainResult> {
        let started = Instant::now();
        let deadline = chain
            .metadata
            .timeout_seconds
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
        let semaphore = (self.max_parallel_steps > 0)
            .then(|| Arc::new(Semaphore::new(self.max_parallel_steps)));

        let groups = chain.groups();
        tracing::info!(
            trace_id = %ctx.trace_id,
            chain_id = %chain.chain_id,
            strategy = %plan_trace.strategy,
            groups = groups.len(),
            steps = chain.steps.len(),
            "executing tool chain"
        );
        self.event_tx.send_event(ExecutionEvent::chain_started(
            &chain.chain_id,
            &chain.execution_mode,
            groups.len(),
            chain.steps.len(),
        ));

        let mut prior = PriorResults::new();
        let mut results: Vec<StepResult> = Vec::with_capacity(chain.steps.len());
        let mut timed_out = false;

        for (group_index, group) in groups.into_iter().enumerate() {
            if timed_out {
                for step in group {
                    self.event_tx
                        .send_event(ExecutionEvent::step_skipped(&step.step_id, "deadline exceeded"));
                    results.push(StepResult::skipped(step, "chain deadline exceeded"));
                }
                continue;
            }

            let group_started = Instant::now();
            self.event_tx.send_event(ExecutionEvent::GroupStarted {
                group_index,
                tools: group.iter().map(|s| s.step_id.clone()).collect(),
            });

            let mut join_set: JoinSet<StepOutcome> = JoinSet::new();
            let mut pending: HashSet<String> = HashSet::new();

            for step in &group {
                if !self.should_dispatch(step, chain, &prior, ctx).await {
                    tracing::info!(
                        trace_id = %ctx.trace_id,
                        tool_id = %step.step_id,
                        "decision hook declined step"
                    );
                    self.event_tx
                        .send_event(ExecutionEvent::step_skipped(&step.step_id, "declined"));
                    results.push(StepResult::skipped(step, "declined by decision hook"));
                    continue;
                }

                // Resolved against earlier groups only
                let resolved = resolve_mapping(&step.output_mapping, &prior);
                let warnings: Vec<String> =
                    resolved.warnings.iter().map(|w| w.to_string()).collect();
                for warning in &warnings {
                    self.event_tx
                        .send_event(ExecutionEvent::warning(warning, Some(step.step_id.clone())));
                }

                let mut parameters = step.parameters.clone();
                parameters.extend(resolved.values);
                let call = ToolCall {
                    step_id: step.step_id.clone(),
                    tool_kind: step.tool_kind,
                    parameters,
                };

                let Some(handler) = self.handlers.get(step.tool_kind) else {
                    let err = ToolError::NoHandler(step.tool_kind);
                    tracing::warn!(
                        trace_id = %ctx.trace_id,
                        tool_id = %step.step_id,
                        tool_kind = %step.tool_kind,
                        "{}", err
                    );
                    let mut failed = StepResult::failed(step, err.to_string(), warnings);
                    failed.resolved_inputs = call.parameters;
                    results.push(failed);
                    continue;
                };

                let params = truncate_json_for_log(
                    &serde_json::Value::Object(call.parameters.clone()),
                    self.max_log_value_chars,
                );
                tracing::debug!(
                    trace_id = %ctx.trace_id,
                    tool_id = %step.step_id,
                    group_index,
                    params = %params,
                    "dispatching step"
                );
                self.event_tx.send_event(ExecutionEvent::step_started(
                    &step.step_id,
                    step.tool_kind,
                    group_index,
                ));

                pending.insert(step.step_id.clone());
                let task_ctx = ctx.clone();
                let permits = semaphore.clone();
                join_set.spawn(async move {
                    let _permit = match permits {
                        Some(semaphore) => semaphore.acquire_owned().await.ok(),
                        None => None,
                    };
                    let step_started = Instant::now();
                    let outcome = AssertUnwindSafe(handler.call(&call, &task_ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| {
                            Err(ToolError::Panicked(panic_message(payload.as_ref())))
                        });
                    (call, warnings, outcome, step_started.elapsed())
                });
            }

            // Barrier: wait for every step of this group
            let mut group_outputs: Vec<(String, Value)> = Vec::new();
            loop {
                let next = match deadline {
                    Some(deadline) => {
                        match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                            Ok(next) => next,
                            Err(_) => {
                                timed_out = true;
                                join_set.abort_all();
                                break;
                            }
                        }
                    }
                    None => join_set.join_next().await,
                };

                let Some(joined) = next else { break };
                let (call, warnings, outcome, elapsed) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        tracing::error!(trace_id = %ctx.trace_id, error = %e, "step task failed to join");
                        continue;
                    }
                };
                pending.remove(&call.step_id);

                let duration_ms = elapsed.as_millis() as u64;
                let mut result = StepResult {
                    step_id: call.step_id.clone(),
                    tool_kind: call.tool_kind,
                    status: StepStatus::Succeeded,
                    output: Value::Null,
                    error: None,
                    warnings,
                    references: Vec::new(),
                    resolved_inputs: call.parameters,
                    duration_ms,
                };

                match outcome {
                    Ok(output) => {
                        tracing::info!(
                            trace_id = %ctx.trace_id,
                            tool_id = %call.step_id,
                            tool_kind = %call.tool_kind,
                            group_index,
                            duration_ms,
                            output = %truncate_json_for_log(&output, self.max_log_value_chars),
                            "step succeeded"
                        );
                        result.references = extract_references(&output);
                        group_outputs.push((call.step_id.clone(), output.clone()));
                        result.output = output;
                    }
                    Err(e) => {
                        let message = e.to_string();
                        tracing::warn!(
                            trace_id = %ctx.trace_id,
                            tool_id = %call.step_id,
                            tool_kind = %call.tool_kind,
                            group_index,
                            error = %truncate_for_log(&message, self.max_log_value_chars),
                            "step failed"
                        );
                        result.status = StepStatus::Failed;
                        result.error = Some(message);
                    }
                }

                self.event_tx.send_event(ExecutionEvent::step_completed(
                    &result.step_id,
                    result.succeeded(),
                    elapsed,
                ));
                results.push(result);
            }

            // Steps still pending were cut off by the deadline or lost to a join error
            for step in group.iter().filter(|s| pending.contains(&s.step_id)) {
                let reason = if timed_out {
                    "step did not finish before the chain deadline"
                } else {
                    "step task was cancelled"
                };
                results.push(StepResult::failed(step, reason, Vec::new()));
            }

            prior.extend(group_outputs);
            self.event_tx.send_event(ExecutionEvent::GroupCompleted {
                group_index,
                duration: group_started.elapsed(),
            });
        }

        // Report in chain order regardless of completion order
        let order: HashMap<&str, usize> = chain
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_id.as_str(), i))
            .collect();
        results.sort_by_key(|r| order.get(r.step_id.as_str()).copied().unwrap_or(usize::MAX));

        let success = !timed_out && results.iter().all(|r| r.status != StepStatus::Failed);
        let duration = started.elapsed();
        tracing::info!(
            trace_id = %ctx.trace_id,
            chain_id = %chain.chain_id,
            success,
            duration_ms = duration.as_millis() as u64,
            "tool chain finished"
        );
        self.event_tx
            .send_event(ExecutionEvent::chain_completed(&chain.chain_id, success, duration));

        Ok(ChainResult {
            step_results: results,
            success,
            duration_ms: duration.as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::execution::chain::ChainBuilder;
    use crate::execution::events::progress_channel;
    use crate::execution::strategy::{create_execution_groups, determine_strategy};
    use crate::plan::models::{
        AggregateSpec, Budget, Intent, LookupSpec, Plan, ToolDependency, ToolSpec,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns canned output per step id and records the calls it saw
    struct ScriptedHandler {
        outputs: HashMap<String, Value>,
        calls: Mutex<Vec<ToolCall>>,
    }

    impl ScriptedHandler {
        fn new(outputs: &[(&str, Value)]) -> Arc<Self> {
            Arc::new(Self {
                outputs: outputs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ToolHandler for ScriptedHandler {
        async fn call(&self, call: &ToolCall, _ctx: &ExecutionContext) -> Result<Value, ToolError> {
            self.calls.lock().unwrap().push(call.clone());
            match self.outputs.get(&call.step_id) {
                Some(Value::String(s)) if s == "panic" => panic!("handler exploded"),
                Some(Value::String(s)) if s == "sleep" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Value::Null)
                }
                Some(output) => Ok(output.clone()),
                None => Err(ToolError::Failed(format!("no data for {}", call.step_id))),
            }
        }
    }

    fn lookup() -> ToolSpec {
        ToolSpec::Lookup(LookupSpec {
            keywords: vec!["prod".to_string()],
            ..Default::default()
        })
    }

    fn aggregate() -> ToolSpec {
        ToolSpec::Aggregate(AggregateSpec {
            group_by: vec!["ci_type".to_string()],
            ..Default::default()
        })
    }

    fn chain_for(plan: &Plan, deps: &[ToolDependency]) -> (ToolChain, ExecutionPlanTrace) {
        let strategy = determine_strategy(deps);
        let groups = create_execution_groups(deps, strategy).unwrap();
        let trace = ExecutionPlanTrace::build(plan, deps, strategy, &groups);
        let config = EngineConfig::default();
        let chain = ChainBuilder::new(&config).build(plan, deps, &trace, "tenant");
        (chain, trace)
    }

    fn serial_plan() -> (Plan, Vec<ToolDependency>) {
        let plan = Plan::new(Intent::Aggregate)
            .with_tool("primary", lookup())
            .with_tool("aggregate", aggregate());
        let deps = vec![
            ToolDependency::new("primary"),
            ToolDependency::new("aggregate")
                .depends_on(["primary"])
                .with_mapping("ci_type_filter", "{primary.rows[0].ci_type}"),
        ];
        (plan, deps)
    }

    #[tokio::test]
    async fn test_mapping_resolved_from_prior_group() {
        let (plan, deps) = serial_plan();
        let (chain, trace) = chain_for(&plan, &deps);
        let handler = ScriptedHandler::new(&[
            ("primary", json!({"rows": [{"ci_type": "server", "ci_id": "x1"}]})),
            ("aggregate", json!({"rows": [{"ci_type": "server", "count": 3}]})),
        ]);
        let runtime =
            GroupedChainRuntime::new(ToolHandlerRegistry::new().with_fallback(handler.clone()));

        let result = runtime
            .execute_chain(&chain, &ExecutionContext::new("tenant"), &trace)
            .await
            .unwrap();

        assert!(result.success);
        let aggregate = result.step("aggregate").unwrap();
        assert_eq!(aggregate.resolved_inputs["ci_type_filter"], json!("server"));
        assert_eq!(result.step_results[0].step_id, "primary");
    }

    #[tokio::test]
    async fn test_failed_step_yields_null_downstream() {
        let (plan, deps) = serial_plan();
        let (chain, trace) = chain_for(&plan, &deps);
        let handler = ScriptedHandler::new(&[("aggregate", json!({"rows": []}))]);
        let runtime = GroupedChainRuntime::new(ToolHandlerRegistry::new().with_fallback(handler));

        let result = runtime
            .execute_chain(&chain, &ExecutionContext::new("tenant"), &trace)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.step("primary").unwrap().status, StepStatus::Failed);
        let aggregate = result.step("aggregate").unwrap();
        assert_eq!(aggregate.status, StepStatus::Succeeded);
        assert_eq!(aggregate.resolved_inputs["ci_type_filter"], Value::Null);
        assert_eq!(aggregate.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let plan = Plan::new(Intent::Lookup)
            .with_tool("a", lookup())
            .with_tool("b", lookup());
        let deps = vec![ToolDependency::new("a"), ToolDependency::new("b")];
        let (chain, trace) = chain_for(&plan, &deps);
        let handler = ScriptedHandler::new(&[("a", json!("panic")), ("b", json!({"rows": []}))]);
        let runtime = GroupedChainRuntime::new(ToolHandlerRegistry::new().with_fallback(handler));

        let result = runtime
            .execute_chain(&chain, &ExecutionContext::new("t"), &trace)
            .await
            .unwrap();

        let a = result.step("a").unwrap();
        assert_eq!(a.status, StepStatus::Failed);
        assert!(a.error.as_deref().unwrap().contains("handler exploded"));
        assert!(result.step("b").unwrap().succeeded());
    }

    #[tokio::test]
    async fn test_missing_handler_fails_step_only() {
        let (plan, deps) = serial_plan();
        let (chain, trace) = chain_for(&plan, &deps);
        let handler = ScriptedHandler::new(&[("primary", json!({"rows": []}))]);
        let runtime = GroupedChainRuntime::new(
            ToolHandlerRegistry::new().register(ToolKind::Lookup, handler),
        );

        let result = runtime
            .execute_chain(&chain, &ExecutionContext::new("t"), &trace)
            .await
            .unwrap();

        assert!(result.step("primary").unwrap().succeeded());
        let aggregate = result.step("aggregate").unwrap();
        assert_eq!(aggregate.status, StepStatus::Failed);
        assert!(aggregate.error.as_deref().unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn test_deadline_fails_running_and_skips_later_groups() {
        let (mut plan, deps) = serial_plan();
        plan.budget = Budget {
            timeout_seconds: Some(1),
            ..Budget::default()
        };
        let (chain, trace) = chain_for(&plan, &deps);
        let handler = ScriptedHandler::new(&[("primary", json!("sleep"))]);
        let runtime = GroupedChainRuntime::new(ToolHandlerRegistry::new().with_fallback(handler));

        let result = runtime
            .execute_chain(&chain, &ExecutionContext::new("t"), &trace)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.step("primary").unwrap().status, StepStatus::Failed);
        assert_eq!(result.step("aggregate").unwrap().status, StepStatus::Skipped);
    }

    /// Tracks how many calls are in flight and the order calls start and finish
    #[derive(Default)]
    struct InFlightHandler {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        log: Mutex<Vec<(String, &'static str)>>,
    }

    #[async_trait]
    impl ToolHandler for InFlightHandler {
        async fn call(&self, call: &ToolCall, _ctx: &ExecutionContext) -> Result<Value, ToolError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.log.lock().unwrap().push((call.step_id.clone(), "start"));

            tokio::time::sleep(Duration::from_millis(50)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.log.lock().unwrap().push((call.step_id.clone(), "end"));
            Ok(json!({"rows": []}))
        }
    }

    fn four_wide_plan() -> (Plan, Vec<ToolDependency>) {
        let mut plan = Plan::new(Intent::Lookup);
        let mut deps = Vec::new();
        for id in ["a", "b", "c", "d"] {
            plan = plan.with_tool(id, lookup());
            deps.push(ToolDependency::new(id));
        }
        (plan, deps)
    }

    async fn peak_with_limit(max_parallel_steps: usize) -> usize {
        let (plan, deps) = four_wide_plan();
        let (chain, trace) = chain_for(&plan, &deps);
        let handler = Arc::new(InFlightHandler::default());
        let runtime =
            GroupedChainRuntime::new(ToolHandlerRegistry::new().with_fallback(handler.clone()))
                .with_max_parallel_steps(max_parallel_steps);

        let result = runtime
            .execute_chain(&chain, &ExecutionContext::new("t"), &trace)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.step_results.len(), 4);
        handler.peak.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_group_fans_out_fully_when_unbounded() {
        assert_eq!(peak_with_limit(0).await, 4);
    }

    #[tokio::test]
    async fn test_max_parallel_steps_bounds_concurrency() {
        assert_eq!(peak_with_limit(1).await, 1);
        assert_eq!(peak_with_limit(2).await, 2);
    }

    #[tokio::test]
    async fn test_next_group_waits_for_previous_to_drain() {
        let (mut plan, mut deps) = four_wide_plan();
        plan = plan.with_tool("e", lookup());
        deps.push(ToolDependency::new("e").depends_on(["a", "b"]));
        let (chain, trace) = chain_for(&plan, &deps);
        assert_eq!(trace.strategy, "dag");
        assert_eq!(trace.total_groups, 2);

        let handler = Arc::new(InFlightHandler::default());
        let runtime =
            GroupedChainRuntime::new(ToolHandlerRegistry::new().with_fallback(handler.clone()));
        let result = runtime
            .execute_chain(&chain, &ExecutionContext::new("t"), &trace)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(handler.peak.load(Ordering::SeqCst), 4);

        let log = handler.log.lock().unwrap();
        let e_started = log
            .iter()
            .position(|(id, event)| id == "e" && *event == "start")
            .unwrap();
        let group_zero_ends = log[..e_started]
            .iter()
            .filter(|(_, event)| *event == "end")
            .count();
        assert_eq!(group_zero_ends, 4);
    }

    struct CountingHook {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl DecisionHook for CountingHook {
        async fn should_execute_next(
            &self,
            tool_id: &str,
            _prior: &PriorResults,
            _question: Option<&str>,
        ) -> Result<bool, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ToolError::Failed("model unavailable".to_string()));
            }
            Ok(tool_id != "aggregate")
        }
    }

    #[tokio::test]
    async fn test_decision_hook_can_decline_and_fails_open() {
        let (mut plan, deps) = serial_plan();
        plan.intermediate_decisions = true;
        let (chain, trace) = chain_for(&plan, &deps);
        let outputs = [
            ("primary", json!({"rows": [{"ci_type": "server"}]})),
            ("aggregate", json!({"rows": []})),
        ];

        let hook = Arc::new(CountingHook {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let runtime = GroupedChainRuntime::new(
            ToolHandlerRegistry::new().with_fallback(ScriptedHandler::new(&outputs)),
        )
        .with_decision_hook(hook.clone());
        let result = runtime
            .execute_chain(&chain, &ExecutionContext::new("t"), &trace)
            .await
            .unwrap();
        // consulted before the second group only
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
        assert!(result.step("primary").unwrap().succeeded());
        assert_eq!(result.step("aggregate").unwrap().status, StepStatus::Skipped);
        assert!(result.success);

        let failing = Arc::new(CountingHook {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let runtime = GroupedChainRuntime::new(
            ToolHandlerRegistry::new().with_fallback(ScriptedHandler::new(&outputs)),
        )
        .with_decision_hook(failing.clone());
        let result = runtime
            .execute_chain(&chain, &ExecutionContext::new("t"), &trace)
            .await
            .unwrap();
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert!(result.step("aggregate").unwrap().succeeded());
    }

    #[tokio::test]
    async fn test_references_extracted_and_events_sent() {
        let plan = Plan::new(Intent::Lookup).with_tool("primary", lookup());
        let deps = vec![ToolDependency::new("primary")];
        let (chain, trace) = chain_for(&plan, &deps);
        let handler = ScriptedHandler::new(&[(
            "primary",
            json!({"rows": [], "references": [{"kind": "ci", "title": "web-01"}, {"bad": true}]}),
        )]);
        let (tx, mut rx) = progress_channel();
        let runtime = GroupedChainRuntime::new(ToolHandlerRegistry::new().with_fallback(handler))
            .with_max_parallel_steps(1)
            .with_progress(tx);

        let result = runtime
            .execute_chain(&chain, &ExecutionContext::new("t"), &trace)
            .await
            .unwrap();
        assert_eq!(result.references(), vec![Reference::new("ci", "web-01")]);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ExecutionEvent::ChainStarted { total_steps: 1, .. }));
    }
}
