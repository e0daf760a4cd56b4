// Pipeline Integration Tests
// Full five-stage runs against in-memory registries and scripted tool handlers

use async_trait::async_trait;
use plan_engine::execution::events::progress_channel;
use plan_engine::plan::models::{
    AggregateSpec, GraphMode, GraphSpec, LookupSpec, MetricSpec, TimeRange,
};
use plan_engine::stages::models::StageStatus;
use plan_engine::{
    Asset, EngineConfig, EngineResult, ExecutionContext, ExecutionEvent, ExecutionStrategy,
    GroupedChainRuntime, InMemoryAssetRegistry, Intent, MemoryTraceSink, Plan, PlanExecutor,
    PlanParser, PlanRoute, PresentationBlock, StageName, StagePipeline, StepStatus, ToolCall,
    ToolDependency, ToolError, ToolHandler, ToolHandlerRegistry, ToolKind, ToolSpec,
};
use plan_engine::stages::{RunState, StageHandler, StageInput, StagePayload};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Returns canned outputs by step id and records every call
#[derive(Default)]
struct ScriptedHandler {
    outputs: HashMap<String, Value>,
    failing: Vec<String>,
    calls: Mutex<Vec<ToolCall>>,
}

impl ScriptedHandler {
    fn new(outputs: &[(&str, Value)]) -> Self {
        Self {
            outputs: outputs
                .iter()
                .map(|(id, v)| (id.to_string(), v.clone()))
                .collect(),
            ..Default::default()
        }
    }

    fn failing(mut self, step_id: &str) -> Self {
        self.failing.push(step_id.to_string());
        self
    }

    fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolHandler for ScriptedHandler {
    async fn call(&self, call: &ToolCall, _ctx: &ExecutionContext) -> Result<Value, ToolError> {
        self.calls.lock().unwrap().push(call.clone());
        if self.failing.contains(&call.step_id) {
            return Err(ToolError::Failed(format!("{} backend unavailable", call.step_id)));
        }
        Ok(self
            .outputs
            .get(&call.step_id)
            .cloned()
            .unwrap_or_else(|| json!({"rows": []})))
    }
}

async fn build_pipeline(handler: Arc<ScriptedHandler>) -> (StagePipeline, Arc<MemoryTraceSink>) {
    let config = EngineConfig::default();
    let types: Vec<String> = config.default_assets.keys().cloned().collect();
    let assets = InMemoryAssetRegistry::with_defaults(&types).await.unwrap();
    assets
        .publish(Asset::new("prompt:candidate", json!({"template": "v2"})).unwrap())
        .await;

    let runtime = GroupedChainRuntime::new(ToolHandlerRegistry::new().with_fallback(handler));
    let executor = Arc::new(PlanExecutor::new(config, Arc::new(runtime)));
    let sink = Arc::new(MemoryTraceSink::new());
    let pipeline = StagePipeline::new(executor, Arc::new(assets)).with_trace_sink(sink.clone());
    (pipeline, sink)
}

fn lookup_then_aggregate() -> Plan {
    Plan::new(Intent::Aggregate)
        .with_tool(
            "primary",
            ToolSpec::Lookup(LookupSpec {
                keywords: vec!["servers".to_string()],
                ..Default::default()
            }),
        )
        .with_tool(
            "aggregate",
            ToolSpec::Aggregate(AggregateSpec {
                group_by: vec!["ci_type".to_string()],
                metrics: vec!["count".to_string()],
                ..Default::default()
            }),
        )
        .with_dependency(ToolDependency::new("primary"))
        .with_dependency(
            ToolDependency::new("aggregate")
                .depends_on(["primary"])
                .with_mapping("ci_type_filter", "{primary.rows[0].ci_type}"),
        )
}

#[tokio::test]
async fn test_serial_lookup_feeds_aggregate() {
    let handler = Arc::new(ScriptedHandler::new(&[
        ("primary", json!({"rows": [{"ci_type": "server", "ci_id": "web-01"}]})),
        (
            "aggregate",
            json!({"rows": [{"ci_type": "server", "count": 12}]}),
        ),
    ]));
    let (pipeline, sink) = build_pipeline(handler.clone()).await;

    let run = pipeline
        .run(lookup_then_aggregate().into(), &ExecutionContext::new("acme"))
        .await;

    let plan_trace = run.trace.execution_plan.as_ref().unwrap();
    assert_eq!(plan_trace.strategy, ExecutionStrategy::Serial.as_str());
    let groups: Vec<Vec<String>> = plan_trace
        .execution_groups
        .iter()
        .map(|g| g.tools.iter().map(|t| t.tool_id.clone()).collect())
        .collect();
    assert_eq!(groups, vec![vec!["primary"], vec!["aggregate"]]);

    let calls = handler.calls();
    let aggregate = calls.iter().find(|c| c.step_id == "aggregate").unwrap();
    assert_eq!(aggregate.parameters["ci_type_filter"], json!("server"));
    assert_eq!(aggregate.parameters["tenant_id"], json!("acme"));

    assert!(run.succeeded());
    let kinds: Vec<&str> = run.blocks.iter().map(PresentationBlock::kind).collect();
    assert_eq!(kinds, vec!["text", "chart", "table"]);
    assert_eq!(sink.traces().len(), 1);
}

#[tokio::test]
async fn test_dag_converges_after_parallel_group() {
    let handler = Arc::new(ScriptedHandler::new(&[
        ("a", json!({"rows": [{"ci_id": "web-01"}]})),
        ("b", json!({"rows": [{"ci_id": "db-01"}]})),
        (
            "path",
            json!({"nodes": [{"id": "web-01"}, {"id": "db-01"}], "edges": [{"from": "web-01", "to": "db-01"}]}),
        ),
    ]));
    let (pipeline, _) = build_pipeline(handler.clone()).await;

    let plan = Plan::new(Intent::Path)
        .with_tool(
            "a",
            ToolSpec::Lookup(LookupSpec {
                keywords: vec!["web-01".to_string()],
                ..Default::default()
            }),
        )
        .with_tool(
            "b",
            ToolSpec::SecondaryLookup(LookupSpec {
                keywords: vec!["db-01".to_string()],
                ..Default::default()
            }),
        )
        .with_tool(
            "path",
            ToolSpec::GraphExpand(GraphSpec {
                mode: GraphMode::Path,
                depth: 3,
                ..Default::default()
            }),
        )
        .with_dependency(ToolDependency::new("a"))
        .with_dependency(ToolDependency::new("b"))
        .with_dependency(
            ToolDependency::new("path")
                .depends_on(["a", "b"])
                .with_mapping("root_ci_id", "{a.rows[0].ci_id}")
                .with_mapping("target_ci_id", "{b.rows[0].ci_id}"),
        );

    let run = pipeline.run(plan.into(), &ExecutionContext::new("acme")).await;

    let plan_trace = run.trace.execution_plan.as_ref().unwrap();
    assert_eq!(plan_trace.strategy, ExecutionStrategy::Dag.as_str());
    assert_eq!(plan_trace.total_groups, 2);
    assert!(plan_trace.execution_groups[0].parallel_execution);
    assert_eq!(plan_trace.tool("path").unwrap().dependency_groups, vec![0]);

    let calls = handler.calls();
    let path = calls.iter().find(|c| c.step_id == "path").unwrap();
    assert_eq!(path.parameters["root_ci_id"], json!("web-01"));
    assert_eq!(path.parameters["target_ci_id"], json!("db-01"));

    assert!(run.blocks.iter().any(|b| b.kind() == "network"));
}

#[tokio::test]
async fn test_partial_failure_still_presents() {
    let handler = Arc::new(
        ScriptedHandler::new(&[(
            "metric",
            json!({"rows": [{"ts": "10:00", "value": 0.4}, {"ts": "10:05", "value": 0.9}]}),
        )])
        .failing("history"),
    );
    let (pipeline, _) = build_pipeline(handler).await;

    let plan = Plan::new(Intent::Metric)
        .with_tool(
            "metric",
            ToolSpec::Metric(MetricSpec {
                metric_name: "cpu".to_string(),
                ci_id: Some("web-01".to_string()),
                time_range: Some(TimeRange::Relative {
                    last: "1h".to_string(),
                }),
                ..Default::default()
            }),
        )
        .with_tool(
            "history",
            ToolSpec::History(plan_engine::plan::models::HistorySpec {
                event_types: vec!["change".to_string()],
                ci_id: Some("web-01".to_string()),
                ..Default::default()
            }),
        );

    let run = pipeline.run(plan.into(), &ExecutionContext::new("acme")).await;

    let execute = run.trace.stage_output(StageName::Execute).unwrap();
    assert!(execute.diagnostics.is_ok());
    assert_eq!(execute.diagnostics.counts["failed"], 1);
    assert_eq!(execute.diagnostics.counts["succeeded"], 1);
    assert!(execute.diagnostics.warnings[0].contains("history"));

    let results: Vec<StepStatus> = serde_json::from_value::<Vec<plan_engine::StepResult>>(
        execute.result["execution_results"].clone(),
    )
    .unwrap()
    .into_iter()
    .map(|r| r.status)
    .collect();
    assert!(results.contains(&StepStatus::Failed));

    let present = run.trace.stage_output(StageName::Present).unwrap();
    assert!(present.diagnostics.is_ok());
    assert!(!present.diagnostics.result_empty());
    assert!(run.blocks.iter().any(|b| b.kind() == "chart"));
}

struct FailingValidate;

#[async_trait]
impl StageHandler for FailingValidate {
    fn stage(&self) -> StageName {
        StageName::Validate
    }

    async fn handle(
        &self,
        _ctx: &ExecutionContext,
        _input: &StageInput,
        _state: &mut RunState,
    ) -> EngineResult<StagePayload> {
        panic!("policy store unreachable");
    }
}

#[tokio::test]
async fn test_panicking_stage_adds_exactly_one_output() {
    let handler = Arc::new(ScriptedHandler::new(&[(
        "primary",
        json!({"rows": [{"ci_type": "server"}]}),
    )]));
    let (pipeline, sink) = build_pipeline(handler).await;
    let pipeline = pipeline.with_handler(Arc::new(FailingValidate));

    let run = pipeline
        .run(lookup_then_aggregate().into(), &ExecutionContext::new("acme"))
        .await;

    assert_eq!(run.trace.stage_outputs.len(), StageName::ALL.len());
    assert_eq!(run.trace.stage_inputs.len(), StageName::ALL.len());

    let validate = run.trace.stage_output(StageName::Validate).unwrap();
    assert_eq!(validate.diagnostics.status, StageStatus::Error);
    assert!(!validate.diagnostics.errors.is_empty());
    assert!(validate.diagnostics.errors[0].contains("policy store unreachable"));

    // later stages are unaffected
    assert!(run.trace.stage_output(StageName::Execute).unwrap().diagnostics.is_ok());
    assert_eq!(sink.traces()[0].failed_stages(), vec![StageName::Validate]);
}

#[tokio::test]
async fn test_test_mode_overrides_and_baseline() {
    let handler = Arc::new(ScriptedHandler::default());
    let (pipeline, _) = build_pipeline(handler).await;
    let ctx = ExecutionContext::new("acme")
        .with_test_mode(true)
        .with_override("prompt:default", "prompt:candidate")
        .with_baseline("trace-baseline");

    let run = pipeline
        .run(
            PlanRoute::Direct {
                answer: "Nothing to look up".to_string(),
            },
            &ctx,
        )
        .await;

    assert_eq!(run.trace.applied_assets["prompt"], "prompt:candidate");

    let route = run.trace.stage_output(StageName::RoutePlan).unwrap();
    assert_eq!(route.applied_assets["prompt"], "prompt:candidate");

    let validate = run.trace.stage_output(StageName::Validate).unwrap();
    assert_eq!(validate.result["assets"]["prompt"]["status"], json!("valid"));
    assert_eq!(validate.result["assets"]["prompt"]["overridden"], json!(true));
    assert_eq!(validate.result["assets"]["screen"]["overridden"], json!(false));

    let execute = run.trace.stage_output(StageName::Execute).unwrap();
    assert!(execute.applied_assets.is_empty());

    let present = run.trace.stage_output(StageName::Present).unwrap();
    assert_eq!(present.result["baseline_trace_id"], json!("trace-baseline"));
    assert_eq!(present.result["compare"], json!(true));
    assert_eq!(present.applied_assets.len(), 1);
}

#[tokio::test]
async fn test_overrides_ignored_outside_test_mode() {
    let (pipeline, _) = build_pipeline(Arc::new(ScriptedHandler::default())).await;
    let ctx = ExecutionContext::new("acme").with_override("prompt:default", "prompt:candidate");

    let run = pipeline
        .run(
            PlanRoute::Reject {
                reason: "out of scope".to_string(),
            },
            &ctx,
        )
        .await;

    assert_eq!(run.trace.applied_assets["prompt"], "prompt:default");
    assert!(run.trace.stage_output(StageName::Present).unwrap().result.get("compare").is_none());
    assert_eq!(
        run.blocks,
        vec![PresentationBlock::text("Request rejected: out of scope")]
    );
}

#[tokio::test]
async fn test_missing_override_asset_fails_validation_only() {
    let (pipeline, _) = build_pipeline(Arc::new(ScriptedHandler::default())).await;
    let ctx = ExecutionContext::new("acme")
        .with_test_mode(true)
        .with_override("screen:default", "screen:does-not-exist");

    let run = pipeline
        .run(
            PlanRoute::Direct {
                answer: "ok".to_string(),
            },
            &ctx,
        )
        .await;

    let validate = run.trace.stage_output(StageName::Validate).unwrap();
    assert!(validate.diagnostics.is_ok());
    assert_eq!(validate.result["is_valid"], json!(false));
    assert_eq!(validate.result["assets"]["screen"]["status"], json!("invalid"));
    assert!(run.succeeded());
}

#[tokio::test]
async fn test_progress_events_cover_every_stage() {
    let handler = Arc::new(ScriptedHandler::new(&[(
        "primary",
        json!({"rows": [{"ci_type": "server"}]}),
    )]));
    let (pipeline, _) = build_pipeline(handler).await;
    let (tx, mut rx) = progress_channel();
    let pipeline = pipeline.with_progress(tx);

    pipeline
        .run(lookup_then_aggregate().into(), &ExecutionContext::new("acme"))
        .await;
    drop(pipeline);

    let mut completed = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ExecutionEvent::StageCompleted { stage, .. } = event {
            completed.push(stage);
        }
    }
    assert_eq!(
        completed,
        vec!["route_plan", "validate", "execute", "compose", "present"]
    );
}

#[tokio::test]
async fn test_route_document_drives_pipeline() {
    let yaml = r#"
kind: plan
plan:
  intent: lookup
  question: where does web-01 run?
  tools:
    - id: primary
      kind: lookup
      keywords: [web-01]
"#;
    let route = PlanParser::parse_route(yaml, plan_engine::plan::DocumentFormat::Yaml).unwrap();
    let handler = Arc::new(ScriptedHandler::new(&[(
        "primary",
        json!({"rows": [{"ci_id": "web-01", "host": "rack-4"}]}),
    )]));
    let (pipeline, _) = build_pipeline(handler.clone()).await;

    let run = pipeline.run(route, &ExecutionContext::new("acme")).await;

    assert_eq!(handler.calls()[0].tool_kind, ToolKind::Lookup);
    assert_eq!(run.trace.route_kind, "plan");
    assert!(run.blocks.iter().any(|b| b.kind() == "table"));
}
