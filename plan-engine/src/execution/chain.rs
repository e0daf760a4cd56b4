// Chain Builder
// Projects plan tool specifications into an ordered, grouped executable chain

use crate::config::{parse_window, EngineConfig};
use crate::execution::strategy::ExecutionPlanTrace;
use crate::plan::models::{Intent, Plan, TimeRange, ToolDependency, ToolKind, ToolSpec};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Result count for document search when a document search leaves `top_k` unset
pub const DEFAULT_TOP_K: usize = 5;

/// One executable step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolChainStep {
    pub step_id: String,
    pub tool_kind: ToolKind,
    /// Static parameters; mapped inputs are resolved at dispatch time
    pub parameters: Map<String, Value>,
    pub depends_on: Vec<String>,
    pub output_mapping: BTreeMap<String, String>,
    pub group_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainMetadata {
    pub intent: Option<Intent>,
    pub question: Option<String>,
    pub execution_plan: ExecutionPlanTrace,
    pub timeout_seconds: Option<u64>,
    pub intermediate_decisions: bool,
    pub created_at: DateTime<Utc>,
}

/// The executable chain for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolChain {
    pub chain_id: String,
    pub execution_mode: String,
    pub steps: Vec<ToolChainStep>,
    pub metadata: ChainMetadata,
}

impl ToolChain {
    pub fn step(&self, step_id: &str) -> Option<&ToolChainStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Steps bucketed by group index, in group order
    pub fn groups(&self) -> Vec<Vec<&ToolChainStep>> {
        let mut groups: Vec<Vec<&ToolChainStep>> = Vec::new();
        for step in &self.steps {
            if step.group_index >= groups.len() {
                groups.resize(step.group_index + 1, Vec::new());
            }
            groups[step.group_index].push(step);
        }
        groups
    }
}

/// Builds a [`ToolChain`] from a plan and its schedule
pub struct ChainBuilder<'a> {
    config: &'a EngineConfig,
    now: DateTime<Utc>,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self {
            config,
            now: Utc::now(),
        }
    }

    /// Pin the clock used for relative time windows
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Build the chain. Dependencies whose tool is missing from the plan are skipped.
    pub fn build(
        &self,
        plan: &Plan,
        deps: &[ToolDependency],
        plan_trace: &ExecutionPlanTrace,
        tenant_id: &str,
    ) -> ToolChain {
        let mut steps = Vec::with_capacity(deps.len());

        for group in &plan_trace.execution_groups {
            for tool in &group.tools {
                let Some(dep) = deps.iter().find(|d| d.tool_id == tool.tool_id) else {
                    continue;
                };
                let Some(entry) = plan.tool(&dep.tool_id) else {
                    tracing::warn!(
                        tool_id = %dep.tool_id,
                        "no tool specification for dependency, skipping step"
                    );
                    continue;
                };

                steps.push(ToolChainStep {
                    step_id: dep.tool_id.clone(),
                    tool_kind: entry.kind(),
                    parameters: self.parameters(&entry.spec, tenant_id),
                    depends_on: dep.depends_on.clone(),
                    output_mapping: dep.output_mapping.clone(),
                    group_index: group.group_index,
                });
            }
        }

        ToolChain {
            chain_id: Uuid::new_v4().to_string(),
            execution_mode: plan_trace.strategy.clone(),
            steps,
            metadata: ChainMetadata {
                intent: plan.intent,
                question: plan.question.clone(),
                execution_plan: plan_trace.clone(),
                timeout_seconds: plan.budget.timeout_seconds,
                intermediate_decisions: plan.intermediate_decisions,
                created_at: self.now,
            },
        }
    }

    fn parameters(&self, spec: &ToolSpec, tenant_id: &str) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("tenant_id".to_string(), json!(tenant_id));

        match spec {
            ToolSpec::Lookup(lookup) | ToolSpec::SecondaryLookup(lookup) => {
                params.insert("keywords".to_string(), json!(lookup.keywords));
                params.insert("filters".to_string(), Value::Object(lookup.filters.clone()));
                params.insert(
                    "limit".to_string(),
                    json!(self.config.effective_limit(lookup.limit)),
                );
            }
            ToolSpec::Aggregate(aggregate) => {
                params.insert("group_by".to_string(), json!(aggregate.group_by));
                params.insert("metrics".to_string(), json!(aggregate.metrics));
                insert_opt(&mut params, "ci_type_filter", &aggregate.ci_type_filter);
                params.insert(
                    "filters".to_string(),
                    Value::Object(aggregate.filters.clone()),
                );
                params.insert(
                    "limit".to_string(),
                    json!(self.config.effective_limit(aggregate.limit)),
                );
            }
            ToolSpec::GraphExpand(graph) => {
                params.insert("mode".to_string(), json!(graph.mode.as_str()));
                insert_opt(&mut params, "root_ci_id", &graph.root_ci_id);
                insert_opt(&mut params, "target_ci_id", &graph.target_ci_id);
                params.insert("depth".to_string(), json!(graph.depth));
                params.insert("relation_types".to_string(), json!(graph.relation_types));
            }
            ToolSpec::Metric(metric) => {
                params.insert("metric_name".to_string(), json!(metric.metric_name));
                insert_opt(&mut params, "agg", &metric.agg);
                insert_opt(&mut params, "ci_id", &metric.ci_id);
                self.insert_window(&mut params, metric.time_range.as_ref());
            }
            ToolSpec::History(history) => {
                params.insert("event_types".to_string(), json!(history.event_types));
                insert_opt(&mut params, "ci_id", &history.ci_id);
                self.insert_window(&mut params, history.time_range.as_ref());
                params.insert(
                    "limit".to_string(),
                    json!(self.config.effective_limit(history.limit)),
                );
            }
            ToolSpec::DocumentSearch(search) => {
                params.insert("query".to_string(), json!(search.query));
                params.insert(
                    "top_k".to_string(),
                    json!(search
                        .top_k
                        .filter(|k| *k > 0)
                        .unwrap_or(DEFAULT_TOP_K)
                        .min(self.config.max_limit)),
                );
                params.insert("sources".to_string(), json!(search.sources));
            }
        }

        params
    }

    fn insert_window(&self, params: &mut Map<String, Value>, range: Option<&TimeRange>) {
        let (start, end) = self.normalize_range(range);
        params.insert(
            "start_time".to_string(),
            json!(start.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        params.insert(
            "end_time".to_string(),
            json!(end.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
    }

    /// Absolute `(start, end)`; bad or missing windows fall back to the configured default
    pub fn normalize_range(&self, range: Option<&TimeRange>) -> (DateTime<Utc>, DateTime<Utc>) {
        let window = match range {
            Some(TimeRange::Absolute { start, end }) => return (*start, *end),
            Some(TimeRange::Relative { last }) => parse_window(last).or_else(|| {
                tracing::warn!(window = %last, "unparsable time window, using default");
                None
            }),
            None => None,
        };

        let fallback = chrono::Duration::hours(24);
        let window = window
            .or_else(|| parse_window(&self.config.default_time_window))
            .unwrap_or(fallback);
        let start = self
            .now
            .checked_sub_signed(window)
            .or_else(|| self.now.checked_sub_signed(fallback))
            .unwrap_or(self.now);
        (start, self.now)
    }
}

fn insert_opt(params: &mut Map<String, Value>, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        params.insert(key.to_string(), json!(value));
    }
}
