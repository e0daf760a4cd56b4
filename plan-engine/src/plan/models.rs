// Plan Data Models
// Declarative plans, tool specifications, dependencies and budgets

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Intent
// =============================================================================

/// What the question is asking for; drives compose and present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Lookup,
    Aggregate,
    Path,
    Metric,
    History,
    Search,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Lookup => "lookup",
            Intent::Aggregate => "aggregate",
            Intent::Path => "path",
            Intent::Metric => "metric",
            Intent::History => "history",
            Intent::Search => "search",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tool kinds and specifications
// =============================================================================

/// Kinds of tool the runtime knows how to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Lookup,
    SecondaryLookup,
    Aggregate,
    GraphExpand,
    Metric,
    History,
    DocumentSearch,
}

impl ToolKind {
    pub const ALL: [ToolKind; 7] = [
        ToolKind::Lookup,
        ToolKind::SecondaryLookup,
        ToolKind::Aggregate,
        ToolKind::GraphExpand,
        ToolKind::Metric,
        ToolKind::History,
        ToolKind::DocumentSearch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Lookup => "lookup",
            ToolKind::SecondaryLookup => "secondary_lookup",
            ToolKind::Aggregate => "aggregate",
            ToolKind::GraphExpand => "graph_expand",
            ToolKind::Metric => "metric",
            ToolKind::History => "history",
            ToolKind::DocumentSearch => "document_search",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown tool kind '{}'", s))
    }
}

/// A time window, either relative to now or absolute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeRange {
    /// `{ last: "24h" }`
    Relative { last: String },
    /// `{ start: ..., end: ... }`
    Absolute {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Lookup over configuration items
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LookupSpec {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub filters: Map<String, Value>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl LookupSpec {
    pub fn is_empty(&self) -> bool {
        self.keywords.iter().all(|k| k.trim().is_empty()) && self.filters.is_empty()
    }
}

/// Grouped counts over configuration items
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub ci_type_filter: Option<String>,
    #[serde(default)]
    pub filters: Map<String, Value>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AggregateSpec {
    pub fn is_empty(&self) -> bool {
        self.group_by.is_empty() && self.metrics.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphMode {
    #[default]
    Expand,
    Path,
}

impl GraphMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphMode::Expand => "expand",
            GraphMode::Path => "path",
        }
    }
}

/// Relationship graph expansion from a root item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(default)]
    pub mode: GraphMode,
    #[serde(default)]
    pub root_ci_id: Option<String>,
    #[serde(default)]
    pub target_ci_id: Option<String>,
    #[serde(default = "default_graph_depth")]
    pub depth: u32,
    #[serde(default)]
    pub relation_types: Vec<String>,
}

fn default_graph_depth() -> u32 {
    2
}

impl Default for GraphSpec {
    fn default() -> Self {
        Self {
            mode: GraphMode::Expand,
            root_ci_id: None,
            target_ci_id: None,
            depth: default_graph_depth(),
            relation_types: Vec::new(),
        }
    }
}

impl GraphSpec {
    pub fn is_empty(&self) -> bool {
        self.depth == 0
    }
}

/// Time-series metric query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub metric_name: String,
    #[serde(default)]
    pub agg: Option<String>,
    #[serde(default)]
    pub ci_id: Option<String>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
}

impl MetricSpec {
    pub fn is_empty(&self) -> bool {
        self.metric_name.trim().is_empty()
    }
}

/// Event / change history query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySpec {
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub ci_id: Option<String>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Document retrieval
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentSearchSpec {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl DocumentSearchSpec {
    pub fn is_empty(&self) -> bool {
        self.query.trim().is_empty()
    }
}

/// A tool specification, tagged by its kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolSpec {
    Lookup(LookupSpec),
    SecondaryLookup(LookupSpec),
    Aggregate(AggregateSpec),
    GraphExpand(GraphSpec),
    Metric(MetricSpec),
    History(HistorySpec),
    DocumentSearch(DocumentSearchSpec),
}

impl ToolSpec {
    pub fn kind(&self) -> ToolKind {
        match self {
            ToolSpec::Lookup(_) => ToolKind::Lookup,
            ToolSpec::SecondaryLookup(_) => ToolKind::SecondaryLookup,
            ToolSpec::Aggregate(_) => ToolKind::Aggregate,
            ToolSpec::GraphExpand(_) => ToolKind::GraphExpand,
            ToolSpec::Metric(_) => ToolKind::Metric,
            ToolSpec::History(_) => ToolKind::History,
            ToolSpec::DocumentSearch(_) => ToolKind::DocumentSearch,
        }
    }

    /// Whether the tool spec carries nothing worth executing
    pub fn is_empty(&self) -> bool {
        match self {
            ToolSpec::Lookup(spec) | ToolSpec::SecondaryLookup(spec) => spec.is_empty(),
            ToolSpec::Aggregate(spec) => spec.is_empty(),
            ToolSpec::GraphExpand(spec) => spec.is_empty(),
            ToolSpec::Metric(spec) => spec.is_empty(),
            ToolSpec::History(_) => false,
            ToolSpec::DocumentSearch(spec) => spec.is_empty(),
        }
    }

    /// The time range carried by metric/history specs
    pub fn time_range(&self) -> Option<&TimeRange> {
        match self {
            ToolSpec::Metric(spec) => spec.time_range.as_ref(),
            ToolSpec::History(spec) => spec.time_range.as_ref(),
            _ => None,
        }
    }
}

/// A named tool specification within a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEntry {
    pub id: String,
    #[serde(flatten)]
    pub spec: ToolSpec,
}

impl ToolEntry {
    pub fn new(id: impl Into<String>, spec: ToolSpec) -> Self {
        Self {
            id: id.into(),
            spec,
        }
    }

    pub fn kind(&self) -> ToolKind {
        self.spec.kind()
    }
}

// =============================================================================
// Dependencies and budget
// =============================================================================

/// Dependency edge set for one tool, plus how its inputs are wired
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDependency {
    pub tool_id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// input parameter -> reference expression (`{tool.rows[0].field}`) or literal
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,
}

impl ToolDependency {
    pub fn new(tool_id: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            ..Default::default()
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mapping(mut self, field: impl Into<String>, reference: impl Into<String>) -> Self {
        self.output_mapping.insert(field.into(), reference.into());
        self
    }
}

/// Execution limits for a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budget {
    pub max_steps: usize,
    pub max_branches: usize,
    /// 1..=10
    pub max_depth: u32,
    pub max_loop_iterations: u32,
    /// 1..=3600 when set
    pub timeout_seconds: Option<u64>,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_steps: 20,
            max_branches: 10,
            max_depth: 5,
            max_loop_iterations: 10,
            timeout_seconds: None,
        }
    }
}

// =============================================================================
// Plan and route
// =============================================================================

/// The unit of orchestration input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub intent: Option<Intent>,
    /// Original question text, when known
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ToolEntry>,
    /// Explicit dependencies; inferred from `tools` when empty
    #[serde(default)]
    pub tool_dependencies: Vec<ToolDependency>,
    #[serde(default)]
    pub budget: Budget,
    /// Consult the decision hook between execution groups
    #[serde(default)]
    pub intermediate_decisions: bool,
}

impl Plan {
    pub fn new(intent: Intent) -> Self {
        Self {
            intent: Some(intent),
            ..Default::default()
        }
    }

    pub fn with_tool(mut self, id: impl Into<String>, spec: ToolSpec) -> Self {
        self.tools.push(ToolEntry::new(id, spec));
        self
    }

    pub fn with_dependency(mut self, dependency: ToolDependency) -> Self {
        self.tool_dependencies.push(dependency);
        self
    }

    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Get a tool specification by id
    pub fn tool(&self, id: &str) -> Option<&ToolEntry> {
        self.tools.iter().find(|t| t.id == id)
    }

    /// First tool of the given kind, in declaration order
    pub fn first_of_kind(&self, kind: ToolKind) -> Option<&ToolEntry> {
        self.tools.iter().find(|t| t.kind() == kind)
    }
}

/// The routing decision handed to the stage pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanRoute {
    /// Answer without running tools
    Direct { answer: String },
    /// Run a structured plan
    Plan { plan: Plan },
    /// Refuse the question
    Reject { reason: String },
}

impl PlanRoute {
    pub fn kind(&self) -> &'static str {
        match self {
            PlanRoute::Direct { .. } => "direct",
            PlanRoute::Plan { .. } => "plan",
            PlanRoute::Reject { .. } => "reject",
        }
    }

    pub fn plan(&self) -> Option<&Plan> {
        match self {
            PlanRoute::Plan { plan } => Some(plan),
            _ => None,
        }
    }
}

impl From<Plan> for PlanRoute {
    fn from(plan: Plan) -> Self {
        PlanRoute::Plan { plan }
    }
}

// =============================================================================
// References
// =============================================================================

/// A citation extracted from a tool result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub kind: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Reference {
    pub fn new(kind: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            title: title.into(),
            data: Value::Null,
        }
    }
}

/// Append references, dropping exact duplicates while keeping first-seen order
pub fn merge_references(target: &mut Vec<Reference>, incoming: &[Reference]) {
    for reference in incoming {
        if !target.contains(reference) {
            target.push(reference.clone());
        }
    }
}
