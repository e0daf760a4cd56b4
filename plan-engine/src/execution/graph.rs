// Dependency Graph Builder
// Turns a plan's tool specifications into dependency edges and checks their structure

use crate::plan::models::{Plan, ToolDependency, ToolEntry, ToolKind, ToolSpec};
use crate::registry::ToolInfoProvider;

use std::collections::{HashMap, HashSet};
use std::fmt;

/// Error type for graph operations
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Circular dependency detected
    CyclicDependency,
    /// Reference to an undeclared tool
    UnknownDependency,
    /// Same tool id declared twice
    DuplicateTool,
    /// Invalid plan structure
    InvalidStructure,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph error: {}", self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn cyclic(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::CyclicDependency,
        }
    }

    pub fn unknown_dependency(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::UnknownDependency,
        }
    }

    pub fn duplicate_tool(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::DuplicateTool,
        }
    }

    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::InvalidStructure,
        }
    }
}

/// Registry tag that turns a tool kind off for dependency inference
pub const TAG_ENABLED: &str = "enabled";

/// Extract the dependency list for a plan.
///
/// Explicit `tool_dependencies` win and are returned unchanged. Otherwise one
/// dependency is inferred per present, non-empty tool specification, following
/// a fixed template per tool kind. An empty plan yields an empty list.
pub fn extract_dependencies(
    plan: &Plan,
    tool_info: Option<&dyn ToolInfoProvider>,
) -> Vec<ToolDependency> {
    if !plan.tool_dependencies.is_empty() {
        return plan.tool_dependencies.clone();
    }

    let included: Vec<&ToolEntry> = plan
        .tools
        .iter()
        .filter(|entry| !entry.spec.is_empty())
        .filter(|entry| is_kind_enabled(entry.kind(), tool_info))
        .collect();

    let upstream_lookup = included
        .iter()
        .find(|entry| entry.kind() == ToolKind::Lookup)
        .or_else(|| {
            included
                .iter()
                .find(|entry| entry.kind() == ToolKind::SecondaryLookup)
        })
        .map(|entry| entry.id.as_str());

    included
        .iter()
        .map(|entry| infer_dependency(entry, upstream_lookup))
        .collect()
}

/// Absence of registry information means the kind is included
fn is_kind_enabled(kind: ToolKind, tool_info: Option<&dyn ToolInfoProvider>) -> bool {
    tool_info
        .and_then(|registry| registry.tool_info(kind))
        .and_then(|info| info.tags.get(TAG_ENABLED).cloned())
        .map(|value| !value.eq_ignore_ascii_case("false"))
        .unwrap_or(true)
}

/// Per-kind dependency template
fn infer_dependency(entry: &ToolEntry, upstream_lookup: Option<&str>) -> ToolDependency {
    let dependency = ToolDependency::new(entry.id.clone());

    // (input parameter, field of the lookup's first row) when the tool leaves it unset
    let wiring = match &entry.spec {
        ToolSpec::Lookup(_) | ToolSpec::SecondaryLookup(_) | ToolSpec::DocumentSearch(_) => None,
        ToolSpec::Aggregate(spec) if spec.ci_type_filter.is_none() => {
            Some(("ci_type_filter", "ci_type"))
        }
        ToolSpec::GraphExpand(spec) if spec.root_ci_id.is_none() => {
            Some(("root_ci_id", "ci_id"))
        }
        ToolSpec::Metric(spec) if spec.ci_id.is_none() => Some(("ci_id", "ci_id")),
        ToolSpec::History(spec) if spec.ci_id.is_none() => Some(("ci_id", "ci_id")),
        _ => None,
    };

    match (wiring, upstream_lookup) {
        (Some((param, field)), Some(lookup_id)) if lookup_id != entry.id => dependency
            .depends_on([lookup_id])
            .with_mapping(param, format!("{{{}.rows[0].{}}}", lookup_id, field)),
        _ => dependency,
    }
}

/// Read-only view over a dependency list for structural checks
#[derive(Debug)]
pub struct DependencyGraph<'a> {
    deps: &'a [ToolDependency],
    indices: HashMap<&'a str, usize>,
}

impl<'a> DependencyGraph<'a> {
    pub fn new(deps: &'a [ToolDependency]) -> Self {
        let mut indices = HashMap::with_capacity(deps.len());
        for (i, dep) in deps.iter().enumerate() {
            indices.entry(dep.tool_id.as_str()).or_insert(i);
        }
        Self { deps, indices }
    }

    /// Tool ids declared more than once
    pub fn duplicate_ids(&self) -> Vec<&'a str> {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for dep in self.deps {
            let id = dep.tool_id.as_str();
            if !seen.insert(id) && !duplicates.contains(&id) {
                duplicates.push(id);
            }
        }
        duplicates
    }

    /// `(tool_id, missing)` pairs for every dangling `depends_on` entry
    pub fn unknown_references(&self) -> Vec<(&'a str, &'a str)> {
        self.deps
            .iter()
            .flat_map(|dep| {
                dep.depends_on
                    .iter()
                    .filter(|target| !self.indices.contains_key(target.as_str()))
                    .map(move |target| (dep.tool_id.as_str(), target.as_str()))
            })
            .collect()
    }

    /// Find one cycle using DFS; returns the path that closes it
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        for dep in self.deps {
            if !visited.contains(dep.tool_id.as_str()) {
                if let Some(cycle) = self.dfs_cycle(dep, &mut visited, &mut rec_stack) {
                    return Some(cycle);
                }
            }
        }

        None
    }

    fn dfs_cycle(
        &self,
        node: &'a ToolDependency,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        let name = node.tool_id.as_str();
        visited.insert(name);
        rec_stack.insert(name);

        for dep in &node.depends_on {
            if !visited.contains(dep.as_str()) {
                if let Some(idx) = self.indices.get(dep.as_str()) {
                    if let Some(mut cycle) = self.dfs_cycle(&self.deps[*idx], visited, rec_stack) {
                        cycle.insert(0, name.to_string());
                        return Some(cycle);
                    }
                }
            } else if rec_stack.contains(dep.as_str()) {
                return Some(vec![name.to_string(), dep.clone()]);
            }
        }

        rec_stack.remove(name);
        None
    }

    /// Check the graph, failing on the first structural problem
    pub fn check(&self) -> Result<(), GraphError> {
        if let Some(id) = self.duplicate_ids().first() {
            return Err(GraphError::duplicate_tool(format!(
                "tool '{}' is declared more than once",
                id
            )));
        }

        if let Some((tool, missing)) = self.unknown_references().first() {
            return Err(GraphError::unknown_dependency(format!(
                "tool '{}' depends on unknown tool '{}'",
                tool, missing
            )));
        }

        if let Some(cycle) = self.find_cycle() {
            return Err(GraphError::cyclic(format!(
                "circular dependency detected: {}",
                cycle.join(" -> ")
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::models::{AggregateSpec, GraphSpec, Intent, LookupSpec, MetricSpec};
    use crate::registry::{InMemoryToolRegistry, ToolInfo};

    fn lookup(keyword: &str) -> ToolSpec {
        ToolSpec::Lookup(LookupSpec {
            keywords: vec![keyword.to_string()],
            ..Default::default()
        })
    }

    fn aggregate() -> ToolSpec {
        ToolSpec::Aggregate(AggregateSpec {
            group_by: vec!["ci_type".to_string()],
            ..Default::default()
        })
    }

    #[test]
    fn test_explicit_dependencies_win() {
        let explicit = ToolDependency::new("b").depends_on(["a"]);
        let plan = Plan::new(Intent::Lookup)
            .with_tool("a", lookup("x"))
            .with_tool("b", aggregate())
            .with_dependency(ToolDependency::new("a"))
            .with_dependency(explicit.clone());

        let deps = extract_dependencies(&plan, None);
        assert_eq!(deps, vec![ToolDependency::new("a"), explicit]);
    }

    #[test]
    fn test_aggregate_inferred_from_lookup() {
        let plan = Plan::new(Intent::Aggregate)
            .with_tool("primary", lookup("prod"))
            .with_tool("aggregate", aggregate());

        let deps = extract_dependencies(&plan, None);
        assert_eq!(deps.len(), 2);
        assert!(deps[0].depends_on.is_empty());
        assert_eq!(deps[1].depends_on, vec!["primary"]);
        assert_eq!(
            deps[1].output_mapping.get("ci_type_filter").map(String::as_str),
            Some("{primary.rows[0].ci_type}")
        );
    }

    #[test]
    fn test_graph_and_metric_wire_ci_id() {
        let plan = Plan::new(Intent::Path)
            .with_tool("primary", lookup("db"))
            .with_tool("graph", ToolSpec::GraphExpand(GraphSpec::default()))
            .with_tool(
                "cpu",
                ToolSpec::Metric(MetricSpec {
                    metric_name: "cpu_usage".to_string(),
                    ..Default::default()
                }),
            );

        let deps = extract_dependencies(&plan, None);
        assert_eq!(
            deps[1].output_mapping.get("root_ci_id").map(String::as_str),
            Some("{primary.rows[0].ci_id}")
        );
        assert_eq!(
            deps[2].output_mapping.get("ci_id").map(String::as_str),
            Some("{primary.rows[0].ci_id}")
        );
    }

    #[test]
    fn test_explicit_filter_needs_no_dependency() {
        let plan = Plan::new(Intent::Aggregate)
            .with_tool("primary", lookup("prod"))
            .with_tool(
                "aggregate",
                ToolSpec::Aggregate(AggregateSpec {
                    group_by: vec!["status".to_string()],
                    ci_type_filter: Some("server".to_string()),
                    ..Default::default()
                }),
            );

        let deps = extract_dependencies(&plan, None);
        assert!(deps.iter().all(|d| d.depends_on.is_empty()));
    }

    #[test]
    fn test_empty_specs_and_plans_are_skipped() {
        let plan = Plan::new(Intent::Lookup).with_tool("primary", ToolSpec::Lookup(LookupSpec::default()));
        assert!(extract_dependencies(&plan, None).is_empty());
        assert!(extract_dependencies(&Plan::default(), None).is_empty());
    }

    #[test]
    fn test_without_lookup_dependents_degrade_to_roots() {
        let plan = Plan::new(Intent::Aggregate).with_tool("aggregate", aggregate());
        let deps = extract_dependencies(&plan, None);
        assert_eq!(deps, vec![ToolDependency::new("aggregate")]);
    }

    #[test]
    fn test_registry_can_disable_a_kind() {
        let mut registry = InMemoryToolRegistry::new();
        registry.register(
            ToolKind::Aggregate,
            ToolInfo::new("grouped counts").with_tag(TAG_ENABLED, "false"),
        );
        let plan = Plan::new(Intent::Aggregate)
            .with_tool("primary", lookup("prod"))
            .with_tool("aggregate", aggregate());

        let deps = extract_dependencies(&plan, Some(&registry));
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].tool_id, "primary");
    }

    #[test]
    fn test_structural_checks() {
        let deps = vec![
            ToolDependency::new("a").depends_on(["c"]),
            ToolDependency::new("b").depends_on(["a"]),
            ToolDependency::new("c").depends_on(["b"]),
        ];
        let err = DependencyGraph::new(&deps).check().unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::CyclicDependency);
        assert!(err.message.contains("circular dependency detected"));

        let deps = vec![
            ToolDependency::new("a"),
            ToolDependency::new("b").depends_on(["ghost"]),
        ];
        let graph = DependencyGraph::new(&deps);
        assert_eq!(graph.unknown_references(), vec![("b", "ghost")]);
        assert_eq!(graph.check().unwrap_err().kind, GraphErrorKind::UnknownDependency);

        let deps = vec![ToolDependency::new("a"), ToolDependency::new("a")];
        let graph = DependencyGraph::new(&deps);
        assert_eq!(graph.duplicate_ids(), vec!["a"]);
        assert_eq!(graph.check().unwrap_err().kind, GraphErrorKind::DuplicateTool);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let deps = vec![ToolDependency::new("a").depends_on(["a"])];
        assert!(DependencyGraph::new(&deps).find_cycle().is_some());
    }
}
