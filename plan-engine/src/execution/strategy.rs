// Execution Strategy Planner
// Classifies a dependency graph and partitions tool ids into ordered execution groups

use crate::execution::graph::GraphError;
use crate::plan::models::{Plan, ToolDependency, ToolKind};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;

/// How tool steps are grouped for concurrent execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// One group, full concurrency
    Parallel,
    /// Groups of exactly one tool, strict total order
    Serial,
    /// Groups by dependency level
    Dag,
}

impl ExecutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStrategy::Parallel => "parallel",
            ExecutionStrategy::Serial => "serial",
            ExecutionStrategy::Dag => "dag",
        }
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered execution groups; each group holds tool ids that may run concurrently
pub type ExecutionGroups = Vec<Vec<String>>;

/// Pick the strategy for a dependency list
pub fn determine_strategy(deps: &[ToolDependency]) -> ExecutionStrategy {
    if deps.iter().all(|dep| dep.depends_on.is_empty()) {
        return ExecutionStrategy::Parallel;
    }

    // Any convergence point makes it a DAG, whatever the number of entry points
    let has_convergence = deps.iter().any(|dep| dep.depends_on.len() > 1);

    if has_convergence {
        ExecutionStrategy::Dag
    } else {
        ExecutionStrategy::Serial
    }
}

/// Kahn's algorithm. Ties are broken by declaration order; references to
/// undeclared tools do not count toward in-degree.
pub fn topological_order(deps: &[ToolDependency]) -> Result<Vec<String>, GraphError> {
    let known: HashSet<&str> = deps.iter().map(|d| d.tool_id.as_str()).collect();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut adj_list: HashMap<&str, Vec<&str>> = HashMap::new();

    // Initialize
    for dep in deps {
        let name = dep.tool_id.as_str();
        in_degree.entry(name).or_insert(0);
        adj_list.entry(name).or_default();

        for upstream in dep.depends_on.iter().filter(|d| known.contains(d.as_str())) {
            adj_list.entry(upstream.as_str()).or_default().push(name);
            *in_degree.entry(name).or_insert(0) += 1;
        }
    }

    // Seed with zero in-degree nodes in declaration order
    let mut queue: VecDeque<&str> = deps
        .iter()
        .map(|d| d.tool_id.as_str())
        .filter(|name| in_degree.get(name) == Some(&0))
        .collect();

    let mut result: Vec<String> = Vec::with_capacity(deps.len());
    let mut emitted: HashSet<&str> = HashSet::new();

    while let Some(name) = queue.pop_front() {
        if !emitted.insert(name) {
            continue;
        }
        result.push(name.to_string());

        if let Some(neighbors) = adj_list.get(name) {
            for &neighbor in neighbors {
                if let Some(deg) = in_degree.get_mut(neighbor) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }
    }

    if result.len() < in_degree.len() {
        let remaining: Vec<&str> = deps
            .iter()
            .map(|d| d.tool_id.as_str())
            .filter(|name| !emitted.contains(name))
            .collect();
        return Err(GraphError::cyclic(format!(
            "circular dependency detected among: {}",
            remaining.join(", ")
        )));
    }

    Ok(result)
}

/// Partition tool ids into ordered groups for the given strategy
pub fn create_execution_groups(
    deps: &[ToolDependency],
    strategy: ExecutionStrategy,
) -> Result<ExecutionGroups, GraphError> {
    match strategy {
        ExecutionStrategy::Parallel => {
            if deps.is_empty() {
                return Ok(Vec::new());
            }
            let mut seen = HashSet::new();
            let group = deps
                .iter()
                .filter(|d| seen.insert(d.tool_id.as_str()))
                .map(|d| d.tool_id.clone())
                .collect();
            Ok(vec![group])
        }
        ExecutionStrategy::Serial => Ok(topological_order(deps)?
            .into_iter()
            .map(|id| vec![id])
            .collect()),
        ExecutionStrategy::Dag => {
            let levels = compute_levels(deps)?;
            let mut groups: ExecutionGroups = Vec::new();
            let mut placed = HashSet::new();
            for dep in deps {
                if !placed.insert(dep.tool_id.as_str()) {
                    continue;
                }
                let level = levels.get(dep.tool_id.as_str()).copied().unwrap_or(0);
                if level >= groups.len() {
                    groups.resize(level + 1, Vec::new());
                }
                groups[level].push(dep.tool_id.clone());
            }
            Ok(groups)
        }
    }
}

/// Length of the longest dependency chain, counted in tools; 0 for an empty list
pub fn dependency_depth(deps: &[ToolDependency]) -> Result<usize, GraphError> {
    Ok(compute_levels(deps)?
        .values()
        .max()
        .map(|level| level + 1)
        .unwrap_or(0))
}

/// Level 0 for roots, otherwise one past the deepest dependency. Memoized.
pub fn compute_levels(deps: &[ToolDependency]) -> Result<HashMap<&str, usize>, GraphError> {
    let by_id: HashMap<&str, &ToolDependency> =
        deps.iter().map(|d| (d.tool_id.as_str(), d)).collect();
    let mut memo: HashMap<&str, usize> = HashMap::new();
    let mut visiting: HashSet<&str> = HashSet::new();

    for dep in deps {
        level_of(dep.tool_id.as_str(), &by_id, &mut memo, &mut visiting)?;
    }

    Ok(memo)
}

fn level_of<'a>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a ToolDependency>,
    memo: &mut HashMap<&'a str, usize>,
    visiting: &mut HashSet<&'a str>,
) -> Result<usize, GraphError> {
    if let Some(level) = memo.get(id) {
        return Ok(*level);
    }
    if !visiting.insert(id) {
        return Err(GraphError::cyclic(format!(
            "circular dependency detected at '{}'",
            id
        )));
    }

    let mut level = 0;
    if let Some(node) = by_id.get(id) {
        for upstream in &node.depends_on {
            // Undeclared dependencies are reported by validation, not here
            if let Some((&key, _)) = by_id.get_key_value(upstream.as_str()) {
                level = level.max(level_of(key, by_id, memo, visiting)? + 1);
            }
        }
    }

    visiting.remove(id);
    memo.insert(id, level);
    Ok(level)
}

/// Sorted, unique indices of the groups holding a tool's dependencies
pub fn dependency_groups(dep: &ToolDependency, groups: &[Vec<String>]) -> Vec<usize> {
    let mut indices: Vec<usize> = dep
        .depends_on
        .iter()
        .filter_map(|upstream| groups.iter().position(|g| g.contains(upstream)))
        .collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}

// =============================================================================
// Execution-plan trace
// =============================================================================

/// Per-run record of how the plan was scheduled, emitted for audit and replay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlanTrace {
    pub strategy: String,
    pub execution_groups: Vec<GroupTrace>,
    pub total_groups: usize,
    pub total_tools: usize,
    pub tool_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupTrace {
    pub group_index: usize,
    pub parallel_execution: bool,
    pub tools: Vec<ToolTrace>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolTrace {
    pub tool_id: String,
    pub tool_kind: Option<ToolKind>,
    pub depends_on: Vec<String>,
    pub dependency_groups: Vec<usize>,
    pub output_mapping: BTreeMap<String, String>,
}

impl ExecutionPlanTrace {
    pub fn build(
        plan: &Plan,
        deps: &[ToolDependency],
        strategy: ExecutionStrategy,
        groups: &[Vec<String>],
    ) -> Self {
        let execution_groups: Vec<GroupTrace> = groups
            .iter()
            .enumerate()
            .map(|(group_index, group)| GroupTrace {
                group_index,
                parallel_execution: group.len() > 1,
                tools: group
                    .iter()
                    .filter_map(|id| deps.iter().find(|d| &d.tool_id == id))
                    .map(|dep| ToolTrace {
                        tool_id: dep.tool_id.clone(),
                        tool_kind: plan.tool(&dep.tool_id).map(|t| t.kind()),
                        depends_on: dep.depends_on.clone(),
                        dependency_groups: dependency_groups(dep, groups),
                        output_mapping: dep.output_mapping.clone(),
                    })
                    .collect(),
            })
            .collect();

        let tool_ids: Vec<String> = groups.iter().flatten().cloned().collect();

        Self {
            strategy: strategy.as_str().to_string(),
            total_groups: execution_groups.len(),
            total_tools: tool_ids.len(),
            execution_groups,
            tool_ids,
        }
    }

    /// Look up the trace entry for one tool
    pub fn tool(&self, tool_id: &str) -> Option<&ToolTrace> {
        self.execution_groups
            .iter()
            .flat_map(|g| g.tools.iter())
            .find(|t| t.tool_id == tool_id)
    }
}
