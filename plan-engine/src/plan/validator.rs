// Plan Validator
// Structural and budget checks that must pass before a chain is built

use crate::config::parse_window;
use crate::execution::graph::DependencyGraph;
use crate::execution::strategy::{create_execution_groups, dependency_depth, determine_strategy};
use crate::plan::error::ValidationError;
use crate::plan::models::{Budget, Plan, TimeRange, ToolDependency};

pub const MAX_DEPTH_RANGE: (u32, u32) = (1, 10);
pub const TIMEOUT_RANGE: (u64, u64) = (1, 3600);

/// Validator for plans and their dependency lists
pub struct PlanValidator;

impl PlanValidator {
    /// Run every structural check and collect all errors
    pub fn validate(plan: &Plan, deps: &[ToolDependency]) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        Self::validate_tool_ids(plan, &mut errors);
        let graph_ok = Self::validate_graph(deps, &mut errors);
        Self::validate_budget_ranges(&plan.budget, &mut errors);
        if graph_ok {
            Self::validate_budget_usage(&plan.budget, deps, &mut errors);
        }
        Self::validate_time_ranges(plan, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Minimal shape of a routable plan: intent set, and keywords or tools present
    pub fn check_plan_shape(plan: &Plan) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if plan.intent.is_none() {
            errors.push(
                ValidationError::new("plan has no intent", "intent")
                    .with_suggestion("set intent to one of lookup, aggregate, path, metric, history, search"),
            );
        }

        if plan.keywords.is_empty() && plan.tools.is_empty() {
            errors.push(ValidationError::new(
                "plan has neither keywords nor tools",
                "tools",
            ));
        }

        errors
    }

    fn validate_tool_ids(plan: &Plan, errors: &mut Vec<ValidationError>) {
        for (i, tool) in plan.tools.iter().enumerate() {
            if tool.id.trim().is_empty() {
                errors.push(ValidationError::new(
                    "tool id must not be empty",
                    format!("tools[{}].id", i),
                ));
            } else if plan.tools[..i].iter().any(|t| t.id == tool.id) {
                errors.push(ValidationError::new(
                    format!("duplicate tool id '{}'", tool.id),
                    format!("tools[{}].id", i),
                ));
            }
        }
    }

    /// Returns false when the graph is too broken to schedule
    fn validate_graph(deps: &[ToolDependency], errors: &mut Vec<ValidationError>) -> bool {
        let graph = DependencyGraph::new(deps);
        let before = errors.len();

        for id in graph.duplicate_ids() {
            errors.push(ValidationError::new(
                format!("tool '{}' appears more than once in tool_dependencies", id),
                "tool_dependencies",
            ));
        }

        for (tool, missing) in graph.unknown_references() {
            let index = deps.iter().position(|d| d.tool_id == tool).unwrap_or(0);
            errors.push(
                ValidationError::new(
                    format!("tool '{}' depends on undeclared tool '{}'", tool, missing),
                    format!("tool_dependencies[{}].depends_on", index),
                )
                .with_suggestion("declare the tool or remove the reference"),
            );
        }

        if let Some(cycle) = graph.find_cycle() {
            errors.push(ValidationError::new(
                format!("circular dependency detected: {}", cycle.join(" -> ")),
                "tool_dependencies",
            ));
        }

        errors.len() == before
    }

    fn validate_budget_ranges(budget: &Budget, errors: &mut Vec<ValidationError>) {
        let (min_depth, max_depth) = MAX_DEPTH_RANGE;
        if budget.max_depth < min_depth || budget.max_depth > max_depth {
            errors.push(ValidationError::new(
                format!(
                    "max_depth must be between {} and {}, got {}",
                    min_depth, max_depth, budget.max_depth
                ),
                "budget.max_depth",
            ));
        }

        if let Some(timeout) = budget.timeout_seconds {
            let (min, max) = TIMEOUT_RANGE;
            if timeout < min || timeout > max {
                errors.push(ValidationError::new(
                    format!("timeout_seconds must be between {} and {}, got {}", min, max, timeout),
                    "budget.timeout_seconds",
                ));
            }
        }

        for (value, path) in [
            (budget.max_steps, "budget.max_steps"),
            (budget.max_branches, "budget.max_branches"),
            (budget.max_loop_iterations as usize, "budget.max_loop_iterations"),
        ] {
            if value == 0 {
                errors.push(ValidationError::new("must be at least 1", path));
            }
        }
    }

    fn validate_budget_usage(
        budget: &Budget,
        deps: &[ToolDependency],
        errors: &mut Vec<ValidationError>,
    ) {
        if deps.len() > budget.max_steps {
            errors.push(
                ValidationError::new(
                    format!(
                        "plan requires {} steps, exceeding max_steps ({})",
                        deps.len(),
                        budget.max_steps
                    ),
                    "budget.max_steps",
                )
                .with_suggestion("raise max_steps or remove tools"),
            );
        }

        let groups = match create_execution_groups(deps, determine_strategy(deps)) {
            Ok(groups) => groups,
            Err(e) => {
                errors.push(ValidationError::new(e.message, "tool_dependencies"));
                return;
            }
        };

        let widest = groups.iter().map(Vec::len).max().unwrap_or(0);
        if widest > budget.max_branches {
            errors.push(ValidationError::new(
                format!(
                    "widest execution group has {} tools, exceeding max_branches ({})",
                    widest, budget.max_branches
                ),
                "budget.max_branches",
            ));
        }

        let depth = match dependency_depth(deps) {
            Ok(depth) => depth,
            Err(e) => {
                errors.push(ValidationError::new(e.message, "tool_dependencies"));
                return;
            }
        };
        if depth > budget.max_depth as usize {
            errors.push(ValidationError::new(
                format!(
                    "longest dependency chain has {} tools, exceeding max_depth ({})",
                    depth, budget.max_depth
                ),
                "budget.max_depth",
            ));
        }
    }

    fn validate_time_ranges(plan: &Plan, errors: &mut Vec<ValidationError>) {
        for (i, tool) in plan.tools.iter().enumerate() {
            match tool.spec.time_range() {
                Some(TimeRange::Relative { last }) if parse_window(last).is_none() => {
                    errors.push(
                        ValidationError::new(
                            format!("invalid relative time window '{}'", last),
                            format!("tools[{}].time_range.last", i),
                        )
                        .with_suggestion("use a window such as 30m, 24h or 7d"),
                    );
                }
                Some(TimeRange::Absolute { start, end }) if start >= end => {
                    errors.push(ValidationError::new(
                        "time range start must be before end",
                        format!("tools[{}].time_range", i),
                    ));
                }
                _ => {}
            }
        }
    }
}
