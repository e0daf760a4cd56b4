use crate::commands::load_route;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use plan_engine::execution::graph::extract_dependencies;
use plan_engine::PlanValidator;

/// Validate a plan or routing document
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the plan file (YAML or JSON)
    pub plan: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    output::status("Validating", &format!("{}", args.plan.display()));

    let route = match load_route(&args.plan) {
        Ok(route) => route,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };
    output::check("Syntax valid");

    let Some(plan) = route.plan() else {
        output::info(&format!("Route kind '{}' has no plan to check", route.kind()));
        return Ok(());
    };

    let deps = extract_dependencies(plan, None);
    output::check(&format!(
        "Structure: {} tools, {} effective steps",
        plan.tools.len(),
        deps.len()
    ));

    let mut errors = PlanValidator::check_plan_shape(plan);
    if let Err(structural) = PlanValidator::validate(plan, &deps) {
        errors.extend(structural);
    }

    if errors.is_empty() {
        output::success("Plan is valid");
        return Ok(());
    }

    output::error(&format!("{} validation error(s):", errors.len()));
    for error in &errors {
        output::error(&format!("  - [{}] {}", error.path, error.message));
        if let Some(suggestion) = &error.suggestion {
            output::info(&format!("  Suggestion: {}", suggestion));
        }
    }
    std::process::exit(1);
}
