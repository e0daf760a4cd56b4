use crate::commands::{load_config, load_route};

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;
use serde_json::json;

use plan_engine::execution::graph::extract_dependencies;
use plan_engine::execution::strategy::{create_execution_groups, determine_strategy};
use plan_engine::{ChainBuilder, ExecutionPlanTrace, PlanValidator};

/// Print the schedule for a plan
#[derive(Args, Debug)]
pub struct GraphArgs {
    /// Path to the plan file (YAML or JSON)
    pub plan: PathBuf,

    /// Engine configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Tenant injected into chain parameters
    #[arg(long, default_value = "local")]
    pub tenant: String,

    /// Include the built tool chain
    #[arg(long)]
    pub chain: bool,
}

pub fn execute(args: GraphArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let route = load_route(&args.plan)?;
    let Some(plan) = route.plan() else {
        color_eyre::eyre::bail!("Route kind '{}' has no plan to schedule", route.kind());
    };

    let deps = extract_dependencies(plan, None);
    if let Err(errors) = PlanValidator::validate(plan, &deps) {
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        color_eyre::eyre::bail!("Plan is invalid:\n  {}", messages.join("\n  "));
    }

    let strategy = determine_strategy(&deps);
    let groups = create_execution_groups(&deps, strategy)?;
    let trace = ExecutionPlanTrace::build(plan, &deps, strategy, &groups);

    let mut report = json!({
        "strategy": strategy,
        "execution_groups": groups,
        "execution_plan": trace,
    });
    if args.chain {
        let chain = ChainBuilder::new(&config).build(plan, &deps, &trace, &args.tenant);
        report["chain"] = serde_json::to_value(&chain)?;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
