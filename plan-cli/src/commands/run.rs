use crate::commands::{load_config, load_route};
use crate::fixtures::{FixtureHandler, FixtureSet};
use crate::output;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;

use plan_engine::execution::events::progress_channel;
use plan_engine::execution::ToolHandlerRegistry;
use plan_engine::stages::StageStatus;
use plan_engine::{
    Asset, ExecutionContext, ExecutionEvent, GroupedChainRuntime, InMemoryAssetRegistry,
    JsonFileTraceSink, PlanExecutor, StagePipeline,
};

/// Run a plan through the five-stage pipeline against fixture data
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the plan or routing document (YAML or JSON)
    pub plan: PathBuf,

    /// Canned tool outputs to replay
    #[arg(long, value_name = "FILE")]
    pub fixtures: Option<PathBuf>,

    /// Tenant injected into every tool call
    #[arg(long, default_value = "local")]
    pub tenant: String,

    /// Question recorded on the run context
    #[arg(long)]
    pub question: Option<String>,

    /// Enable asset overrides and baseline comparison
    #[arg(long)]
    pub test_mode: bool,

    /// Replace an asset (can be repeated, format: type:key=type:replacement)
    #[arg(long = "override", value_name = "ASSET=REPLACEMENT")]
    pub overrides: Vec<String>,

    /// Baseline trace to compare against in test mode
    #[arg(long, value_name = "TRACE_ID")]
    pub baseline: Option<String>,

    /// Directory the run trace is written to as <trace_id>.json
    #[arg(long, value_name = "DIR")]
    pub trace_out: Option<PathBuf>,

    /// Engine configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print the full run trace as JSON instead of the rendered answer
    #[arg(long)]
    pub json: bool,
}

fn parse_overrides(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut overrides = BTreeMap::new();
    for entry in raw {
        match entry.split_once('=') {
            Some((asset, replacement)) if !asset.is_empty() && !replacement.is_empty() => {
                overrides.insert(asset.to_string(), replacement.to_string());
            }
            _ => color_eyre::eyre::bail!(
                "Invalid override format '{}'. Expected type:key=type:replacement",
                entry
            ),
        }
    }
    Ok(overrides)
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let overrides = parse_overrides(&args.overrides)?;

    output::status("Loading", &format!("{}", args.plan.display()));
    let route = load_route(&args.plan)?;

    let fixtures = match &args.fixtures {
        Some(path) => FixtureSet::from_file(path)?,
        None => FixtureSet::default(),
    };

    // Build the asset registry: defaults plus whatever the fixtures publish
    let asset_types: Vec<String> = config.default_assets.keys().cloned().collect();
    let assets = InMemoryAssetRegistry::with_defaults(&asset_types).await?;
    for asset_ref in &fixtures.assets {
        assets
            .publish(Asset::new(asset_ref.clone(), serde_json::Value::Null)?)
            .await;
    }

    let mut ctx = ExecutionContext::new(args.tenant.clone()).with_test_mode(args.test_mode);
    for (asset, replacement) in overrides {
        ctx = ctx.with_override(asset, replacement);
    }
    if let Some(baseline) = &args.baseline {
        ctx = ctx.with_baseline(baseline.clone());
    }
    if let Some(question) = &args.question {
        ctx = ctx.with_question(question.clone());
    }

    let (tx, mut rx) = progress_channel();

    let handlers = ToolHandlerRegistry::new().with_fallback(Arc::new(FixtureHandler::new(fixtures)));
    let runtime = GroupedChainRuntime::new(handlers)
        .with_max_parallel_steps(config.max_parallel_steps)
        .with_max_log_value_chars(config.max_log_value_chars)
        .with_progress(tx.clone());
    let executor = Arc::new(PlanExecutor::new(config, Arc::new(runtime)));

    let mut pipeline = StagePipeline::new(executor, Arc::new(assets)).with_progress(tx);
    if let Some(dir) = &args.trace_out {
        pipeline = pipeline.with_trace_sink(Arc::new(JsonFileTraceSink::new(dir.clone())));
    }

    output::info(&format!(
        "Trace {} (tenant '{}', route '{}')",
        ctx.trace_id,
        ctx.tenant_id,
        route.kind()
    ));

    // Spawn the run in the background; the channel closes when the pipeline is dropped
    let run_handle = tokio::spawn(async move { pipeline.run(route, &ctx).await });

    while let Some(event) = rx.recv().await {
        match event {
            ExecutionEvent::StageStarted { stage } => {
                output::header(&format!("Stage '{}'", stage));
            }
            ExecutionEvent::StageCompleted {
                stage,
                ok,
                duration,
            } => {
                let line = format!("  Stage '{}' ({:.2}s)", stage, duration.as_secs_f64());
                if ok {
                    output::dim_success(&line);
                } else {
                    output::dim_failure(&line);
                }
            }
            ExecutionEvent::ChainStarted {
                strategy,
                total_groups,
                total_steps,
                ..
            } => {
                output::info(&format!(
                    "{} strategy: {} steps in {} groups",
                    strategy, total_steps, total_groups
                ));
            }
            ExecutionEvent::ChainCompleted {
                success, duration, ..
            } => {
                let line = format!("  Chain finished in {:.2}s", duration.as_secs_f64());
                if success {
                    output::dim_success(&line);
                } else {
                    output::dim_failure(&line);
                }
            }
            ExecutionEvent::GroupStarted { group_index, tools } => {
                println!("    Group {}: {}", group_index, tools.join(", "));
            }
            ExecutionEvent::GroupCompleted { .. } => {}
            ExecutionEvent::StepStarted {
                step_id, tool_kind, ..
            } => {
                output::dim(&format!("      [{}] {}", tool_kind, step_id));
            }
            ExecutionEvent::StepCompleted {
                step_id,
                success,
                duration,
            } => {
                let line = format!(
                    "      {} {} ({:.2}s)",
                    step_id,
                    if success { "OK" } else { "FAIL" },
                    duration.as_secs_f64()
                );
                if success {
                    output::dim_success(&line);
                } else {
                    output::dim_failure(&line);
                }
            }
            ExecutionEvent::StepSkipped { step_id, reason } => {
                output::warning(&format!("      {} skipped: {}", step_id, reason));
            }
            ExecutionEvent::Warning { message, step_id } => match step_id {
                Some(step_id) => output::warning(&format!("{}: {}", step_id, message)),
                None => output::warning(&message),
            },
        }
    }

    let run = run_handle.await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run.trace)?);
    } else {
        println!();
        for block in &run.blocks {
            output::block(block);
        }
        println!();
    }

    for stage_output in &run.trace.stage_outputs {
        if stage_output.diagnostics.status == StageStatus::Error {
            for error in &stage_output.diagnostics.errors {
                output::error(&format!("{}: {}", stage_output.stage, error));
            }
        }
    }

    if let Some(dir) = &args.trace_out {
        output::info(&format!(
            "Trace written to {}",
            JsonFileTraceSink::new(dir.clone())
                .path_for(&run.trace.trace_id)
                .display()
        ));
    }

    if run.succeeded() {
        output::success(&format!("Run completed in {}ms", run.trace.duration_ms));
        Ok(())
    } else {
        output::failure(&format!(
            "Run finished with failed stages: {}",
            run.trace
                .failed_stages()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ));
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides() {
        let parsed = parse_overrides(&["prompt:default=prompt:candidate".to_string()]).unwrap();
        assert_eq!(parsed["prompt:default"], "prompt:candidate");
    }

    #[test]
    fn test_parse_overrides_rejects_missing_value() {
        assert!(parse_overrides(&["prompt:default".to_string()]).is_err());
        assert!(parse_overrides(&["prompt:default=".to_string()]).is_err());
    }
}
