// planctl
// Command-line driver for the plan orchestration engine

mod commands;
mod fixtures;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;

/// Load plans, inspect their schedule and replay them against fixture data
#[derive(Parser, Debug)]
#[command(name = "planctl")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Plan orchestration: validate, schedule and replay plans", long_about = None)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(global = true, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a plan or routing document through the five-stage pipeline
    Run(commands::run::RunArgs),

    /// Check a plan's structure, dependencies and budget
    Validate(commands::validate::ValidateArgs),

    /// Print the execution strategy, groups and plan trace as JSON
    Graph(commands::graph::GraphArgs),
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Run(args) => commands::run::execute(args).await,
        Commands::Validate(args) => commands::validate::execute(args),
        Commands::Graph(args) => commands::graph::execute(args),
    }
}
