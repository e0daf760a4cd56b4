pub mod graph;
pub mod run;
pub mod validate;

use color_eyre::Result;
use plan_engine::{EngineConfig, PlanParser, PlanRoute};
use std::path::Path;

/// Load a plan or routing document, failing early when the file is missing
pub fn load_route(path: &Path) -> Result<PlanRoute> {
    if !path.exists() {
        color_eyre::eyre::bail!("Plan file not found: {}", path.display());
    }
    PlanParser::parse_route_file(path).map_err(|e| color_eyre::eyre::eyre!("Parse error: {}", e))
}

/// Engine configuration from `--config`, or the defaults
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => Ok(EngineConfig::from_file(path)?),
        None => Ok(EngineConfig::default()),
    }
}
