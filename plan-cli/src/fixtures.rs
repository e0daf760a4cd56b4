// Fixture Tool Handler
// Replays canned tool outputs so plans can be run without live backends

use async_trait::async_trait;
use color_eyre::Result;
use plan_engine::{ExecutionContext, ToolCall, ToolError, ToolHandler, ToolKind};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;

/// Canned outputs keyed by step id, then by tool kind
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FixtureSet {
    #[serde(default)]
    pub steps: HashMap<String, Value>,
    #[serde(default)]
    pub kinds: HashMap<ToolKind, Value>,
    /// step id -> error message
    #[serde(default)]
    pub failures: HashMap<String, String>,
    /// Extra asset references to publish, e.g. override targets
    #[serde(default)]
    pub assets: Vec<String>,
}

impl FixtureSet {
    /// Load from YAML, or JSON when the extension is `.json`
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let fixtures = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };
        Ok(fixtures)
    }
}

pub struct FixtureHandler {
    fixtures: FixtureSet,
}

impl FixtureHandler {
    pub fn new(fixtures: FixtureSet) -> Self {
        Self { fixtures }
    }
}

#[async_trait]
impl ToolHandler for FixtureHandler {
    async fn call(&self, call: &ToolCall, _ctx: &ExecutionContext) -> Result<Value, ToolError> {
        if let Some(message) = self.fixtures.failures.get(&call.step_id) {
            return Err(ToolError::Failed(message.clone()));
        }

        let output = self
            .fixtures
            .steps
            .get(&call.step_id)
            .or_else(|| self.fixtures.kinds.get(&call.tool_kind))
            .cloned()
            .unwrap_or_else(|| json!({"rows": []}));

        tracing::debug!(step_id = %call.step_id, tool_kind = %call.tool_kind, "replayed fixture");
        Ok(output)
    }
}
