// Run Trace
// Per-run audit record and the sinks it is emitted to

use crate::execution::strategy::ExecutionPlanTrace;
use crate::stages::models::{StageInput, StageName, StageOutput};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

/// Append-only record of one orchestration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTrace {
    pub trace_id: String,
    pub tenant_id: String,
    pub test_mode: bool,
    pub route_kind: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub applied_assets: BTreeMap<String, String>,
    #[serde(default)]
    pub execution_plan: Option<ExecutionPlanTrace>,
    #[serde(default)]
    pub stage_inputs: Vec<StageInput>,
    #[serde(default)]
    pub stage_outputs: Vec<StageOutput>,
}

impl RunTrace {
    pub fn stage_output(&self, stage: StageName) -> Option<&StageOutput> {
        self.stage_outputs.iter().find(|o| o.stage == stage)
    }

    /// Stages whose diagnostics report an error
    pub fn failed_stages(&self) -> Vec<StageName> {
        self.stage_outputs
            .iter()
            .filter(|o| !o.diagnostics.is_ok())
            .map(|o| o.stage)
            .collect()
    }
}

/// Receives finished run traces; must not fail the run
pub trait TraceSink: Send + Sync {
    fn emit(&self, trace: &RunTrace);
}

/// Keeps traces in memory
#[derive(Debug, Default)]
pub struct MemoryTraceSink {
    traces: Mutex<Vec<RunTrace>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<RunTrace> {
        self.traces
            .lock()
            .map(|traces| traces.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl TraceSink for MemoryTraceSink {
    fn emit(&self, trace: &RunTrace) {
        match self.traces.lock() {
            Ok(mut traces) => traces.push(trace.clone()),
            Err(poisoned) => poisoned.into_inner().push(trace.clone()),
        }
    }
}

/// Writes each trace as pretty JSON to `<dir>/<trace_id>.json`
#[derive(Debug, Clone)]
pub struct JsonFileTraceSink {
    dir: PathBuf,
}

impl JsonFileTraceSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, trace_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", trace_id))
    }

    fn write(&self, trace: &RunTrace) -> Result<PathBuf, String> {
        fs::create_dir_all(&self.dir).map_err(|e| e.to_string())?;
        let body = serde_json::to_string_pretty(trace).map_err(|e| e.to_string())?;
        let path = self.path_for(&trace.trace_id);
        fs::write(&path, body).map_err(|e| e.to_string())?;
        Ok(path)
    }
}

impl TraceSink for JsonFileTraceSink {
    fn emit(&self, trace: &RunTrace) {
        match self.write(trace) {
            Ok(path) => tracing::debug!(trace_id = %trace.trace_id, path = %path.display(), "trace written"),
            Err(e) => tracing::warn!(trace_id = %trace.trace_id, error = %e, "failed to write trace"),
        }
    }
}
