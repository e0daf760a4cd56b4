// Stage Models
// Stage names, per-stage inputs/outputs and diagnostics

use crate::plan::models::{merge_references, Reference};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

pub const FLAG_RESULT_EMPTY: &str = "result_empty";
pub const COUNT_REFERENCES: &str = "references";

/// The five fixed pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    RoutePlan,
    Validate,
    Execute,
    Compose,
    Present,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        StageName::RoutePlan,
        StageName::Validate,
        StageName::Execute,
        StageName::Compose,
        StageName::Present,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::RoutePlan => "route_plan",
            StageName::Validate => "validate",
            StageName::Execute => "execute",
            StageName::Compose => "compose",
            StageName::Present => "present",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    pub status: StageStatus,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub empty_flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub counts: BTreeMap<String, usize>,
}

impl StageDiagnostics {
    pub fn is_ok(&self) -> bool {
        self.status == StageStatus::Ok
    }

    pub fn result_empty(&self) -> bool {
        self.empty_flags
            .get(FLAG_RESULT_EMPTY)
            .copied()
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInput {
    pub stage: StageName,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// asset_type -> asset reference actually used
    #[serde(default)]
    pub applied_assets: BTreeMap<String, String>,
}

impl StageInput {
    pub fn new(stage: StageName) -> Self {
        Self {
            stage,
            params: Map::new(),
            applied_assets: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_assets(mut self, assets: BTreeMap<String, String>) -> Self {
        self.applied_assets = assets;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub stage: StageName,
    pub result: Value,
    pub diagnostics: StageDiagnostics,
    #[serde(default)]
    pub references: Vec<Reference>,
    #[serde(default)]
    pub applied_assets: BTreeMap<String, String>,
    pub duration_ms: u64,
}

/// What a stage handler produces; turned into a [`StageOutput`] by the pipeline
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagePayload {
    pub result: Value,
    /// Size of the stage's result set
    pub result_count: usize,
    /// Presentation blocks produced, excluding fallbacks
    pub block_count: usize,
    pub references: Vec<Reference>,
    pub warnings: Vec<String>,
    pub counts: BTreeMap<String, usize>,
}

impl StagePayload {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }

    pub fn with_result_count(mut self, count: usize) -> Self {
        self.result_count = count;
        self
    }

    pub fn with_block_count(mut self, count: usize) -> Self {
        self.block_count = count;
        self
    }

    pub fn with_references(mut self, references: &[Reference]) -> Self {
        merge_references(&mut self.references, references);
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_count(mut self, key: impl Into<String>, value: usize) -> Self {
        self.counts.insert(key.into(), value);
        self
    }
}

impl StageOutput {
    /// Successful stage output; fills the uniform empty flag and reference count
    pub fn from_payload(input: &StageInput, payload: StagePayload, duration_ms: u64) -> Self {
        let mut counts = payload.counts;
        counts.insert(COUNT_REFERENCES.to_string(), payload.references.len());

        let mut empty_flags = BTreeMap::new();
        empty_flags.insert(
            FLAG_RESULT_EMPTY.to_string(),
            payload.result_count == 0 && payload.block_count == 0,
        );

        Self {
            stage: input.stage,
            result: payload.result,
            diagnostics: StageDiagnostics {
                status: StageStatus::Ok,
                warnings: payload.warnings,
                errors: Vec::new(),
                empty_flags,
                counts,
            },
            references: payload.references,
            applied_assets: input.applied_assets.clone(),
            duration_ms,
        }
    }

    /// Output recorded when a handler errors or panics
    pub fn failed(input: &StageInput, message: impl Into<String>, duration_ms: u64) -> Self {
        let mut output = Self::from_payload(input, StagePayload::new(Value::Null), duration_ms);
        output.diagnostics.status = StageStatus::Error;
        output.diagnostics.errors.push(message.into());
        output
    }
}
