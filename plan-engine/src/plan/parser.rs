// Plan Parser
// Loads plans and routing decisions from YAML or JSON documents

use crate::plan::error::{ParseError, ParseErrorKind, ParseResult};
use crate::plan::models::{Plan, PlanRoute};

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Serialization format of a plan document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    /// Pick the format from a file extension
    pub fn from_path(path: &Path) -> ParseResult<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(DocumentFormat::Yaml),
            Some("json") => Ok(DocumentFormat::Json),
            other => Err(ParseError::new(
                format!(
                    "unsupported plan file extension '{}', expected .yaml, .yml or .json",
                    other.unwrap_or("")
                ),
                ParseErrorKind::UnsupportedFormat,
            )),
        }
    }
}

/// Parser for plan and route documents
pub struct PlanParser;

impl PlanParser {
    /// Parse a plan from a string
    pub fn parse_plan(content: &str, format: DocumentFormat) -> ParseResult<Plan> {
        deserialize(content, format)
    }

    /// Parse a plan from a file
    pub fn parse_plan_file<P: AsRef<Path>>(path: P) -> ParseResult<Plan> {
        let path = path.as_ref();
        let format = DocumentFormat::from_path(path)?;
        Self::parse_plan(&read(path)?, format)
    }

    /// Parse a routing decision. A document without a `kind` key is a bare plan.
    pub fn parse_route(content: &str, format: DocumentFormat) -> ParseResult<PlanRoute> {
        let raw: Value = deserialize(content, format)?;
        let is_route = raw
            .get("kind")
            .and_then(Value::as_str)
            .map(|kind| matches!(kind, "direct" | "plan" | "reject"))
            .unwrap_or(false);

        if is_route {
            serde_json::from_value(raw).map_err(|e| ParseError::from_json_error(&e))
        } else {
            let plan: Plan =
                serde_json::from_value(raw).map_err(|e| ParseError::from_json_error(&e))?;
            Ok(PlanRoute::Plan { plan })
        }
    }

    /// Parse a routing decision from a file
    pub fn parse_route_file<P: AsRef<Path>>(path: P) -> ParseResult<PlanRoute> {
        let path = path.as_ref();
        let format = DocumentFormat::from_path(path)?;
        Self::parse_route(&read(path)?, format)
    }
}

fn read(path: &Path) -> ParseResult<String> {
    fs::read_to_string(path).map_err(|e| {
        ParseError::new(
            format!("failed to read '{}': {}", path.display(), e),
            ParseErrorKind::Io,
        )
    })
}

fn deserialize<T: DeserializeOwned>(content: &str, format: DocumentFormat) -> ParseResult<T> {
    match format {
        DocumentFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e))
        }
        DocumentFormat::Json => {
            serde_json::from_str(content).map_err(|e| ParseError::from_json_error(&e))
        }
    }
}
