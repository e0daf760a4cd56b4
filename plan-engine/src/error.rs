// Engine Error Types
// Crate-level error and result aliases shared by every module

use crate::execution::graph::GraphError;
use crate::plan::error::{ParseError, ValidationError};

use std::io;
use thiserror::Error;

/// Errors surfaced by the orchestration engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("plan failed structural validation: {}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("chain runtime error: {0}")]
    Runtime(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Structural errors are fatal and surface before any execution begins
    pub fn is_structural(&self) -> bool {
        matches!(self, EngineError::Validation(_) | EngineError::Graph(_))
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("[{}] {}", e.path, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
