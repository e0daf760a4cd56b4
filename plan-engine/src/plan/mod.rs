// Plan Module
// Data model, loading and structural validation of orchestration plans

pub mod error;
pub mod models;
pub mod parser;
pub mod validator;

pub use error::{ParseError, ParseErrorKind, ValidationError};
pub use models::{Budget, Intent, Plan, PlanRoute, Reference, ToolDependency, ToolKind, ToolSpec};
pub use parser::{DocumentFormat, PlanParser};
pub use validator::PlanValidator;
