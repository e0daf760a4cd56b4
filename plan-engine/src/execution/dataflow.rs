// Data Flow Resolver
// Resolves `{tool.rows[0].field}` references against results of completed steps

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Results of already-completed steps, keyed by tool id
pub type PriorResults = HashMap<String, Value>;

/// A reference that could not be resolved; the field resolves to null
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionWarning {
    pub field: String,
    pub reference: String,
    pub reason: String,
}

impl fmt::Display for ResolutionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not resolve '{}' for input '{}': {}",
            self.reference, self.field, self.reason
        )
    }
}

/// Resolved inputs for one step plus any warnings produced on the way
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedMapping {
    pub values: Map<String, Value>,
    pub warnings: Vec<ResolutionWarning>,
}

/// One `key[i][j]` segment of a path expression
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    key: Option<String>,
    indices: Vec<usize>,
}

/// Resolve every `(input field, reference)` pair. Never fails.
pub fn resolve_mapping(
    output_mapping: &BTreeMap<String, String>,
    prior_results: &PriorResults,
) -> ResolvedMapping {
    let mut resolved = ResolvedMapping::default();

    for (field, reference) in output_mapping {
        let value = match resolve_reference(reference, prior_results) {
            Ok(value) => value,
            Err(reason) => {
                tracing::warn!(
                    field = %field,
                    reference = %reference,
                    reason = %reason,
                    "output mapping resolved to null"
                );
                resolved.warnings.push(ResolutionWarning {
                    field: field.clone(),
                    reference: reference.clone(),
                    reason,
                });
                Value::Null
            }
        };
        resolved.values.insert(field.clone(), value);
    }

    resolved
}

/// Resolve a single reference. Literals (no surrounding braces) come back verbatim.
pub fn resolve_reference(reference: &str, prior_results: &PriorResults) -> Result<Value, String> {
    let trimmed = reference.trim();
    let expression = match trimmed
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
    {
        Some(expression) => expression.trim(),
        None => return Ok(Value::String(reference.to_string())),
    };

    let mut segments = parse_path(expression)?.into_iter();
    let head = segments
        .next()
        .ok_or_else(|| "empty reference".to_string())?;
    let tool_id = head
        .key
        .as_deref()
        .ok_or_else(|| "reference must start with a tool id".to_string())?;

    let mut current = prior_results
        .get(tool_id)
        .ok_or_else(|| format!("no result for tool '{}'", tool_id))?;
    current = apply_indices(current, tool_id, &head.indices)?;

    for segment in segments {
        if let Some(key) = &segment.key {
            current = match current {
                Value::Object(map) => map
                    .get(key)
                    .ok_or_else(|| format!("missing key '{}'", key))?,
                other => {
                    return Err(format!(
                        "cannot read key '{}' from {}",
                        key,
                        type_name(other)
                    ))
                }
            };
        }
        current = apply_indices(current, segment.key.as_deref().unwrap_or(""), &segment.indices)?;
    }

    Ok(current.clone())
}

fn apply_indices<'v>(value: &'v Value, label: &str, indices: &[usize]) -> Result<&'v Value, String> {
    let mut current = value;
    for index in indices {
        current = match current {
            Value::Array(items) => items.get(*index).ok_or_else(|| {
                format!(
                    "index {} out of range for '{}' (len {})",
                    index,
                    label,
                    items.len()
                )
            })?,
            other => {
                return Err(format!(
                    "cannot index {} at '{}'",
                    type_name(other),
                    label
                ))
            }
        };
    }
    Ok(current)
}

fn parse_path(expression: &str) -> Result<Vec<Segment>, String> {
    expression
        .split('.')
        .map(|raw| {
            let raw = raw.trim();
            let (key, mut rest) = match raw.find('[') {
                Some(pos) => (&raw[..pos], &raw[pos..]),
                None => (raw, ""),
            };

            let mut indices = Vec::new();
            while !rest.is_empty() {
                let close = rest
                    .find(']')
                    .filter(|_| rest.starts_with('['))
                    .ok_or_else(|| format!("malformed segment '{}'", raw))?;
                let index = rest[1..close]
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| format!("invalid index in segment '{}'", raw))?;
                indices.push(index);
                rest = &rest[close + 1..];
            }

            if key.is_empty() && indices.is_empty() {
                return Err(format!("empty segment in '{}'", expression));
            }

            Ok(Segment {
                key: (!key.is_empty()).then(|| key.to_string()),
                indices,
            })
        })
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
