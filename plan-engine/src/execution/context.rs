// Execution Context
// Per-run identity, tenant, test-mode overrides and free-form metadata

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Metadata key holding the original question text
pub const META_QUESTION: &str = "question";

/// Context for one orchestration run; never shared across runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub trace_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub test_mode: bool,
    /// `"<asset_type>:<default_key>"` -> replacement reference; honoured only in test mode
    #[serde(default)]
    pub asset_overrides: BTreeMap<String, String>,
    /// Trace to compare against when replaying in test mode
    #[serde(default)]
    pub baseline_trace_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ExecutionContext {
    /// Create a context with a fresh trace id
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            test_mode: false,
            asset_overrides: BTreeMap::new(),
            baseline_trace_id: None,
            metadata: Map::new(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.asset_overrides.insert(key.into(), value.into());
        self
    }

    pub fn with_baseline(mut self, trace_id: impl Into<String>) -> Self {
        self.baseline_trace_id = Some(trace_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_question(self, question: impl Into<String>) -> Self {
        self.with_metadata(META_QUESTION, Value::String(question.into()))
    }

    /// The original question, if one was recorded
    pub fn question(&self) -> Option<&str> {
        self.metadata.get(META_QUESTION).and_then(Value::as_str)
    }

    /// Replacement for `"<asset_type>:<default_key>"`, only when in test mode
    pub fn asset_override(&self, asset_type: &str, default_key: &str) -> Option<&str> {
        if !self.test_mode {
            return None;
        }
        self.asset_overrides
            .get(&format!("{}:{}", asset_type, default_key))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_has_unique_trace_ids() {
        let a = ExecutionContext::new("t1");
        let b = ExecutionContext::new("t1");
        assert_ne!(a.trace_id, b.trace_id);
        assert_eq!(a.tenant_id, "t1");
        assert!(!a.test_mode);
    }

    #[test]
    fn test_overrides_apply_only_in_test_mode() {
        let ctx = ExecutionContext::new("t1").with_override("prompt:default", "prompt:v2");
        assert_eq!(ctx.asset_override("prompt", "default"), None);

        let ctx = ctx.with_test_mode(true);
        assert_eq!(ctx.asset_override("prompt", "default"), Some("prompt:v2"));
        assert_eq!(ctx.asset_override("screen", "default"), None);
    }

    #[test]
    fn test_question_metadata() {
        let ctx = ExecutionContext::new("t1").with_question("which servers are down?");
        assert_eq!(ctx.question(), Some("which servers are down?"));
    }
}
