// Engine Configuration
// Defaults for chain parameters, concurrency limits and stage assets

use crate::error::{EngineError, EngineResult};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Asset types applied by the pipeline stages
pub const ASSET_PROMPT: &str = "prompt";
pub const ASSET_POLICY: &str = "policy";
pub const ASSET_MAPPING: &str = "mapping";
pub const ASSET_SCREEN: &str = "screen";

/// Engine-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Limit applied when a spec leaves it unset
    pub default_limit: usize,
    /// Upper bound any requested limit is clamped to
    pub max_limit: usize,
    /// Window for metric/history specs without a time range (`30m`, `24h`, `7d`)
    pub default_time_window: String,
    /// Maximum concurrent steps within a group (0 = unlimited)
    pub max_parallel_steps: usize,
    /// asset_type -> default key
    pub default_assets: BTreeMap<String, String>,
    /// Trace compared against in test mode when the context carries none
    pub baseline_trace_id: Option<String>,
    /// Truncate JSON payloads in log lines beyond this many characters
    pub max_log_value_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let default_assets = [ASSET_PROMPT, ASSET_POLICY, ASSET_MAPPING, ASSET_SCREEN]
            .into_iter()
            .map(|asset_type| (asset_type.to_string(), "default".to_string()))
            .collect();

        Self {
            default_limit: 50,
            max_limit: 1000,
            default_time_window: "24h".to_string(),
            max_parallel_steps: 0,
            default_assets,
            baseline_trace_id: None,
            max_log_value_chars: 2000,
        }
    }
}

impl EngineConfig {
    /// Load from a YAML file, or JSON when the extension is `.json`
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.default_limit == 0 {
            return Err(EngineError::Config(
                "default_limit must be greater than 0".to_string(),
            ));
        }

        if self.default_limit > self.max_limit {
            return Err(EngineError::Config(format!(
                "default_limit ({}) exceeds max_limit ({})",
                self.default_limit, self.max_limit
            )));
        }

        if parse_window(&self.default_time_window).is_none() {
            return Err(EngineError::Config(format!(
                "default_time_window '{}' is not a valid window (expected e.g. 30m, 24h, 7d)",
                self.default_time_window
            )));
        }

        Ok(())
    }

    /// Apply the default and clamp to `max_limit`
    pub fn effective_limit(&self, requested: Option<usize>) -> usize {
        requested
            .filter(|limit| *limit > 0)
            .unwrap_or(self.default_limit)
            .min(self.max_limit)
    }

    /// The default applied-asset reference for an asset type, `"<type>:<key>"`
    pub fn default_asset_ref(&self, asset_type: &str) -> Option<String> {
        self.default_assets
            .get(asset_type)
            .map(|key| format!("{}:{}", asset_type, key))
    }
}

/// Longest relative window accepted, in days
pub const MAX_WINDOW_DAYS: i64 = 36_500;

/// Parse a relative window such as `30s`, `30m`, `24h`, `7d` or `2w`.
/// Windows that overflow or exceed [`MAX_WINDOW_DAYS`] are rejected.
pub fn parse_window(window: &str) -> Option<Duration> {
    let window = window.trim();
    let unit = window.chars().last()?;
    let amount: i64 = window[..window.len() - unit.len_utf8()].trim().parse().ok()?;
    if amount <= 0 {
        return None;
    }

    let window = match unit {
        's' => Duration::try_seconds(amount),
        'm' => Duration::try_minutes(amount),
        'h' => Duration::try_hours(amount),
        'd' => Duration::try_days(amount),
        'w' => Duration::try_weeks(amount),
        _ => None,
    }?;

    (window.num_days() <= MAX_WINDOW_DAYS).then_some(window)
}
