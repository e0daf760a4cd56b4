// Registries
// Tool and asset registry contracts with in-memory implementations

use crate::plan::models::ToolKind;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::sync::RwLock;

// =============================================================================
// Tool registry
// =============================================================================

/// Descriptive information about a tool kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub description: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ToolInfo {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Source of tool metadata consulted by dependency inference
pub trait ToolInfoProvider: Send + Sync {
    fn tool_info(&self, kind: ToolKind) -> Option<ToolInfo>;
}

/// Tool registry built at startup and passed in explicitly
#[derive(Debug, Clone, Default)]
pub struct InMemoryToolRegistry {
    tools: HashMap<ToolKind, ToolInfo>,
}

impl InMemoryToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ToolKind, info: ToolInfo) {
        self.tools.insert(kind, info);
    }
}

impl ToolInfoProvider for InMemoryToolRegistry {
    fn tool_info(&self, kind: ToolKind) -> Option<ToolInfo> {
        self.tools.get(&kind).cloned()
    }
}

// =============================================================================
// Asset registry
// =============================================================================

/// Errors from asset loading
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("asset not found: {0}")]
    NotFound(String),

    #[error("invalid asset reference '{0}', expected '<type>:<key>'")]
    InvalidReference(String),

    #[error("asset registry unavailable: {0}")]
    Unavailable(String),
}

/// A versioned asset (prompt, policy, mapping, screen)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub asset_ref: String,
    pub asset_type: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub content: Value,
}

impl Asset {
    /// Build from a `"<type>:<key>"` reference
    pub fn new(asset_ref: impl Into<String>, content: Value) -> Result<Self, AssetError> {
        let asset_ref = asset_ref.into();
        let asset_type = split_asset_ref(&asset_ref)?.0.to_string();
        Ok(Self {
            asset_ref,
            asset_type,
            version: None,
            content,
        })
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Split `"<type>:<key>"`
pub fn split_asset_ref(asset_ref: &str) -> Result<(&str, &str), AssetError> {
    match asset_ref.split_once(':') {
        Some((asset_type, key)) if !asset_type.is_empty() && !key.is_empty() => {
            Ok((asset_type, key))
        }
        _ => Err(AssetError::InvalidReference(asset_ref.to_string())),
    }
}

/// Asset storage, consulted only by the validate stage
#[async_trait]
pub trait AssetRegistry: Send + Sync {
    async fn load_asset(&self, asset_ref: &str) -> Result<Asset, AssetError>;
}

/// Asset registry backed by a map
#[derive(Debug, Default)]
pub struct InMemoryAssetRegistry {
    assets: RwLock<HashMap<String, Asset>>,
}

impl InMemoryAssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, asset: Asset) {
        self.assets
            .write()
            .await
            .insert(asset.asset_ref.clone(), asset);
    }

    /// Build a registry holding a `"<type>:default"` asset for each given type
    pub async fn with_defaults<I, S>(asset_types: I) -> Result<Self, AssetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let registry = Self::new();
        for asset_type in asset_types {
            let asset_ref = format!("{}:default", asset_type.as_ref());
            registry.publish(Asset::new(asset_ref, Value::Null)?).await;
        }
        Ok(registry)
    }
}

#[async_trait]
impl AssetRegistry for InMemoryAssetRegistry {
    async fn load_asset(&self, asset_ref: &str) -> Result<Asset, AssetError> {
        split_asset_ref(asset_ref)?;
        self.assets
            .read()
            .await
            .get(asset_ref)
            .cloned()
            .ok_or_else(|| AssetError::NotFound(asset_ref.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_registry_lookup() {
        let mut registry = InMemoryToolRegistry::new();
        registry.register(
            ToolKind::Metric,
            ToolInfo::new("time series").with_tag("enabled", "true"),
        );

        let info = registry.tool_info(ToolKind::Metric).unwrap();
        assert_eq!(info.tags.get("enabled").map(String::as_str), Some("true"));
        assert!(registry.tool_info(ToolKind::History).is_none());
    }

    #[test]
    fn test_split_asset_ref() {
        assert_eq!(split_asset_ref("prompt:v2").unwrap(), ("prompt", "v2"));
        assert!(matches!(
            split_asset_ref("prompt"),
            Err(AssetError::InvalidReference(_))
        ));
        assert!(split_asset_ref(":v2").is_err());
    }

    #[tokio::test]
    async fn test_asset_registry_publish_and_load() {
        let registry = InMemoryAssetRegistry::new();
        registry
            .publish(
                Asset::new("screen:ops", json!({"layout": "grid"}))
                    .unwrap()
                    .with_version("3"),
            )
            .await;

        let asset = registry.load_asset("screen:ops").await.unwrap();
        assert_eq!(asset.asset_type, "screen");
        assert_eq!(asset.version.as_deref(), Some("3"));

        let err = registry.load_asset("screen:missing").await.unwrap_err();
        assert!(matches!(err, AssetError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_registry_with_defaults() {
        let registry = InMemoryAssetRegistry::with_defaults(["prompt", "policy"])
            .await
            .unwrap();
        assert!(registry.load_asset("prompt:default").await.is_ok());
        assert!(registry.load_asset("mapping:default").await.is_err());
    }
}
