// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Infrastructure inventory lookup. Supplies resource tags when a caller
//! omits them from a policy request.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::domain::policy::Resource;

#[async_trait]
pub trait InventoryLookup: Send + Sync {
    async fn tags_for(&self, resource_type: &str, name: &str) -> Option<BTreeMap<String, String>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryEntry {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryDocument {
    #[serde(default)]
    pub resources: Vec<InventoryEntry>,
}

/// Inventory loaded once from a YAML file.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    entries: HashMap<(String, String), BTreeMap<String, String>>,
}

impl StaticInventory {
    pub fn from_document(document: InventoryDocument) -> Self {
        let entries = document
            .resources
            .into_iter()
            .map(|e| ((e.resource_type, e.name), e.tags))
            .collect();
        Self { entries }
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let document: InventoryDocument = serde_yaml::from_str(&content)?;
        tracing::info!(
            path = %path.as_ref().display(),
            resources = document.resources.len(),
            "Loaded infrastructure inventory"
        );
        Ok(Self::from_document(document))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl InventoryLookup for StaticInventory {
    async fn tags_for(&self, resource_type: &str, name: &str) -> Option<BTreeMap<String, String>> {
        self.entries
            .get(&(resource_type.to_string(), name.to_string()))
            .cloned()
    }
}

/// Fill in tags from the inventory when the caller sent none.
pub async fn enrich_resource(inventory: &dyn InventoryLookup, resource: &mut Resource) {
    if !resource.tags.is_empty() {
        return;
    }
    if let Some(tags) = inventory.tags_for(&resource.resource_type, &resource.name).await {
        resource.tags = tags;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> StaticInventory {
        let yaml = r#"
resources:
  - type: database
    name: orders
    tags: { environment: production, owner: payments }
  - type: kubernetes_namespace
    name: staging
    tags: { environment: staging }
"#;
        StaticInventory::from_document(serde_yaml::from_str(yaml).unwrap())
    }

    #[tokio::test]
    async fn test_enrich_fills_missing_tags() {
        let inventory = inventory();
        let mut resource = Resource::new("database", "orders");
        enrich_resource(&inventory, &mut resource).await;
        assert_eq!(resource.tags.get("environment").map(String::as_str), Some("production"));
    }

    #[tokio::test]
    async fn test_explicit_tags_win() {
        let inventory = inventory();
        let mut resource = Resource::new("database", "orders").with_tag("environment", "dev");
        enrich_resource(&inventory, &mut resource).await;
        assert_eq!(resource.tags.len(), 1);
        assert_eq!(resource.tags["environment"], "dev");
    }

    #[tokio::test]
    async fn test_unknown_resource_untouched() {
        let inventory = inventory();
        let mut resource = Resource::new("database", "unknown-db");
        enrich_resource(&inventory, &mut resource).await;
        assert!(resource.tags.is_empty());
        assert_eq!(inventory.len(), 2);
    }
}
