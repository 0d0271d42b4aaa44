// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Policy Loader - parses the declarative rule file into a validated
//! [`PolicyConfig`] snapshot. Loaded once at startup; there is no hot reload.

use std::path::Path;
use tracing::info;

use crate::domain::policy::{PolicyConfig, PolicyError};

pub struct PolicyLoader;

impl PolicyLoader {
    pub fn from_file(path: impl AsRef<Path>) -> Result<PolicyConfig, PolicyError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| PolicyError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = Self::from_yaml_str(&content)?;
        info!(
            path = %path.display(),
            policies = config.policies.len(),
            default_effect = %config.default_effect,
            "Loaded policy configuration"
        );
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<PolicyConfig, PolicyError> {
        let config: PolicyConfig =
            serde_yaml::from_str(yaml).map_err(|e| PolicyError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
