//! Effective permission computation
//!
//! Caps requested permissions at the application's configured maximum.

use async_trait::async_trait;
use serde::Deserialize;

use super::types::{AccessLevel, Permission, PermissionSet};
use crate::error::{ApiError, PolicyError, Result};

/// Computes the permission set a minted credential will carry
#[async_trait]
pub trait PermissionScoper: Send + Sync {
    /// Must never return a level above the configured maximum, and must
    /// reject names that are not configured. `requested == None` yields the
    /// configured default set.
    async fn effective_permissions(
        &self,
        owner: &str,
        repository: &str,
        requested: Option<&PermissionSet>,
    ) -> Result<PermissionSet>;
}

/// Application permission configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PermissionsConfig {
    /// Granted when the caller does not ask for anything specific
    pub default: PermissionSet,
    /// Ceiling for every permission; names absent here are never granted
    pub maximum: PermissionSet,
}

impl PermissionsConfig {
    /// Parse and validate a YAML (or JSON) permission configuration
    pub fn from_yaml(source: &str) -> Result<Self> {
        let config: PermissionsConfig = serde_yaml::from_str(source)
            .map_err(|e| ApiError::internal(format!("invalid permissions config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.default.is_empty() || self.maximum.is_empty() {
            return Err(ApiError::internal(
                "invalid permissions config: default and maximum must not be empty",
            ));
        }

        let over = self.default.exceeds(&self.maximum);
        if !over.is_empty() {
            return Err(ApiError::internal(format!(
                "invalid permissions config: default exceeds maximum for {}",
                join_names(&over)
            )));
        }
        Ok(())
    }
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        let baseline: PermissionSet = [
            (Permission::Contents, AccessLevel::Read),
            (Permission::Metadata, AccessLevel::Read),
        ]
        .into_iter()
        .collect();

        Self {
            default: baseline.clone(),
            maximum: baseline,
        }
    }
}

/// Scoper driven purely by static [`PermissionsConfig`]
#[derive(Debug, Clone)]
pub struct ConfiguredScoper {
    config: PermissionsConfig,
}

impl ConfiguredScoper {
    pub fn new(config: PermissionsConfig) -> Self {
        Self { config }
    }

    fn scope(
        &self,
        requested: Option<&PermissionSet>,
    ) -> std::result::Result<PermissionSet, PolicyError> {
        let Some(requested) = requested else {
            return Ok(self.config.default.clone());
        };

        let mut effective = PermissionSet::new();
        for (permission, level) in requested.iter() {
            let ceiling = self
                .config
                .maximum
                .get(permission)
                .ok_or_else(|| PolicyError::NotConfigured {
                    name: permission.to_string(),
                })?;
            effective.insert(permission, level.min(ceiling));
        }
        Ok(effective)
    }
}

#[async_trait]
impl PermissionScoper for ConfiguredScoper {
    async fn effective_permissions(
        &self,
        owner: &str,
        repository: &str,
        requested: Option<&PermissionSet>,
    ) -> Result<PermissionSet> {
        let effective = self.scope(requested)?;
        tracing::debug!(
            owner,
            repository,
            permissions = %effective,
            "computed effective permissions"
        );
        Ok(effective)
    }
}

pub(crate) fn join_names(names: &[Permission]) -> String {
    names
        .iter()
        .map(Permission::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
