//! Permission names, access levels and permission sets

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::PolicyError;

macro_rules! permissions {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Installation permission names understood by GitHub
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum Permission {
            $(#[serde(rename = $name)] $variant,)+
        }

        impl Permission {
            pub const ALL: &'static [Permission] = &[$(Permission::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Permission::$variant => $name,)+
                }
            }
        }

        impl FromStr for Permission {
            type Err = PolicyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Permission::$variant),)+
                    _ => Err(PolicyError::UnknownPermission { name: s.to_string() }),
                }
            }
        }
    };
}

permissions! {
    Actions => "actions",
    Administration => "administration",
    Checks => "checks",
    Contents => "contents",
    Deployments => "deployments",
    Environments => "environments",
    Issues => "issues",
    Metadata => "metadata",
    Packages => "packages",
    Pages => "pages",
    PullRequests => "pull_requests",
    RepositoryHooks => "repository_hooks",
    RepositoryProjects => "repository_projects",
    SecretScanningAlerts => "secret_scanning_alerts",
    Secrets => "secrets",
    SecurityEvents => "security_events",
    Statuses => "statuses",
    VulnerabilityAlerts => "vulnerability_alerts",
    Workflows => "workflows",
    Members => "members",
    OrganizationAdministration => "organization_administration",
    OrganizationHooks => "organization_hooks",
    OrganizationProjects => "organization_projects",
    OrganizationSecrets => "organization_secrets",
    OrganizationSelfHostedRunners => "organization_self_hosted_runners",
    TeamDiscussions => "team_discussions",
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access level for a single permission, ordered `read < write < admin`.
///
/// "No access" is expressed by leaving the permission out of a [`PermissionSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Read,
    Write,
    Admin,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        }
    }

    fn parse(name: &str, level: &str) -> Result<Self, PolicyError> {
        match level {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "admin" => Ok(Self::Admin),
            _ => Err(PolicyError::InvalidLevel {
                name: name.to_string(),
                level: level.to_string(),
            }),
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mapping of permission name to access level
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeMap<Permission, AccessLevel>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a caller-supplied `{"name": "level"}` object.
    ///
    /// Every entry must name a known permission with a known level; nothing is
    /// dropped silently.
    pub fn from_requested(
        requested: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, PolicyError> {
        let mut set = Self::new();
        for (name, value) in requested {
            let permission: Permission = name.parse()?;
            let level = value.as_str().ok_or_else(|| PolicyError::InvalidLevel {
                name: name.clone(),
                level: value.to_string(),
            })?;
            set.insert(permission, AccessLevel::parse(name, level)?);
        }
        Ok(set)
    }

    pub fn insert(&mut self, permission: Permission, level: AccessLevel) -> Option<AccessLevel> {
        self.0.insert(permission, level)
    }

    pub fn get(&self, permission: Permission) -> Option<AccessLevel> {
        self.0.get(&permission).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Permission, AccessLevel)> + '_ {
        self.0.iter().map(|(p, l)| (*p, *l))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Permissions in `self` that are absent from, or above, `maximum`
    pub fn exceeds(&self, maximum: &PermissionSet) -> Vec<Permission> {
        self.iter()
            .filter(|(permission, level)| match maximum.get(*permission) {
                Some(ceiling) => *level > ceiling,
                None => true,
            })
            .map(|(permission, _)| permission)
            .collect()
    }
}

impl FromIterator<(Permission, AccessLevel)> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = (Permission, AccessLevel)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self
            .iter()
            .map(|(permission, level)| format!("{}:{}", permission, level))
            .collect();
        write!(f, "{{{}}}", entries.join(", "))
    }
}
