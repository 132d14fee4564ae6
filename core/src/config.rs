//! Configuration and secrets management

use crate::error::{ApiError, Result};
use crate::permissions::PermissionsConfig;
use crate::platform::Environment;

/// Issuer of GitHub Actions identity tokens
pub const GITHUB_ACTIONS_ISSUER: &str = "https://token.actions.githubusercontent.com";

/// Key distribution endpoint for [`GITHUB_ACTIONS_ISSUER`]
pub const GITHUB_ACTIONS_JWKS_URI: &str =
    "https://token.actions.githubusercontent.com/.well-known/jwks";

/// Application configuration loaded from environment
#[derive(Clone)]
pub struct Config {
    /// GitHub App numeric ID
    pub github_app_id: String,
    /// GitHub App private key (PEM format)
    pub github_app_private_key: String,
    /// Audience identity tokens must be minted for
    pub oidc_audience: String,
    /// Exact issuer identity tokens must carry
    pub oidc_issuer: String,
    /// Where issuer signing keys are published
    pub jwks_uri: String,
    /// Default and maximum permissions for minted credentials
    pub permissions: PermissionsConfig,
}

impl Config {
    /// Load configuration from platform environment
    pub fn from_env(env: &dyn Environment) -> Result<Self> {
        let github_app_id = env
            .get_secret("GITHUB_APP_ID")
            .map_err(|_| ApiError::internal("GITHUB_APP_ID secret not set"))?;

        // Keys injected through single-line env vars arrive with escaped newlines
        let github_app_private_key = env
            .get_secret("GITHUB_APP_PRIVATE_KEY")
            .map_err(|_| ApiError::internal("GITHUB_APP_PRIVATE_KEY secret not set"))?
            .replace("\\n", "\n");

        let oidc_audience = env
            .get_var("OIDC_AUDIENCE")
            .map_err(|_| ApiError::internal("OIDC_AUDIENCE not configured"))?;
        if oidc_audience.trim().is_empty() {
            return Err(ApiError::internal("OIDC_AUDIENCE must not be empty"));
        }

        let permissions = match env.get_var("GITHUB_APP_PERMISSIONS") {
            Ok(source) if !source.trim().is_empty() => PermissionsConfig::from_yaml(&source)?,
            _ => PermissionsConfig::default(),
        };

        Ok(Self {
            github_app_id,
            github_app_private_key,
            oidc_audience,
            oidc_issuer: GITHUB_ACTIONS_ISSUER.to_string(),
            jwks_uri: GITHUB_ACTIONS_JWKS_URI.to_string(),
            permissions,
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("github_app_id", &self.github_app_id)
            .field("github_app_private_key", &"<redacted>")
            .field("oidc_audience", &self.oidc_audience)
            .field("oidc_issuer", &self.oidc_issuer)
            .field("jwks_uri", &self.jwks_uri)
            .field("permissions", &self.permissions)
            .finish()
    }
}
