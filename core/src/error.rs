//! Error types and HTTP response mapping

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, ApiError>;

/// Which identity-token check rejected the token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationFailure {
    Signature,
    Issuer,
    Audience,
    Expired,
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Signature => "signature",
            Self::Issuer => "issuer",
            Self::Audience => "audience",
            Self::Expired => "expired",
        })
    }
}

/// Permission request rejected by the boundary check or the scoper
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("unknown permission '{name}'")]
    UnknownPermission { name: String },

    #[error("invalid access level '{level}' for permission '{name}'")]
    InvalidLevel { name: String, level: String },

    #[error("permission '{name}' is not configured for this application")]
    NotConfigured { name: String },

    #[error("effective permissions exceed the configured maximum: {names}")]
    Escalation { names: String },

    #[error("no permissions to grant")]
    NothingGranted,
}

/// Failure to produce a signing key for a key identifier
#[derive(Error, Debug, Clone)]
pub enum KeyCacheError {
    #[error("failed to fetch signing keys{}: {message}", status_suffix(.status))]
    Fetch { status: Option<u16>, message: String },

    #[error("invalid signing key material: {message}")]
    Parse { message: String },

    #[error("signing key '{kid}' not found")]
    NotFound { kid: String },

    #[error("signing key fetch rate exceeded, retry after {}ms", .retry_after.as_millis())]
    RateLimited { retry_after: Duration },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

/// Pipeline error with HTTP status code mapping
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid authorization header: {message}")]
    AuthHeader { message: String },

    #[error("malformed token: {message}")]
    MalformedToken { message: String },

    #[error("signing key unavailable: {0}")]
    KeyUnavailable(#[from] KeyCacheError),

    #[error("token verification failed ({reason}): {message}")]
    Verification {
        reason: VerificationFailure,
        message: String,
    },

    #[error("missing repository information in token: {message}")]
    MissingClaims { message: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("no installation found for owner '{owner}'")]
    InstallationNotFound { owner: String },

    #[error("repository not found: {owner}/{repo}")]
    RepositoryNotFound { owner: String, repo: String },

    #[error("permission request rejected: {0}")]
    Policy(#[from] PolicyError),

    #[error("upstream error{}: {message}", status_suffix(.status))]
    Upstream { status: Option<u16>, message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ApiError {
    pub fn auth_header(message: impl Into<String>) -> Self {
        Self::AuthHeader {
            message: message.into(),
        }
    }

    pub fn malformed_token(message: impl Into<String>) -> Self {
        Self::MalformedToken {
            message: message.into(),
        }
    }

    pub fn verification(reason: VerificationFailure, message: impl Into<String>) -> Self {
        Self::Verification {
            reason,
            message: message.into(),
        }
    }

    pub fn missing_claims(message: impl Into<String>) -> Self {
        Self::MissingClaims {
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn installation_not_found(owner: impl Into<String>) -> Self {
        Self::InstallationNotFound {
            owner: owner.into(),
        }
    }

    pub fn repository_not_found(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self::RepositoryNotFound {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Upstream answered with an unexpected status
    pub fn upstream_status(status: u16, message: impl Into<String>) -> Self {
        Self::Upstream {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Upstream could not be reached or its answer could not be read
    pub fn upstream_error(message: impl Into<String>) -> Self {
        Self::Upstream {
            status: None,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::AuthHeader { .. }
            | Self::MalformedToken { .. }
            | Self::MissingClaims { .. }
            | Self::InvalidRequest { .. }
            | Self::Policy(_) => 400,
            Self::KeyUnavailable(_) | Self::Verification { .. } => 403,
            // Resolution failures stay 500-class for compatibility with existing callers
            Self::InstallationNotFound { .. }
            | Self::RepositoryNotFound { .. }
            | Self::Upstream { .. }
            | Self::Internal { .. } => 500,
        }
    }

    /// Get the stable machine-readable key for this error
    pub fn error_key(&self) -> &'static str {
        match self {
            Self::AuthHeader { .. } => "auth_header",
            Self::MalformedToken { .. } => "malformed_token",
            Self::KeyUnavailable(_) => "key_unavailable",
            Self::Verification { .. } => "verification_failed",
            Self::MissingClaims { .. } => "missing_claims",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::InstallationNotFound { .. } => "installation_not_found",
            Self::RepositoryNotFound { .. } => "repository_not_found",
            Self::Policy(_) => "policy_error",
            Self::Upstream { .. } => "upstream_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Caller-visible error category
    pub fn category(&self) -> &'static str {
        match self {
            Self::KeyUnavailable(_) | Self::Verification { .. } => "Token verification failed",
            Self::InstallationNotFound { .. }
            | Self::RepositoryNotFound { .. }
            | Self::Upstream { .. } => "Failed to generate token",
            Self::Internal { .. } => "Internal server error",
            _ => "Failed to process request",
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: String,
}

impl From<&ApiError> for ErrorResponse {
    fn from(err: &ApiError) -> Self {
        Self {
            error: err.category().to_string(),
            details: err.to_string(),
        }
    }
}
