//! GitHub App authentication
//!
//! Generates App JWTs and requests installation tokens.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize, Serializer};

use super::{api_headers, GITHUB_API_BASE};
use crate::error::{ApiError, Result};
use crate::permissions::{AccessLevel, Permission, PermissionSet};
use crate::platform::{Clock, HttpClient, JwtSigner};

/// GitHub App JWT claims
#[derive(Serialize, Deserialize)]
struct AppJwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// JWT signer that uses a local PEM private key
pub struct PemJwtSigner {
    app_id: String,
    key: EncodingKey,
}

impl PemJwtSigner {
    pub fn new(app_id: impl Into<String>, pem_key: &str) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(pem_key.as_bytes())
            .map_err(|e| ApiError::internal(format!("invalid private key: {}", e)))?;
        Ok(Self {
            app_id: app_id.into(),
            key,
        })
    }
}

#[async_trait]
impl JwtSigner for PemJwtSigner {
    async fn sign_app_jwt(&self, now_secs: i64) -> Result<String> {
        // Backdated to absorb clock drift with GitHub; GitHub caps exp at 10 minutes
        let claims = AppJwtClaims {
            iat: now_secs - 60,
            exp: now_secs + 600,
            iss: self.app_id.clone(),
        };

        encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| ApiError::internal(format!("failed to encode JWT: {}", e)))
    }
}

/// Short-lived, permission-scoped installation access token
#[derive(Clone, Serialize)]
pub struct Credential {
    pub token: String,
    #[serde(serialize_with = "serialize_rfc3339")]
    pub expires_at: DateTime<Utc>,
    pub installation_id: u64,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("installation_id", &self.installation_id)
            .finish()
    }
}

fn serialize_rfc3339<S: Serializer>(
    value: &DateTime<Utc>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Body of `POST /app/installations/{id}/access_tokens`
#[derive(Serialize)]
struct AccessTokenRequest<'a> {
    #[serde(skip_serializing_if = "<[u64]>::is_empty")]
    repository_ids: &'a [u64],
    permissions: &'a PermissionSet,
}

/// Installation token response from GitHub
#[derive(Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

/// Mint a credential for one repository of an installation.
///
/// A single attempt is made; failures carry the upstream status.
pub async fn mint_credential(
    installation_id: u64,
    repository_id: u64,
    permissions: &PermissionSet,
    signer: &dyn JwtSigner,
    http: &dyn HttpClient,
    clock: &dyn Clock,
) -> Result<Credential> {
    create_installation_token(
        installation_id,
        &[repository_id],
        permissions,
        signer,
        http,
        clock,
    )
    .await
}

/// Authenticate as the installation itself with read-only metadata access.
///
/// Used for lookups that have to happen before the caller's credential can be
/// scoped. Every exchange therefore mints two installation tokens: this one,
/// which never leaves the service and is not revoked, and the caller's
/// credential. The lookup token simply expires with GitHub's one-hour
/// lifetime.
pub async fn installation_lookup_token(
    installation_id: u64,
    signer: &dyn JwtSigner,
    http: &dyn HttpClient,
    clock: &dyn Clock,
) -> Result<Credential> {
    let permissions: PermissionSet = [(Permission::Metadata, AccessLevel::Read)]
        .into_iter()
        .collect();
    create_installation_token(installation_id, &[], &permissions, signer, http, clock).await
}

/// Create a GitHub installation token with scoped permissions
///
/// If `repository_ids` is non-empty, the token is restricted to those repos.
/// If empty, the token has access to all repos the installation can access.
async fn create_installation_token(
    installation_id: u64,
    repository_ids: &[u64],
    permissions: &PermissionSet,
    signer: &dyn JwtSigner,
    http: &dyn HttpClient,
    clock: &dyn Clock,
) -> Result<Credential> {
    let app_jwt = signer.sign_app_jwt(clock.now_secs() as i64).await?;

    let body = serde_json::to_vec(&AccessTokenRequest {
        repository_ids,
        permissions,
    })
    .map_err(|e| ApiError::internal(format!("failed to encode token request: {}", e)))?;

    let url = format!(
        "{}/app/installations/{}/access_tokens",
        GITHUB_API_BASE, installation_id
    );

    let auth_header = format!("Bearer {}", app_jwt);
    let response = http
        .post(&url, &api_headers(&auth_header), &body)
        .await?;

    if response.status != 201 {
        let error_body = response.text().unwrap_or_else(|_| "unknown error".to_string());
        return Err(ApiError::upstream_status(
            response.status,
            format!(
                "failed to create token for installation {}: {}",
                installation_id, error_body
            ),
        ));
    }

    let token_response: InstallationTokenResponse = response
        .json()
        .map_err(|e| ApiError::upstream_error(format!("failed to parse response: {}", e)))?;

    let expires_at = DateTime::parse_from_rfc3339(&token_response.expires_at)
        .map_err(|e| {
            ApiError::upstream_error(format!(
                "invalid expires_at '{}': {}",
                token_response.expires_at, e
            ))
        })?
        .with_timezone(&Utc);

    Ok(Credential {
        token: token_response.token,
        expires_at,
        installation_id,
    })
}
