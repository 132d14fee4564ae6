//! Token exchange pipeline
//!
//! Exchanges a GitHub Actions identity token for an installation token scoped
//! to the repository the workflow runs in.

use std::fmt;

use crate::config::Config;
use crate::error::{ApiError, PolicyError, Result};
use crate::github::{self, auth::Credential};
use crate::oidc::{self, IdentityClaims, KeyCache};
use crate::permissions::{join_names, PermissionScoper, PermissionSet};
use crate::platform::{Clock, HttpClient, JwtSigner};

/// Successful exchange response
pub type ExchangeResponse = Credential;

/// Pipeline stages, in the order they are reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    ReceivedRequest,
    TokenExtracted,
    Verified,
    RepoClaimsExtracted,
    InstallationResolved,
    RepoLookedUp,
    PermissionsScoped,
    CredentialMinted,
    Responded,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReceivedRequest => "received_request",
            Self::TokenExtracted => "token_extracted",
            Self::Verified => "verified",
            Self::RepoClaimsExtracted => "repo_claims_extracted",
            Self::InstallationResolved => "installation_resolved",
            Self::RepoLookedUp => "repo_looked_up",
            Self::PermissionsScoped => "permissions_scoped",
            Self::CredentialMinted => "credential_minted",
            Self::Responded => "responded",
        };
        f.write_str(name)
    }
}

/// Platform-neutral exchange request
#[derive(Debug)]
pub struct ExchangeRequest {
    pub bearer_token: String,
    pub permissions: Option<PermissionSet>,
}

impl ExchangeRequest {
    /// Build a request from the raw `Authorization` header and body.
    ///
    /// The header is checked first so a missing credential is reported even
    /// when the body is also broken.
    pub fn from_parts(authorization: Option<&str>, body: &[u8]) -> Result<Self> {
        let bearer_token = extract_bearer_token(authorization)?;
        let permissions = parse_requested_permissions(body)?;
        Ok(Self {
            bearer_token,
            permissions,
        })
    }
}

/// Extract the identity token from an `Authorization: Bearer ...` header
pub fn extract_bearer_token(authorization: Option<&str>) -> Result<String> {
    let header =
        authorization.ok_or_else(|| ApiError::auth_header("missing Authorization header"))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::auth_header("expected 'Bearer <token>'"))?
        .trim()
        .trim_matches(|c| c == '"' || c == '\'');

    if token.is_empty() {
        return Err(ApiError::auth_header("empty bearer token"));
    }

    Ok(token.to_string())
}

fn parse_requested_permissions(body: &[u8]) -> Result<Option<PermissionSet>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ApiError::invalid_request(format!("invalid JSON body: {}", e)))?;
    let object = value
        .as_object()
        .ok_or_else(|| ApiError::invalid_request("request body must be a JSON object"))?;

    // An empty object asks for nothing specific, same as leaving it out
    match object.get("permissions") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Object(requested)) if requested.is_empty() => Ok(None),
        Some(serde_json::Value::Object(requested)) => {
            Ok(Some(PermissionSet::from_requested(requested)?))
        }
        Some(_) => Err(ApiError::invalid_request(
            "permissions must be an object mapping permission names to access levels",
        )),
    }
}

/// Repository a workflow token was issued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoClaims {
    pub owner: String,
    pub name: String,
}

impl RepoClaims {
    /// Read owner and repository name from verified claims.
    ///
    /// Both `repository` and `repository_owner` are required. `repository`
    /// may be `owner/name` or a bare name.
    pub fn from_claims(claims: &IdentityClaims) -> Result<Self> {
        let repository = claims
            .repository
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| ApiError::missing_claims("'repository' claim is missing"))?;

        let owner = claims
            .repository_owner
            .as_deref()
            .filter(|o| !o.is_empty())
            .ok_or_else(|| ApiError::missing_claims("'repository_owner' claim is missing"))?;

        let name = repository
            .split_once('/')
            .map_or(repository, |(_, name)| name);

        if !is_valid_repo_name(name) {
            return Err(ApiError::missing_claims(format!(
                "'repository' claim has an invalid name: {}",
                repository
            )));
        }

        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

fn is_valid_repo_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Shared, process-lifetime collaborators of the pipeline
pub struct Exchange<'a> {
    pub config: &'a Config,
    pub keys: &'a KeyCache,
    pub http: &'a dyn HttpClient,
    pub clock: &'a dyn Clock,
    pub signer: &'a dyn JwtSigner,
    pub scoper: &'a dyn PermissionScoper,
}

/// Handle a token exchange request.
///
/// Stops at the first failing stage; the failure is logged with that stage.
pub async fn handle(request: ExchangeRequest, exchange: &Exchange<'_>) -> Result<ExchangeResponse> {
    let mut stage = Stage::TokenExtracted;
    let result = run(request, exchange, &mut stage).await;

    if let Err(err) = &result {
        tracing::warn!(
            stage = %stage,
            error_kind = err.error_key(),
            status = err.status_code(),
            "token exchange failed: {}",
            err
        );
    }
    result
}

async fn run(
    request: ExchangeRequest,
    exchange: &Exchange<'_>,
    stage: &mut Stage,
) -> Result<ExchangeResponse> {
    let Exchange {
        config,
        keys,
        http,
        clock,
        signer,
        scoper,
    } = *exchange;

    // 1. Validate identity token
    let claims = oidc::verify(
        &request.bearer_token,
        &config.oidc_issuer,
        &config.oidc_audience,
        keys,
        clock,
    )
    .await?;
    *stage = Stage::Verified;
    tracing::debug!(sub = %claims.sub, "identity token verified");

    // 2. Extract the repository the workflow runs in
    let repo = RepoClaims::from_claims(&claims)?;
    *stage = Stage::RepoClaimsExtracted;

    // 3. Resolve the installation for the owning account
    let installations = github::installations::list_installations(signer, http, clock).await?;
    let installation = github::installations::resolve_installation(&repo.owner, &installations)?;
    *stage = Stage::InstallationResolved;
    tracing::debug!(
        owner = %repo.owner,
        installation_id = installation.id,
        "installation resolved"
    );

    // 4. Look up the repository id with a metadata-only installation token
    let lookup =
        github::auth::installation_lookup_token(installation.id, signer, http, clock).await?;
    let repository =
        github::api::get_repository(&repo.owner, &repo.name, &lookup.token, http).await?;
    *stage = Stage::RepoLookedUp;
    tracing::debug!(
        repository = %repository.full_name,
        repository_id = repository.id,
        "repository found"
    );

    // 5. Compute effective permissions and refuse anything above the ceiling
    let effective = scoper
        .effective_permissions(&repo.owner, &repository.full_name, request.permissions.as_ref())
        .await?;
    if effective.is_empty() {
        return Err(PolicyError::NothingGranted.into());
    }
    let escalated = effective.exceeds(&config.permissions.maximum);
    if !escalated.is_empty() {
        return Err(PolicyError::Escalation {
            names: join_names(&escalated),
        }
        .into());
    }
    *stage = Stage::PermissionsScoped;

    // 6. Mint the repository-scoped credential
    let credential = github::auth::mint_credential(
        installation.id,
        repository.id,
        &effective,
        signer,
        http,
        clock,
    )
    .await?;
    *stage = Stage::CredentialMinted;

    tracing::info!(
        owner = %repo.owner,
        repository = %repository.full_name,
        installation_id = credential.installation_id,
        permissions = %effective,
        expires_at = %credential.expires_at,
        "credential minted"
    );
    *stage = Stage::Responded;

    Ok(credential)
}
