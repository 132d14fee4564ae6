//! GitHub App installations
//!
//! Lists the app's installations and matches a claimed account to one of them.

use serde::Deserialize;

use super::{api_headers, GITHUB_API_BASE};
use crate::error::{ApiError, Result};
use crate::platform::{Clock, HttpClient, JwtSigner};

const PER_PAGE: usize = 100;

/// Upper bound on pages read from the listing endpoint
const MAX_PAGES: usize = 100;

/// Binding between the app and one account that installed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installation {
    pub id: u64,
    pub account_login: String,
}

#[derive(Deserialize)]
struct InstallationResponse {
    id: u64,
    account: Option<AccountResponse>,
}

#[derive(Deserialize)]
struct AccountResponse {
    login: String,
}

/// List every installation of the app, authenticating as the app itself.
///
/// Follows pagination until a short page is returned.
pub async fn list_installations(
    signer: &dyn JwtSigner,
    http: &dyn HttpClient,
    clock: &dyn Clock,
) -> Result<Vec<Installation>> {
    let app_jwt = signer.sign_app_jwt(clock.now_secs() as i64).await?;
    let auth_header = format!("Bearer {}", app_jwt);
    let headers = api_headers(&auth_header);

    let mut installations = Vec::new();
    for page in 1..=MAX_PAGES {
        let url = format!(
            "{}/app/installations?per_page={}&page={}",
            GITHUB_API_BASE, PER_PAGE, page
        );

        let response = http.get(&url, &headers).await?;
        if !response.is_success() {
            return Err(ApiError::upstream_status(
                response.status,
                "failed to list app installations",
            ));
        }

        let batch: Vec<InstallationResponse> = response
            .json()
            .map_err(|e| {
                ApiError::upstream_error(format!("failed to parse installations: {}", e))
            })?;
        let short_page = batch.len() < PER_PAGE;

        installations.extend(batch.into_iter().filter_map(|i| {
            i.account.map(|account| Installation {
                id: i.id,
                account_login: account.login,
            })
        }));

        if short_page {
            return Ok(installations);
        }
    }

    tracing::warn!(
        pages = MAX_PAGES,
        count = installations.len(),
        "installation listing truncated"
    );
    Ok(installations)
}

/// Find the installation for `owner`, ignoring ASCII case. First match wins.
pub fn resolve_installation<'a>(
    owner: &str,
    installations: &'a [Installation],
) -> Result<&'a Installation> {
    installations
        .iter()
        .find(|i| i.account_login.eq_ignore_ascii_case(owner))
        .ok_or_else(|| ApiError::installation_not_found(owner))
}
