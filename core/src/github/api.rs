//! GitHub API client
//!
//! Repository lookups performed with installation credentials.

use serde::Deserialize;

use super::{api_headers, GITHUB_API_BASE};
use crate::error::{ApiError, Result};
use crate::platform::HttpClient;

/// Repository as returned by `GET /repos/{owner}/{repo}`
#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub id: u64,
    pub full_name: String,
}

/// Look up a repository with an installation token
pub async fn get_repository(
    owner: &str,
    repo: &str,
    installation_token: &str,
    http: &dyn HttpClient,
) -> Result<Repository> {
    let url = format!("{}/repos/{}/{}", GITHUB_API_BASE, owner, repo);
    let auth_header = format!("token {}", installation_token);

    let response = http.get(&url, &api_headers(&auth_header)).await?;

    match response.status {
        200 => response
            .json()
            .map_err(|e| ApiError::upstream_error(format!("failed to parse repository: {}", e))),
        404 => Err(ApiError::repository_not_found(owner, repo)),
        status => Err(ApiError::upstream_status(
            status,
            format!("failed to look up repository {}/{}", owner, repo),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{json_response, MockHttp};

    #[tokio::test]
    async fn test_get_repository() {
        let http = MockHttp::new(vec![(
            "/repos/acme/widgets".to_string(),
            json_response(
                200,
                serde_json::json!({"id": 1296269, "full_name": "Acme/widgets", "private": true}),
            ),
        )]);

        let repo = get_repository("acme", "widgets", "ghs_lookup", &http).await.unwrap();

        assert_eq!(repo.id, 1296269);
        assert_eq!(repo.full_name, "Acme/widgets");
        let request = &http.requests_to("/repos/acme/widgets")[0];
        assert_eq!(request.header("Authorization"), Some("token ghs_lookup"));
    }

    #[tokio::test]
    async fn test_get_repository_not_found() {
        let http = MockHttp::new(vec![(
            "/repos/".to_string(),
            json_response(404, serde_json::json!({"message": "Not Found"})),
        )]);

        let err = get_repository("acme", "gadgets", "ghs_lookup", &http).await.unwrap_err();
        assert_eq!(err.to_string(), "repository not found: acme/gadgets");
    }

    #[tokio::test]
    async fn test_get_repository_other_failure_keeps_status() {
        let http = MockHttp::new(vec![(
            "/repos/".to_string(),
            json_response(403, serde_json::json!({"message": "Resource not accessible"})),
        )]);

        let err = get_repository("acme", "widgets", "ghs_lookup", &http).await.unwrap_err();
        assert!(matches!(err, ApiError::Upstream { status: Some(403), .. }));
    }
}
