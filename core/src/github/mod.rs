//! GitHub API module
//!
//! Handles GitHub App authentication, installation discovery and repository
//! lookups.

pub mod api;
pub mod auth;
pub mod installations;

pub(crate) const GITHUB_API_BASE: &str = "https://api.github.com";

/// Standard REST API headers for the given `Authorization` value
pub(crate) fn api_headers(authorization: &str) -> [(&str, &str); 4] {
    [
        ("Authorization", authorization),
        ("Accept", "application/vnd.github+json"),
        ("User-Agent", crate::USER_AGENT),
        ("X-GitHub-Api-Version", "2022-11-28"),
    ]
}
