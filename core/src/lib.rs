//! token-bureau-core: platform-agnostic core of the token bureau
//!
//! This crate contains the whole exchange pipeline: identity token
//! verification against cached issuer keys, GitHub App installation
//! resolution, permission scoping and credential minting. It depends only on
//! abstract platform traits (HttpClient, Clock, Environment, JwtSigner) and
//! never touches sockets, the process environment or the system clock.

pub mod config;
pub mod error;
pub mod github;
pub mod oidc;
pub mod permissions;
pub mod platform;
pub mod sts;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

/// User-Agent sent on every outbound request
pub const USER_AGENT: &str = "token-bureau";
