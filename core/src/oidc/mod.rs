//! OIDC (OpenID Connect) module
//!
//! Handles identity token verification: signing key retrieval and caching,
//! signature and claim checks.

mod jwks;
mod validate;

pub use jwks::{KeyCache, SigningKey, DEFAULT_FETCHES_PER_MINUTE, DEFAULT_KEY_CAPACITY};
pub use validate::{verify, IdentityClaims, CLOCK_SKEW_SECS};
