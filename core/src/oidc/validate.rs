//! OIDC token validation
//!
//! Verifies identity tokens against cached issuer keys and checks claims.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::jwks::KeyCache;
use crate::error::{ApiError, Result, VerificationFailure};
use crate::platform::Clock;

/// Tolerated clock drift between this service and the token issuer
pub const CLOCK_SKEW_SECS: u64 = 60;

/// Signature algorithms accepted for identity tokens. Symmetric algorithms are
/// never accepted, whatever the token header claims.
const ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::EdDSA,
];

/// Identity token claims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Issuer
    pub iss: String,

    /// Subject
    pub sub: String,

    /// Audience (can be string or array)
    #[serde(deserialize_with = "deserialize_audience")]
    pub aud: Vec<String>,

    /// Expiration time
    pub exp: u64,

    /// Issued at
    pub iat: u64,

    /// Not before (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,

    /// Owner of the repository the workflow runs in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_owner: Option<String>,

    /// Repository the workflow runs in (`owner/name`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    /// Additional claims
    #[serde(flatten)]
    pub custom_claims: HashMap<String, serde_json::Value>,
}

/// Deserialize audience as either string or array
fn deserialize_audience<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct AudienceVisitor;

    impl<'de> Visitor<'de> for AudienceVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("string or array of strings")
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Vec<String>, E>
        where
            E: de::Error,
        {
            Ok(vec![value.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Vec<String>, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut values = Vec::new();
            while let Some(value) = seq.next_element()? {
                values.push(value);
            }
            Ok(values)
        }
    }

    deserializer.deserialize_any(AudienceVisitor)
}

/// Verify an identity token and return its claims.
///
/// Checks run in a fixed order and the first failure wins: token structure,
/// header and signing key lookup, signature (asymmetric algorithms only),
/// issuer, audience, and finally the time window with [`CLOCK_SKEW_SECS`]
/// tolerance on both ends.
pub async fn verify(
    token: &str,
    expected_issuer: &str,
    expected_audience: &str,
    keys: &KeyCache,
    clock: &dyn Clock,
) -> Result<IdentityClaims> {
    if token.split('.').count() != 3 {
        return Err(ApiError::malformed_token(
            "token must have three dot-separated segments",
        ));
    }

    let header = decode_header(token)
        .map_err(|e| ApiError::malformed_token(format!("invalid JWT header: {}", e)))?;

    if !ALLOWED_ALGORITHMS.contains(&header.alg) {
        return Err(ApiError::verification(
            VerificationFailure::Signature,
            format!("algorithm {:?} is not allowed", header.alg),
        ));
    }

    let kid = header
        .kid
        .as_deref()
        .ok_or_else(|| ApiError::malformed_token("JWT missing 'kid' header"))?;

    let signing_key = keys.get_key(kid).await?;

    // Time-based and claim checks are done below so each failure is reported
    // with its own reason and against the platform clock.
    let mut validation = Validation::new(header.alg);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.set_required_spec_claims::<&str>(&[]);

    let claims = decode::<IdentityClaims>(token, signing_key.decoding_key(), &validation)
        .map_err(|e| match e.kind() {
            ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_)
            | ErrorKind::InvalidToken => {
                ApiError::malformed_token(format!("invalid JWT claims: {}", e))
            }
            _ => ApiError::verification(VerificationFailure::Signature, e.to_string()),
        })?
        .claims;

    check_issuer(&claims, expected_issuer)?;
    check_audience(&claims, expected_audience)?;
    check_time_window(&claims, clock.now_secs())?;

    tracing::debug!(
        sub = %claims.sub,
        repository = ?claims.repository,
        kid,
        "identity token verified"
    );

    Ok(claims)
}

fn check_issuer(claims: &IdentityClaims, expected: &str) -> Result<()> {
    if claims.iss != expected {
        return Err(ApiError::verification(
            VerificationFailure::Issuer,
            format!("issuer mismatch: expected '{}', got '{}'", expected, claims.iss),
        ));
    }
    Ok(())
}

fn check_audience(claims: &IdentityClaims, expected: &str) -> Result<()> {
    if !claims.aud.iter().any(|a| a == expected) {
        return Err(ApiError::verification(
            VerificationFailure::Audience,
            format!("audience mismatch: expected '{}', got {:?}", expected, claims.aud),
        ));
    }
    Ok(())
}

fn check_time_window(claims: &IdentityClaims, now_secs: u64) -> Result<()> {
    if now_secs >= claims.exp.saturating_add(CLOCK_SKEW_SECS) {
        return Err(ApiError::verification(
            VerificationFailure::Expired,
            "token has expired",
        ));
    }

    if claims.iat > now_secs + CLOCK_SKEW_SECS {
        return Err(ApiError::verification(
            VerificationFailure::Expired,
            "token issued in the future (iat claim)",
        ));
    }

    if let Some(nbf) = claims.nbf {
        if nbf > now_secs + CLOCK_SKEW_SECS {
            return Err(ApiError::verification(
                VerificationFailure::Expired,
                "token is not yet valid (nbf claim)",
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::HttpResponse;
    use crate::test_support::{
        other_key, sign_hs256, test_key, workflow_claims, MockClock, MockHttp, TEST_AUDIENCE,
        TEST_ISSUER, TEST_NOW,
    };
    use std::sync::Arc;

    fn key_cache() -> (KeyCache, Arc<MockHttp>) {
        let http = Arc::new(MockHttp::new(vec![(
            "/.well-known/jwks".to_string(),
            HttpResponse {
                status: 200,
                body: test_key().jwks_json().into_bytes(),
            },
        )]));
        (
            KeyCache::new(crate::config::GITHUB_ACTIONS_JWKS_URI, http.clone()),
            http,
        )
    }

    async fn run(token: &str, now: u64) -> Result<IdentityClaims> {
        let (keys, _) = key_cache();
        verify(token, TEST_ISSUER, TEST_AUDIENCE, &keys, &MockClock(now)).await
    }

    fn reason(result: Result<IdentityClaims>) -> VerificationFailure {
        match result {
            Err(ApiError::Verification { reason, .. }) => reason,
            other => panic!("expected verification failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_valid_token_returns_payload_claims() {
        let payload = workflow_claims();
        let token = test_key().sign(&payload);

        let claims = run(&token, TEST_NOW).await.unwrap();

        assert_eq!(serde_json::to_value(&claims).unwrap(), {
            let mut expected = payload.clone();
            expected["aud"] = serde_json::json!([TEST_AUDIENCE]);
            expected
        });
        assert_eq!(claims.repository.as_deref(), Some("acme/widgets"));
        assert_eq!(claims.repository_owner.as_deref(), Some("acme"));
        assert_eq!(claims.custom_claims["ref"], "refs/heads/main");
    }

    #[tokio::test]
    async fn test_audience_array_is_accepted() {
        let mut payload = workflow_claims();
        payload["aud"] = serde_json::json!(["other", TEST_AUDIENCE]);
        let claims = run(&test_key().sign(&payload), TEST_NOW).await.unwrap();
        assert_eq!(claims.aud.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_structure() {
        for token in ["", "abc", "a.b", "a.b.c.d"] {
            assert!(matches!(
                run(token, TEST_NOW).await,
                Err(ApiError::MalformedToken { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_malformed_structure_makes_no_key_fetch() {
        let (keys, http) = key_cache();
        let _ = verify("a.b", TEST_ISSUER, TEST_AUDIENCE, &keys, &MockClock(TEST_NOW)).await;
        assert_eq!(http.call_count(""), 0);
    }

    #[tokio::test]
    async fn test_wrong_issuer() {
        let mut payload = workflow_claims();
        payload["iss"] = serde_json::json!("https://evil.example.com");
        assert_eq!(
            reason(run(&test_key().sign(&payload), TEST_NOW).await),
            VerificationFailure::Issuer
        );
    }

    #[tokio::test]
    async fn test_wrong_audience() {
        let mut payload = workflow_claims();
        payload["aud"] = serde_json::json!("someone-else");
        assert_eq!(
            reason(run(&test_key().sign(&payload), TEST_NOW).await),
            VerificationFailure::Audience
        );
    }

    #[tokio::test]
    async fn test_issuer_checked_before_audience() {
        let mut payload = workflow_claims();
        payload["iss"] = serde_json::json!("https://evil.example.com");
        payload["aud"] = serde_json::json!("someone-else");
        assert_eq!(
            reason(run(&test_key().sign(&payload), TEST_NOW).await),
            VerificationFailure::Issuer
        );
    }

    #[tokio::test]
    async fn test_expiry_tolerance_window() {
        let token = test_key().sign(&workflow_claims());
        let exp = workflow_claims()["exp"].as_u64().unwrap();

        assert!(run(&token, exp).await.is_ok());
        assert!(run(&token, exp + CLOCK_SKEW_SECS - 1).await.is_ok());
        assert_eq!(
            reason(run(&token, exp + CLOCK_SKEW_SECS).await),
            VerificationFailure::Expired
        );
    }

    #[tokio::test]
    async fn test_issued_at_tolerance_window() {
        let token = test_key().sign(&workflow_claims());
        let iat = workflow_claims()["iat"].as_u64().unwrap();

        assert!(run(&token, iat - CLOCK_SKEW_SECS).await.is_ok());
        assert_eq!(
            reason(run(&token, iat - CLOCK_SKEW_SECS - 1).await),
            VerificationFailure::Expired
        );
    }

    #[tokio::test]
    async fn test_untrusted_key_signature() {
        // Same kid as the published key, different private key
        let token = other_key().sign_with_kid(&workflow_claims(), test_key().kid());
        assert_eq!(
            reason(run(&token, TEST_NOW).await),
            VerificationFailure::Signature
        );
    }

    #[tokio::test]
    async fn test_symmetric_algorithm_rejected_without_key_fetch() {
        let (keys, http) = key_cache();
        let token = sign_hs256(&workflow_claims(), test_key().kid());

        let result = verify(&token, TEST_ISSUER, TEST_AUDIENCE, &keys, &MockClock(TEST_NOW)).await;

        assert_eq!(reason(result), VerificationFailure::Signature);
        assert_eq!(http.call_count(""), 0);
    }

    #[tokio::test]
    async fn test_unknown_kid_is_key_unavailable() {
        let token = test_key().sign_with_kid(&workflow_claims(), "rotated-away");
        assert!(matches!(
            run(&token, TEST_NOW).await,
            Err(ApiError::KeyUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_kid_is_malformed() {
        let token = test_key().sign_without_kid(&workflow_claims());
        assert!(matches!(
            run(&token, TEST_NOW).await,
            Err(ApiError::MalformedToken { .. })
        ));
    }
}
