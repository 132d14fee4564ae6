//! Mock implementations of platform traits for testing

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::{ApiError, Result};
use crate::platform::{Clock, Environment, HttpClient, HttpResponse};

pub const TEST_ISSUER: &str = "https://token.actions.githubusercontent.com";
pub const TEST_AUDIENCE: &str = "token-bureau";
pub const TEST_NOW: u64 = 1_706_900_000;

/// A request seen by [`MockHttp`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn json_body(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Mock HTTP client with pre-configured responses.
///
/// The first pattern contained in the request URL wins. Every request is
/// recorded, matched or not.
pub struct MockHttp {
    responses: Vec<(String, HttpResponse)>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockHttp {
    pub fn new(responses: Vec<(String, HttpResponse)>) -> Self {
        Self {
            responses,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Recorded requests whose URL contains `pattern`
    pub fn requests_to(&self, pattern: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.contains(pattern))
            .cloned()
            .collect()
    }

    pub fn call_count(&self, pattern: &str) -> usize {
        self.requests_to(pattern).len()
    }

    async fn respond(
        &self,
        method: &'static str,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<HttpResponse> {
        self.requests.lock().push(RecordedRequest {
            method,
            url: url.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.to_vec(),
        });

        // Give concurrent callers a chance to interleave
        tokio::task::yield_now().await;

        self.responses
            .iter()
            .find(|(pattern, _)| url.contains(pattern.as_str()))
            .map(|(_, response)| response.clone())
            .ok_or_else(|| {
                ApiError::upstream_error(format!("no mock response for {} {}", method, url))
            })
    }
}

#[async_trait]
impl HttpClient for MockHttp {
    async fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse> {
        self.respond("GET", url, headers, &[]).await
    }

    async fn post(&self, url: &str, headers: &[(&str, &str)], body: &[u8]) -> Result<HttpResponse> {
        self.respond("POST", url, headers, body).await
    }
}

/// JSON response helper for [`MockHttp`] routes
pub fn json_response(status: u16, body: serde_json::Value) -> HttpResponse {
    HttpResponse {
        status,
        body: body.to_string().into_bytes(),
    }
}

/// Mock clock with a fixed timestamp
pub struct MockClock(pub u64);

impl Clock for MockClock {
    fn now_secs(&self) -> u64 {
        self.0
    }
}

/// Mock environment backed by an in-memory HashMap
pub struct MockEnv {
    vars: HashMap<String, String>,
    secrets: HashMap<String, String>,
}

impl MockEnv {
    pub fn new(vars: HashMap<String, String>, secrets: HashMap<String, String>) -> Self {
        Self { vars, secrets }
    }
}

impl Environment for MockEnv {
    fn get_var(&self, name: &str) -> Result<String> {
        self.vars
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::internal(format!("variable '{}' not found", name)))
    }

    fn get_secret(&self, name: &str) -> Result<String> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::internal(format!("secret '{}' not found", name)))
    }
}

/// RSA key pair used to sign test identity tokens
pub struct TestKey {
    kid: String,
    private_pem: String,
    n: String,
    e: String,
}

impl TestKey {
    /// Generate a fresh RSA key pair at runtime (never touches disk)
    fn generate(kid: &str) -> Self {
        use rand::rngs::OsRng;
        use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
        use rsa::traits::PublicKeyParts;
        use rsa::RsaPrivateKey;

        let private_key = RsaPrivateKey::new(&mut OsRng, 2048).expect("key generation failed");
        let private_pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .expect("private key PEM export failed")
            .to_string();
        let public_key = private_key.to_public_key();

        Self {
            kid: kid.to_string(),
            private_pem,
            n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
        }
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn private_pem(&self) -> &str {
        &self.private_pem
    }

    /// A JWKS document publishing only this key
    pub fn jwks_json(&self) -> String {
        serde_json::json!({
            "keys": [{
                "kty": "RSA",
                "kid": self.kid,
                "alg": "RS256",
                "use": "sig",
                "n": self.n,
                "e": self.e,
            }]
        })
        .to_string()
    }

    pub fn sign(&self, claims: &serde_json::Value) -> String {
        self.sign_with_kid(claims, &self.kid)
    }

    pub fn sign_with_kid(&self, claims: &serde_json::Value, kid: &str) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        self.encode(&header, claims)
    }

    pub fn sign_without_kid(&self, claims: &serde_json::Value) -> String {
        self.encode(&Header::new(Algorithm::RS256), claims)
    }

    fn encode(&self, header: &Header, claims: &serde_json::Value) -> String {
        let key = EncodingKey::from_rsa_pem(self.private_pem.as_bytes()).expect("valid test key");
        encode(header, claims, &key).expect("signing should succeed")
    }
}

/// The key published in test JWKS documents
pub fn test_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(|| TestKey::generate("test-key-1"))
}

/// A key nobody publishes
pub fn other_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(|| TestKey::generate("untrusted-key"))
}

/// Sign with a shared secret, as a forged token would
pub fn sign_hs256(claims: &serde_json::Value, kid: &str) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_secret(b"not-a-public-key");
    encode(&header, claims, &key).expect("signing should succeed")
}

/// Claims of a GitHub Actions identity token for `acme/widgets`, valid at [`TEST_NOW`]
pub fn workflow_claims() -> serde_json::Value {
    serde_json::json!({
        "iss": TEST_ISSUER,
        "aud": TEST_AUDIENCE,
        "sub": "repo:acme/widgets:ref:refs/heads/main",
        "iat": TEST_NOW - 30,
        "nbf": TEST_NOW - 30,
        "exp": TEST_NOW + 300,
        "repository": "acme/widgets",
        "repository_owner": "acme",
        "ref": "refs/heads/main",
        "workflow": "release",
        "run_id": "1234567890",
    })
}
