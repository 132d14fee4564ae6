//! JWKS (JSON Web Key Set) handling
//!
//! Fetches signing keys from the issuer's key endpoint and caches them by key
//! identifier for the lifetime of the process.

use jsonwebtoken::jwk::{JwkSet, PublicKeyUse};
use jsonwebtoken::DecodingKey;
use moka::future::Cache;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::KeyCacheError;
use crate::platform::HttpClient;

/// Default number of distinct key identifiers kept in memory
pub const DEFAULT_KEY_CAPACITY: u64 = 64;

/// Default ceiling on upstream key fetches per minute
pub const DEFAULT_FETCHES_PER_MINUTE: u32 = 10;

/// A verified-origin public key, addressed by its key identifier
pub struct SigningKey {
    kid: String,
    key: DecodingKey,
}

impl SigningKey {
    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

/// Process-wide signing key cache.
///
/// Misses for the same key identifier that arrive concurrently share a single
/// upstream fetch. Fetches are rate limited; an exhausted budget is reported
/// as [`KeyCacheError::RateLimited`] instead of waiting. Failed lookups are
/// never cached.
pub struct KeyCache {
    jwks_uri: String,
    http: Arc<dyn HttpClient>,
    keys: Cache<String, Arc<SigningKey>>,
    limiter: FetchLimiter,
}

impl KeyCache {
    pub fn new(jwks_uri: impl Into<String>, http: Arc<dyn HttpClient>) -> Self {
        Self::with_limits(jwks_uri, http, DEFAULT_KEY_CAPACITY, DEFAULT_FETCHES_PER_MINUTE)
    }

    pub fn with_limits(
        jwks_uri: impl Into<String>,
        http: Arc<dyn HttpClient>,
        capacity: u64,
        fetches_per_minute: u32,
    ) -> Self {
        Self {
            jwks_uri: jwks_uri.into(),
            http,
            keys: Cache::builder().max_capacity(capacity).build(),
            limiter: FetchLimiter::per_minute(fetches_per_minute),
        }
    }

    /// Get the signing key for `kid`, fetching the key set on a miss
    pub async fn get_key(&self, kid: &str) -> Result<Arc<SigningKey>, KeyCacheError> {
        if let Some(key) = self.keys.get(kid).await {
            tracing::debug!(kid, "signing key cache hit");
            return Ok(key);
        }

        self.keys
            .try_get_with(kid.to_string(), self.fetch_key(kid))
            .await
            .map_err(|e| (*e).clone())
    }

    async fn fetch_key(&self, kid: &str) -> Result<Arc<SigningKey>, KeyCacheError> {
        self.limiter.try_acquire()?;

        tracing::debug!(kid, jwks_uri = %self.jwks_uri, "fetching signing keys");
        let jwks = fetch_jwks(&self.jwks_uri, self.http.as_ref()).await?;

        let jwk = jwks
            .keys
            .iter()
            .filter(|jwk| !matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)))
            .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))
            .ok_or_else(|| KeyCacheError::NotFound {
                kid: kid.to_string(),
            })?;

        let key = DecodingKey::from_jwk(jwk).map_err(|e| KeyCacheError::Parse {
            message: format!("key '{}': {}", kid, e),
        })?;

        Ok(Arc::new(SigningKey {
            kid: kid.to_string(),
            key,
        }))
    }
}

/// Fetch JWKS from a URI
async fn fetch_jwks(jwks_uri: &str, http: &dyn HttpClient) -> Result<JwkSet, KeyCacheError> {
    let response = http
        .get(
            jwks_uri,
            &[
                ("Accept", "application/json"),
                ("User-Agent", crate::USER_AGENT),
            ],
        )
        .await
        .map_err(|e| KeyCacheError::Fetch {
            status: None,
            message: e.to_string(),
        })?;

    if response.status != 200 {
        return Err(KeyCacheError::Fetch {
            status: Some(response.status),
            message: format!("unexpected response from {}", jwks_uri),
        });
    }

    response.json().map_err(|e| KeyCacheError::Parse {
        message: format!("invalid JWKS: {}", e),
    })
}

/// Token bucket guarding the key endpoint
struct FetchLimiter {
    state: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    per_sec: f64,
    last_refill: Instant,
}

impl FetchLimiter {
    fn per_minute(fetches: u32) -> Self {
        let capacity = f64::from(fetches.max(1));
        Self {
            state: Mutex::new(Bucket {
                tokens: capacity,
                capacity,
                per_sec: capacity / 60.0,
                last_refill: Instant::now(),
            }),
        }
    }

    fn try_acquire(&self) -> Result<(), KeyCacheError> {
        let mut bucket = self.state.lock();
        let now = Instant::now();
        let refill = now.duration_since(bucket.last_refill).as_secs_f64() * bucket.per_sec;
        bucket.tokens = (bucket.tokens + refill).min(bucket.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait_secs = (1.0 - bucket.tokens) / bucket.per_sec;
            Err(KeyCacheError::RateLimited {
                retry_after: Duration::from_secs_f64(wait_secs),
            })
        }
    }
}
