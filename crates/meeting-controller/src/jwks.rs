//! JWKS client for fetching and caching the Identity Provider's signing keys.
//!
//! The Identity Provider is an external collaborator (§6): the control
//! plane never issues credentials itself, it only verifies them. This
//! client fetches the Identity Provider's `/.well-known/jwks.json`
//! endpoint and caches the key set with a configurable TTL so a caller
//! can refresh [`IdentityResolver`](crate::identity::IdentityResolver)
//! periodically without a restart when keys rotate.

use common::jwt::decode_ed25519_public_key_jwk;
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::instrument;

/// Default cache TTL in seconds (5 minutes).
const DEFAULT_CACHE_TTL_SECONDS: u64 = 300;

/// Errors that can occur while fetching or decoding the JWKS document.
#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    /// The JWKS endpoint could not be reached or returned a non-success status.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),

    /// The response body was not a well-formed JWKS document.
    #[error("malformed jwks response: {0}")]
    Malformed(String),

    /// A key in the set was not a usable Ed25519 signing key.
    #[error("unusable key {kid}: {reason}")]
    UnusableKey { kid: String, reason: String },
}

/// JSON Web Key published by the Identity Provider.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type (always "OKP" for Ed25519).
    pub kty: String,

    /// Key ID, matched against a credential's `kid` header.
    pub kid: String,

    /// Curve name (always "Ed25519" for EdDSA).
    #[serde(default)]
    pub crv: Option<String>,

    /// Public key value, base64url encoded (no padding).
    #[serde(default)]
    pub x: Option<String>,

    /// Algorithm (should be "EdDSA").
    #[serde(default)]
    pub alg: Option<String>,

    /// Key use (should be "sig" for signing).
    #[serde(default, rename = "use")]
    pub key_use: Option<String>,
}

/// JWKS response from the Identity Provider.
#[derive(Debug, Clone, Deserialize)]
pub struct JwksResponse {
    /// List of JSON Web Keys.
    pub keys: Vec<Jwk>,
}

/// Cached, decoded key set with expiry time.
struct CachedKeys {
    keys: HashMap<String, DecodingKey>,
    expires_at: Instant,
}

/// JWKS client for fetching and caching the Identity Provider's public keys.
///
/// Thread-safe: `fetch_keys` always goes to the wire, `get_or_refresh`
/// serves from cache until the TTL lapses.
pub struct JwksClient {
    jwks_url: String,
    http_client: reqwest::Client,
    cache: Arc<RwLock<Option<CachedKeys>>>,
    cache_ttl: Duration,
}

impl JwksClient {
    /// Create a new client with the default cache TTL.
    #[must_use]
    pub fn new(jwks_url: String) -> Self {
        Self::with_ttl(jwks_url, Duration::from_secs(DEFAULT_CACHE_TTL_SECONDS))
    }

    /// Create a new client with a custom cache TTL.
    #[must_use]
    pub fn with_ttl(jwks_url: String, cache_ttl: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "mc.jwks", error = %e, "failed to build HTTP client with custom config, using defaults");
                reqwest::Client::new()
            });

        Self {
            jwks_url,
            http_client,
            cache: Arc::new(RwLock::new(None)),
            cache_ttl,
        }
    }

    /// Return the cached key set if it is still within its TTL, fetching a
    /// fresh one otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`JwksError`] if the cache is empty or expired and a fresh
    /// fetch fails.
    #[instrument(skip(self))]
    pub async fn get_or_refresh(&self) -> Result<HashMap<String, DecodingKey>, JwksError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.expires_at > Instant::now() {
                    return Ok(cached.keys.clone());
                }
            }
        }

        self.force_refresh().await
    }

    /// Fetch the JWKS document from the Identity Provider, decode every
    /// usable Ed25519 key, and replace the cache unconditionally.
    ///
    /// Keys that are not `OKP`/`Ed25519` signing keys, or whose `x` field
    /// fails to base64url-decode, are skipped with a warning rather than
    /// failing the whole refresh — a misconfigured or rotating-out key
    /// should not take down every other key in the set.
    ///
    /// # Errors
    ///
    /// Returns [`JwksError::Unavailable`] if the endpoint cannot be reached
    /// or returns a non-success status, and [`JwksError::Malformed`] if the
    /// response body is not a valid JWKS document.
    #[instrument(skip(self))]
    pub async fn force_refresh(&self) -> Result<HashMap<String, DecodingKey>, JwksError> {
        tracing::debug!(target: "mc.jwks", url = %self.jwks_url, "fetching jwks");

        let response = self
            .http_client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(target: "mc.jwks", error = %e, "failed to fetch jwks");
                JwksError::Unavailable(e.to_string())
            })?;

        if !response.status().is_success() {
            tracing::error!(target: "mc.jwks", status = %response.status(), "jwks endpoint returned error");
            return Err(JwksError::Unavailable(format!(
                "jwks endpoint returned {}",
                response.status()
            )));
        }

        let jwks: JwksResponse = response.json().await.map_err(|e| {
            tracing::error!(target: "mc.jwks", error = %e, "failed to parse jwks response");
            JwksError::Malformed(e.to_string())
        })?;

        let keys = decode_keys(jwks);

        tracing::info!(target: "mc.jwks", key_count = keys.len(), "jwks cache refreshed");

        let mut cache = self.cache.write().await;
        *cache = Some(CachedKeys {
            keys: keys.clone(),
            expires_at: Instant::now() + self.cache_ttl,
        });

        Ok(keys)
    }
}

/// Decode every usable Ed25519 key in a JWKS response into a `kid -> DecodingKey` map.
///
/// `jsonwebtoken::DecodingKey::from_ed_der` in this codebase's EdDSA usage
/// takes the raw 32-byte Ed25519 public key, not an ASN.1 DER envelope, so
/// the `x` field only needs a base64url decode.
fn decode_keys(jwks: JwksResponse) -> HashMap<String, DecodingKey> {
    let mut keys = HashMap::new();
    for jwk in jwks.keys {
        match decode_one_key(&jwk) {
            Ok(key) => {
                keys.insert(jwk.kid.clone(), key);
            }
            Err(err) => {
                tracing::warn!(target: "mc.jwks", kid = %jwk.kid, error = %err, "skipping unusable jwks entry");
            }
        }
    }
    keys
}

fn decode_one_key(jwk: &Jwk) -> Result<DecodingKey, JwksError> {
    if jwk.kty != "OKP" {
        return Err(JwksError::UnusableKey {
            kid: jwk.kid.clone(),
            reason: format!("unsupported kty: {}", jwk.kty),
        });
    }
    if let Some(crv) = &jwk.crv {
        if crv != "Ed25519" {
            return Err(JwksError::UnusableKey {
                kid: jwk.kid.clone(),
                reason: format!("unsupported curve: {crv}"),
            });
        }
    }

    let x = jwk.x.as_ref().ok_or_else(|| JwksError::UnusableKey {
        kid: jwk.kid.clone(),
        reason: "missing x".to_string(),
    })?;

    let raw = decode_ed25519_public_key_jwk(x).map_err(|e| JwksError::UnusableKey {
        kid: jwk.kid.clone(),
        reason: format!("x is not valid base64url: {e}"),
    })?;

    if raw.len() != 32 {
        return Err(JwksError::UnusableKey {
            kid: jwk.kid.clone(),
            reason: format!("expected a 32-byte Ed25519 public key, got {}", raw.len()),
        });
    }

    Ok(DecodingKey::from_ed_der(&raw))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use base64::Engine;

    fn sample_key_base64url() -> String {
        let raw = [7u8; 32];
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
    }

    #[test]
    fn jwk_deserialization() {
        let json = r#"{
            "kty": "OKP",
            "kid": "test-key-01",
            "crv": "Ed25519",
            "x": "dGVzdC1wdWJsaWMta2V5LWRhdGE",
            "alg": "EdDSA",
            "use": "sig"
        }"#;

        let jwk: Jwk = serde_json::from_str(json).expect("should parse");
        assert_eq!(jwk.kty, "OKP");
        assert_eq!(jwk.kid, "test-key-01");
        assert_eq!(jwk.crv, Some("Ed25519".to_string()));
        assert_eq!(jwk.alg, Some("EdDSA".to_string()));
        assert_eq!(jwk.key_use, Some("sig".to_string()));
    }

    #[test]
    fn jwks_response_deserialization() {
        let json = r#"{
            "keys": [
                {"kty": "OKP", "kid": "key-1"},
                {"kty": "OKP", "kid": "key-2"}
            ]
        }"#;

        let jwks: JwksResponse = serde_json::from_str(json).expect("should parse");
        assert_eq!(jwks.keys.len(), 2);
    }

    #[test]
    fn decode_keys_skips_non_ed25519_entries() {
        let jwks = JwksResponse {
            keys: vec![
                Jwk {
                    kty: "OKP".to_string(),
                    kid: "good".to_string(),
                    crv: Some("Ed25519".to_string()),
                    x: Some(sample_key_base64url()),
                    alg: Some("EdDSA".to_string()),
                    key_use: Some("sig".to_string()),
                },
                Jwk {
                    kty: "RSA".to_string(),
                    kid: "bad-kty".to_string(),
                    crv: None,
                    x: None,
                    alg: None,
                    key_use: None,
                },
                Jwk {
                    kty: "OKP".to_string(),
                    kid: "bad-x".to_string(),
                    crv: Some("Ed25519".to_string()),
                    x: Some("not base64url!!".to_string()),
                    alg: None,
                    key_use: None,
                },
            ],
        };

        let keys = decode_keys(jwks);
        assert_eq!(keys.len(), 1);
        assert!(keys.contains_key("good"));
    }

    #[test]
    fn decode_keys_rejects_wrong_length_keys() {
        let short = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode([1u8; 16]);
        let jwks = JwksResponse {
            keys: vec![Jwk {
                kty: "OKP".to_string(),
                kid: "too-short".to_string(),
                crv: Some("Ed25519".to_string()),
                x: Some(short),
                alg: None,
                key_use: None,
            }],
        };

        let keys = decode_keys(jwks);
        assert!(keys.is_empty());
    }

    #[test]
    fn jwks_client_creation() {
        let client = JwksClient::new("https://idp.example/.well-known/jwks.json".to_string());
        assert_eq!(client.jwks_url, "https://idp.example/.well-known/jwks.json");
    }

    #[test]
    fn jwks_client_custom_ttl() {
        let client = JwksClient::with_ttl(
            "https://idp.example/.well-known/jwks.json".to_string(),
            Duration::from_secs(60),
        );
        assert_eq!(client.cache_ttl, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn get_or_refresh_returns_unavailable_when_unreachable() {
        let client = JwksClient::with_ttl(
            "http://127.0.0.1:1/.well-known/jwks.json".to_string(),
            Duration::from_secs(60),
        );
        let result = client.get_or_refresh().await;
        assert!(matches!(result, Err(JwksError::Unavailable(_))));
    }
}
