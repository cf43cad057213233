//! Identity provider key set cache
//!
//! Keys are fetched lazily, kept in memory and refetched when a token names a
//! `kid` the cache has not seen, at most once per refresh interval.

use crate::errors::{AppError, Result};
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

struct CachedKeys {
    keys: JwkSet,
    fetched_at: Option<Instant>,
}

pub struct JwksCache {
    url: String,
    client: reqwest::Client,
    cache: RwLock<CachedKeys>,
    min_refresh: Duration,
}

impl JwksCache {
    /// `fetch_timeout` bounds each key set request, which runs under the
    /// cache's write lock.
    pub fn new(url: impl Into<String>, min_refresh: Duration, fetch_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("failed to build JWKS client: {e}"),
            })?;

        Ok(Self {
            url: url.into(),
            client,
            cache: RwLock::new(CachedKeys {
                keys: JwkSet { keys: Vec::new() },
                fetched_at: None,
            }),
            min_refresh,
        })
    }

    /// Decoding key for `kid`, refreshing the set if the id is unknown
    pub async fn key_for(&self, kid: &str, alg: Algorithm) -> Result<DecodingKey> {
        if let Some(key) = self.lookup(kid, alg).await? {
            return Ok(key);
        }

        self.refresh().await?;

        self.lookup(kid, alg)
            .await?
            .ok_or_else(|| AppError::unauthenticated("signing key not recognised"))
    }

    async fn lookup(&self, kid: &str, alg: Algorithm) -> Result<Option<DecodingKey>> {
        let cache = self.cache.read().await;
        match cache.keys.find(kid) {
            Some(jwk) => decoding_key(jwk, alg).map(Some),
            None => Ok(None),
        }
    }

    async fn refresh(&self) -> Result<()> {
        let mut cache = self.cache.write().await;

        // Another request may have refreshed while this one waited
        if let Some(fetched_at) = cache.fetched_at {
            if fetched_at.elapsed() < self.min_refresh {
                debug!("JWKS refreshed recently; skipping fetch");
                return Ok(());
            }
        }

        let keys = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                warn!(error = %e, "JWKS fetch failed");
                AppError::Internal {
                    message: format!("failed to fetch signing keys: {e}"),
                }
            })?
            .json::<JwkSet>()
            .await
            .map_err(|e| AppError::Internal {
                message: format!("invalid signing key set: {e}"),
            })?;

        info!(keys = keys.keys.len(), "Fetched JWKS");
        cache.keys = keys;
        cache.fetched_at = Some(Instant::now());
        Ok(())
    }
}

/// The token's algorithm must belong to the key's family
fn decoding_key(jwk: &Jwk, alg: Algorithm) -> Result<DecodingKey> {
    let compatible = match &jwk.algorithm {
        AlgorithmParameters::RSA(_) => matches!(
            alg,
            Algorithm::RS256
                | Algorithm::RS384
                | Algorithm::RS512
                | Algorithm::PS256
                | Algorithm::PS384
                | Algorithm::PS512
        ),
        AlgorithmParameters::EllipticCurve(_) => {
            matches!(alg, Algorithm::ES256 | Algorithm::ES384)
        }
        AlgorithmParameters::OctetKeyPair(_) => alg == Algorithm::EdDSA,
        // Shared secrets are never accepted from a published key set
        AlgorithmParameters::OctetKey(_) => false,
    };

    if !compatible {
        return Err(AppError::unauthenticated("token algorithm does not match signing key"));
    }

    DecodingKey::from_jwk(jwk).map_err(|_| AppError::unauthenticated("unusable signing key"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsa_jwk() -> Jwk {
        serde_json::from_value(serde_json::json!({
            "kty": "RSA",
            "kid": "k1",
            "n": "sXchDaQebHnPiGvyDOAT4saGEUetSyo9MKLOoWFsueri23bOdgWp4Dy1WlUzewbg",
            "e": "AQAB"
        }))
        .unwrap()
    }

    #[test]
    fn test_algorithm_must_match_key_family() {
        let jwk = rsa_jwk();
        assert!(decoding_key(&jwk, Algorithm::RS256).is_ok());
        assert!(decoding_key(&jwk, Algorithm::HS256).is_err());
        assert!(decoding_key(&jwk, Algorithm::ES256).is_err());
    }

    #[test]
    fn test_symmetric_keys_rejected() {
        let jwk: Jwk = serde_json::from_value(serde_json::json!({
            "kty": "oct",
            "kid": "shared",
            "k": "c2VjcmV0"
        }))
        .unwrap();
        assert!(decoding_key(&jwk, Algorithm::HS256).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_key_set_is_an_error() {
        let cache = JwksCache::new(
            "http://127.0.0.1:9/jwks.json",
            Duration::from_secs(300),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(cache.key_for("k1", Algorithm::RS256).await.is_err());
    }

    #[tokio::test]
    async fn test_stalled_key_set_fetch_times_out() {
        // Accepts the connection and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let cache = JwksCache::new(
            format!("http://{addr}/jwks.json"),
            Duration::from_secs(300),
            Duration::from_millis(200),
        )
        .unwrap();

        let outcome =
            tokio::time::timeout(Duration::from_secs(5), cache.key_for("k1", Algorithm::RS256)).await;
        assert!(matches!(outcome, Ok(Err(AppError::Internal { .. }))));

        // The write lock was released with the failed fetch
        assert!(cache.cache.try_write().is_ok());
        server.abort();
    }
}
