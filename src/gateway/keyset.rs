//! Cached view of the controller's published verification keys.
//!
//! The gateway never verifies tokens over the network: keys are fetched
//! from the controller's JWKS endpoint, parsed once, and served from memory
//! until the refresh interval lapses. A refresh failure falls back to the
//! stale set so a controller outage does not take down attaches for
//! already-minted tokens.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;

use crate::signer::{JwksDocument, KeySet};

#[derive(Debug, Error)]
pub enum KeySetError {
    #[error("JWKS fetch failed: {0}")]
    Fetch(String),

    #[error("JWKS document invalid: {0}")]
    Invalid(String),
}

struct Cached {
    keys: Arc<KeySet>,
    fetched_at: Instant,
}

pub struct KeySetCache {
    client: Option<reqwest::Client>,
    jwks_url: String,
    refresh: Duration,
    cached: RwLock<Option<Cached>>,
}

impl KeySetCache {
    /// Cache backed by the controller's JWKS endpoint, refreshed at most
    /// every `refresh` (kept at or below the document's five-minute
    /// cacheability).
    pub fn new(controller_url: &str, refresh: Duration) -> Result<Self, KeySetError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| KeySetError::Fetch(e.to_string()))?;
        Ok(Self {
            client: Some(client),
            jwks_url: format!(
                "{}/.well-known/jwks.json",
                controller_url.trim_end_matches('/')
            ),
            refresh: refresh.min(Duration::from_secs(300)),
            cached: RwLock::new(None),
        })
    }

    /// Cache pinned to a fixed key set; never refreshes. Used by tests and
    /// single-binary deployments where the signer lives in-process.
    pub fn with_static(keys: KeySet) -> Self {
        Self {
            client: None,
            jwks_url: String::new(),
            refresh: Duration::MAX,
            cached: RwLock::new(Some(Cached {
                keys: Arc::new(keys),
                fetched_at: Instant::now(),
            })),
        }
    }

    /// Returns the current key set, fetching or refreshing as needed.
    pub async fn current(&self) -> Result<Arc<KeySet>, KeySetError> {
        if let Some(cached) = self.fresh() {
            return Ok(cached);
        }

        match self.fetch().await {
            Ok(keys) => {
                let keys = Arc::new(keys);
                *self.cached.write() = Some(Cached {
                    keys: keys.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(keys)
            }
            Err(e) => {
                // Serve stale keys over failing closed: tokens are short
                // lived and the key is stable for the controller's process
                // lifetime.
                if let Some(stale) = self.any() {
                    tracing::warn!(error = %e, "JWKS refresh failed, serving cached keys");
                    return Ok(stale);
                }
                Err(e)
            }
        }
    }

    fn fresh(&self) -> Option<Arc<KeySet>> {
        let guard = self.cached.read();
        let cached = guard.as_ref()?;
        if self.refresh == Duration::MAX || cached.fetched_at.elapsed() < self.refresh {
            Some(cached.keys.clone())
        } else {
            None
        }
    }

    fn any(&self) -> Option<Arc<KeySet>> {
        self.cached.read().as_ref().map(|c| c.keys.clone())
    }

    async fn fetch(&self) -> Result<KeySet, KeySetError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| KeySetError::Fetch("static key set cannot refresh".into()))?;
        let response = client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| KeySetError::Fetch(format!("{}: {}", self.jwks_url, e)))?;
        if !response.status().is_success() {
            return Err(KeySetError::Fetch(format!(
                "{} returned {}",
                self.jwks_url,
                response.status()
            )));
        }
        let doc: JwksDocument = response
            .json()
            .await
            .map_err(|e| KeySetError::Invalid(e.to_string()))?;
        KeySet::from_jwks(&doc).map_err(|e| KeySetError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::Signer;

    #[tokio::test]
    async fn static_cache_serves_keys() {
        let signer = Signer::generate();
        let cache = KeySetCache::with_static(signer.keyset());

        let keys = cache.current().await.unwrap();
        let issued = signer
            .issue("sess", "owner", Duration::from_secs(60))
            .unwrap();
        assert!(keys.verify(&issued.token).is_ok());
    }

    #[tokio::test]
    async fn static_cache_never_expires() {
        let signer = Signer::generate();
        let cache = KeySetCache::with_static(signer.keyset());
        for _ in 0..3 {
            assert!(cache.current().await.is_ok());
        }
    }

    #[tokio::test]
    async fn unreachable_controller_without_cache_errors() {
        let cache = KeySetCache::new("http://127.0.0.1:1", Duration::from_secs(60)).unwrap();
        let err = cache.current().await.unwrap_err();
        assert!(matches!(err, KeySetError::Fetch(_)));
    }

    #[test]
    fn refresh_is_capped_at_five_minutes() {
        let cache = KeySetCache::new("http://localhost:8080", Duration::from_secs(3600)).unwrap();
        assert_eq!(cache.refresh, Duration::from_secs(300));
    }

    #[test]
    fn jwks_url_is_well_known_path() {
        let cache = KeySetCache::new("http://controller:8080/", Duration::from_secs(60)).unwrap();
        assert_eq!(
            cache.jwks_url,
            "http://controller:8080/.well-known/jwks.json"
        );
    }
}
