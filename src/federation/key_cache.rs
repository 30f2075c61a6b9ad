//! Public Key Caching
//!
//! Caches fetched public keys to reduce remote requests. Remote lookups
//! are bounded by a timeout and fail closed: an unresolvable key rejects
//! the request that needed it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::AppError;
use crate::metrics::{KEY_CACHE_HITS_TOTAL, KEY_CACHE_MISSES_TOTAL};

const CACHE_NAME: &str = "public_keys";

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedKey {
    /// PEM-encoded public key
    pem: String,
    /// When this entry was cached
    cached_at: Instant,
    /// TTL for this entry
    ttl: Duration,
}

impl CachedKey {
    fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Public key cache
///
/// Thread-safe cache for remote actor public keys, keyed by key ID.
pub struct PublicKeyCache {
    cache: Arc<RwLock<HashMap<String, CachedKey>>>,
    http_client: Arc<reqwest::Client>,
    default_ttl: Duration,
    /// Upper bound on a remote key fetch; lookups past this fail closed
    fetch_timeout: Duration,
}

impl PublicKeyCache {
    /// Create new public key cache
    ///
    /// # Arguments
    /// * `http_client` - HTTP client for fetching keys
    /// * `default_ttl` - TTL for cached keys (default: 1 hour)
    /// * `fetch_timeout` - Timeout for remote fetches (default: 5 seconds)
    pub fn new(
        http_client: Arc<reqwest::Client>,
        default_ttl: Option<Duration>,
        fetch_timeout: Option<Duration>,
    ) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            http_client,
            default_ttl: default_ttl.unwrap_or(Duration::from_secs(3600)),
            fetch_timeout: fetch_timeout.unwrap_or(Duration::from_secs(5)),
        }
    }

    /// Get public key for a key ID
    ///
    /// Checks cache first, fetches from the remote actor document if not
    /// cached or expired. The fetch runs under the configured timeout;
    /// hitting the timeout is an error (verification fails closed).
    ///
    /// # Returns
    /// PEM-encoded public key
    pub async fn get(&self, key_id: &str) -> Result<String, AppError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(key_id) {
                if cached.is_valid() {
                    tracing::debug!("Public key cache hit for {}", key_id);
                    KEY_CACHE_HITS_TOTAL.with_label_values(&[CACHE_NAME]).inc();
                    return Ok(cached.pem.clone());
                }
                tracing::debug!("Public key cache expired for {}", key_id);
            }
        }

        tracing::debug!("Public key cache miss for {}, fetching...", key_id);
        KEY_CACHE_MISSES_TOTAL
            .with_label_values(&[CACHE_NAME])
            .inc();

        let pem = tokio::time::timeout(
            self.fetch_timeout,
            super::signature::fetch_public_key(key_id, &self.http_client),
        )
        .await
        .map_err(|_| {
            AppError::Federation(format!("Timed out resolving public key {}", key_id))
        })??;

        {
            let mut cache = self.cache.write().await;
            cache.insert(
                key_id.to_string(),
                CachedKey {
                    pem: pem.clone(),
                    cached_at: Instant::now(),
                    ttl: self.default_ttl,
                },
            );
        }

        Ok(pem)
    }

    /// Insert a key directly (startup pinning and tests)
    pub async fn insert(&self, key_id: &str, pem: String) {
        let mut cache = self.cache.write().await;
        cache.insert(
            key_id.to_string(),
            CachedKey {
                pem,
                cached_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );
    }

    /// Invalidate a cached key
    ///
    /// Useful when a key is known to be invalid or changed.
    pub async fn invalidate(&self, key_id: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(key_id);
        tracing::debug!("Invalidated public key cache for {}", key_id);
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.read().await;
        let total = cache.len();
        let valid = cache.values().filter(|v| v.is_valid()).count();
        let expired = total - valid;

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: expired,
        }
    }

    /// Prune expired entries
    ///
    /// Should be called periodically to clean up expired entries.
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, v| v.is_valid());
        let after = cache.len();
        let removed = before - after;

        if removed > 0 {
            tracing::info!("Pruned {} expired public key cache entries", removed);
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Total number of entries
    pub total_entries: usize,
    /// Number of valid (non-expired) entries
    pub valid_entries: usize,
    /// Number of expired entries
    pub expired_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cache_expiry() {
        let client = Arc::new(reqwest::Client::new());
        let cache = PublicKeyCache::new(client, Some(Duration::from_millis(100)), None);

        cache.insert("test-key", "test-pem".to_string()).await;

        // Should be valid immediately
        let stats = cache.stats().await;
        assert_eq!(stats.valid_entries, 1);

        // Wait for expiry
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Should be expired
        let stats = cache.stats().await;
        assert_eq!(stats.expired_entries, 1);

        // Prune should remove it
        cache.prune_expired().await;
        let stats = cache.stats().await;
        assert_eq!(stats.total_entries, 0);
    }

    #[tokio::test]
    async fn test_pinned_key_served_from_cache() {
        let client = Arc::new(reqwest::Client::new());
        let cache = PublicKeyCache::new(client, None, None);

        cache
            .insert(
                "https://remote.example/users/alice#main-key",
                "pinned-pem".to_string(),
            )
            .await;

        let pem = cache
            .get("https://remote.example/users/alice#main-key")
            .await
            .expect("pinned key should resolve without network");
        assert_eq!(pem, "pinned-pem");
    }
}
