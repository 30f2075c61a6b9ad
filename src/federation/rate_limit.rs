//! Rate Limiting for Federation
//!
//! Per-domain fixed-window limiter applied to inbound requests before
//! any signature work is done.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::config::RateLimitConfig;
use crate::error::AppError;

/// Entries kept in memory before the oldest is evicted
const MAX_TRACKED_DOMAINS: usize = 10_000;

#[derive(Debug, Clone)]
struct WindowEntry {
    count: u32,
    window_start: Instant,
}

impl WindowEntry {
    fn expired(&self, window: Duration) -> bool {
        self.window_start.elapsed() >= window
    }
}

/// Rate limiter for inbound federation requests
pub struct RateLimiter {
    entries: Arc<RwLock<HashMap<String, WindowEntry>>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    /// Create new rate limiter from configuration
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_requests: config.requests_per_window,
            window: Duration::from_secs(config.window_seconds.max(1)),
        }
    }

    /// Check if a request from this domain is allowed
    ///
    /// # Returns
    /// Ok if allowed, `RateLimited` otherwise
    pub async fn check_and_increment(&self, domain: &str) -> Result<(), AppError> {
        let mut entries = self.entries.write().await;

        if !entries.contains_key(domain) && entries.len() >= MAX_TRACKED_DOMAINS {
            let window = self.window;
            entries.retain(|_, entry| !entry.expired(window));
            if entries.len() >= MAX_TRACKED_DOMAINS {
                // Still full after pruning: drop the oldest window.
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.window_start)
                    .map(|(key, _)| key.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }

        let entry = entries
            .entry(domain.to_string())
            .or_insert_with(|| WindowEntry {
                count: 0,
                window_start: Instant::now(),
            });

        if entry.expired(self.window) {
            entry.count = 0;
            entry.window_start = Instant::now();
        }

        if entry.count >= self.max_requests {
            return Err(AppError::RateLimited);
        }

        entry.count += 1;
        Ok(())
    }

    /// Prune expired windows
    ///
    /// Should be called periodically to bound memory.
    pub async fn prune_old(&self) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let window = self.window;
        entries.retain(|_, entry| !entry.expired(window));
        let removed = before - entries.len();

        if removed > 0 {
            tracing::debug!("Pruned {} expired rate limit windows", removed);
        }
    }
}

/// Extract a normalized domain key from an actor URI or URL
pub fn extract_domain(uri: &str) -> String {
    let trimmed = uri.trim();
    if let Ok(parsed) = url::Url::parse(trimmed) {
        if let Some(host) = parsed.host_str() {
            let host = host.trim_end_matches('.').to_ascii_lowercase();
            return match parsed.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host,
            };
        }
    }

    trimmed
        .split("://")
        .nth(1)
        .unwrap_or(trimmed)
        .split('/')
        .next()
        .unwrap_or(trimmed)
        .trim_end_matches('.')
        .to_ascii_lowercase()
}
