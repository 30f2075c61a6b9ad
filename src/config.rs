//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub signature: SignatureConfig,
    pub delivery: DeliveryConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "video.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://video.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federated content limits
///
/// Inbound Create activities are validated against the same limits
/// enforced for local submissions.
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Maximum declared content size in bytes (default: 500 MB)
    pub max_content_bytes: i64,
    /// Maximum declared duration in seconds (default: 180)
    pub max_duration_seconds: i64,
}

/// HTTP signature configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SignatureConfig {
    /// Maximum accepted clock skew on the Date header in seconds
    pub clock_skew_seconds: i64,
    /// Timeout for remote public key fetches in seconds
    pub key_fetch_timeout_seconds: u64,
    /// TTL for cached public keys in seconds
    pub key_cache_ttl_seconds: u64,
}

impl SignatureConfig {
    pub fn key_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.key_fetch_timeout_seconds)
    }

    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl_seconds)
    }
}

/// Outbound delivery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers
    pub workers: usize,
    /// How often idle workers poll for due records, in seconds
    pub poll_interval_seconds: u64,
    /// Per-attempt HTTP timeout in seconds
    pub attempt_timeout_seconds: u64,
    /// Attempts before a record becomes failed_exhausted
    pub max_attempts: i64,
    /// Consecutive exhausted records before an endpoint is flagged
    pub unreachable_threshold: i64,
    /// Window for the unreachable check in seconds
    pub unreachable_window_seconds: i64,
}

impl DeliveryConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }
}

/// Inbound rate limit configuration (per remote domain)
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub requests_per_window: u32,
    /// Window length in seconds
    pub window_seconds: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (TIDECAST_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("federation.max_content_bytes", 524_288_000i64)?
            .set_default("federation.max_duration_seconds", 180)?
            .set_default("signature.clock_skew_seconds", 300)?
            .set_default("signature.key_fetch_timeout_seconds", 5)?
            .set_default("signature.key_cache_ttl_seconds", 3600)?
            .set_default("delivery.workers", 4)?
            .set_default("delivery.poll_interval_seconds", 1)?
            .set_default("delivery.attempt_timeout_seconds", 30)?
            .set_default("delivery.max_attempts", 5)?
            .set_default("delivery.unreachable_threshold", 3)?
            .set_default("delivery.unreachable_window_seconds", 86_400)?
            .set_default("rate_limit.requests_per_window", 120)?
            .set_default("rate_limit.window_seconds", 60)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (TIDECAST_*)
            .add_source(
                Environment::with_prefix("TIDECAST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.federation.max_content_bytes <= 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_content_bytes must be greater than 0".to_string(),
            ));
        }

        if self.federation.max_duration_seconds <= 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if self.delivery.workers == 0 {
            return Err(crate::error::AppError::Config(
                "delivery.workers must be greater than 0".to_string(),
            ));
        }

        if self.delivery.max_attempts <= 0 {
            return Err(crate::error::AppError::Config(
                "delivery.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.signature.clock_skew_seconds <= 0 {
            return Err(crate::error::AppError::Config(
                "signature.clock_skew_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/tidecast-test.db"),
            },
            federation: FederationConfig {
                max_content_bytes: 524_288_000,
                max_duration_seconds: 180,
            },
            signature: SignatureConfig {
                clock_skew_seconds: 300,
                key_fetch_timeout_seconds: 5,
                key_cache_ttl_seconds: 3600,
            },
            delivery: DeliveryConfig {
                workers: 4,
                poll_interval_seconds: 1,
                attempt_timeout_seconds: 30,
                max_attempts: 5,
                unreachable_threshold: 3,
                unreachable_window_seconds: 86_400,
            },
            rate_limit: RateLimitConfig {
                requests_per_window: 120,
                window_seconds: 60,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_defaults() {
        let config = valid_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.base_url(), "http://localhost");
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = valid_config();
        config.delivery.workers = 0;

        let error = config
            .validate()
            .expect_err("zero delivery workers must fail validation");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("delivery.workers")
        ));
    }

    #[test]
    fn validate_rejects_non_positive_content_limit() {
        let mut config = valid_config();
        config.federation.max_content_bytes = 0;

        let error = config
            .validate()
            .expect_err("zero content limit must fail validation");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("federation.max_content_bytes")
        ));
    }
}
