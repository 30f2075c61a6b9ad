//! Tidecast - federation protocol engine for a federated video node
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Inbox endpoint (signed activity documents)               │
//! │  - Audit surface (delivery records, activities)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Federation Engine                          │
//! │  - Activity builder + signature engine (outbound)           │
//! │  - Delivery scheduler with retry state machine              │
//! │  - Inbox router with per-kind handlers (inbound)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! │  - External collaborators via trait seams                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for the inbox and audit surface
//! - `federation`: the protocol engine itself
//! - `data`: database layer and entity models
//! - `interfaces`: trait seams to external collaborators
//! - `config`: configuration management
//! - `error`: error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod interfaces;
pub mod metrics;

use std::sync::Arc;

use interfaces::{ContentIngest, ModerationHook};

/// Application state shared across all handlers
///
/// Cloned per request; all members are reference-counted.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Public key cache for inbound verification
    pub key_cache: Arc<federation::PublicKeyCache>,

    /// Outbound activity builder
    pub builder: Arc<federation::ActivityBuilder>,

    /// Delivery scheduler (outbound queue + workers)
    pub scheduler: Arc<federation::DeliveryScheduler>,

    /// Outbound publishing surface
    pub outbox: Arc<federation::Outbox>,

    /// Inbound activity router
    pub inbox_router: Arc<federation::InboxRouter>,

    /// Per-domain inbound rate limiter
    pub rate_limiter: Arc<federation::RateLimiter>,

    /// HTTP client for federation
    pub http_client: Arc<reqwest::Client>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Ensure the instance actor and its key pair exist
    /// 3. Wire the federation engine around the collaborator traits
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(
        config: config::AppConfig,
        ingest: Arc<dyn ContentIngest>,
        moderation: Arc<dyn ModerationHook>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent("Tidecast/0.1.0")
                .timeout(config.delivery.attempt_timeout())
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );

        let local_actor = Self::ensure_instance_actor(&db, &config).await?;

        let key_cache = Arc::new(federation::PublicKeyCache::new(
            Arc::clone(&http_client),
            Some(config.signature.key_cache_ttl()),
            Some(config.signature.key_fetch_timeout()),
        ));

        let builder = Arc::new(federation::ActivityBuilder::new(
            db.clone() as Arc<dyn interfaces::KeyProvider>,
            config.server.base_url(),
        ));

        let transport = Arc::new(federation::HttpTransport::new(Arc::clone(&http_client)));
        let scheduler = Arc::new(federation::DeliveryScheduler::new(
            Arc::clone(&db),
            db.clone() as Arc<dyn interfaces::KeyProvider>,
            transport,
            config.delivery.clone(),
        ));

        let outbox = Arc::new(federation::Outbox::new(
            Arc::clone(&db),
            Arc::clone(&builder),
            Arc::clone(&scheduler),
            db.clone() as Arc<dyn interfaces::FollowerDirectory>,
        ));

        let inbox_router = Arc::new(federation::InboxRouter::new(
            Arc::clone(&db),
            Arc::clone(&key_cache),
            ingest,
            moderation,
            db.clone() as Arc<dyn interfaces::FollowerDirectory>,
            Arc::clone(&scheduler),
            Arc::clone(&builder),
            Arc::clone(&http_client),
            local_actor,
            config.federation.clone(),
            config.signature.clock_skew_seconds,
        ));

        let rate_limiter = Arc::new(federation::RateLimiter::new(&config.rate_limit));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            key_cache,
            builder,
            scheduler,
            outbox,
            inbox_router,
            rate_limiter,
            http_client,
        })
    }

    /// Ensure the instance actor exists with a key pair
    ///
    /// The instance actor signs outbound Reject activities. Generates an
    /// RSA key pair on first start.
    ///
    /// # Returns
    /// The instance actor identity.
    async fn ensure_instance_actor(
        db: &data::Database,
        config: &config::AppConfig,
    ) -> Result<String, error::AppError> {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        let identity = format!("{}/actor", config.server.base_url());

        if db.get_actor(&identity).await?.is_some() {
            tracing::info!(%identity, "Instance actor exists");
            return Ok(identity);
        }

        tracing::info!(%identity, "Creating instance actor...");

        let mut rng = rand::thread_rng();
        let bits = 4096;
        let private_key =
            RsaPrivateKey::new(&mut rng, bits).map_err(|e| error::AppError::Internal(e.into()))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| error::AppError::Internal(e.into()))?
            .to_string();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let actor = data::Actor {
            id: data::EntityId::new().0,
            identity: identity.clone(),
            key_id: format!("{}#main-key", identity),
            private_key_pem,
            public_key_pem,
            created_at: chrono::Utc::now(),
        };
        db.insert_actor(&actor).await?;

        tracing::info!(%identity, "Instance actor created");
        Ok(identity)
    }

    /// Spawn the delivery worker pool and cache maintenance tasks
    pub fn spawn_background_tasks(&self) {
        Arc::clone(&self.scheduler).spawn_workers();

        let key_cache = Arc::clone(&self.key_cache);
        let rate_limiter = Arc::clone(&self.rate_limiter);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
            loop {
                interval.tick().await;
                key_cache.prune_expired().await;
                rate_limiter.prune_old().await;
            }
        });

        tracing::info!("Background tasks spawned");
    }
}

/// Build the Axum router with all routes.
///
/// Shared by the binary and integration tests to keep route composition
/// consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    // Inbound documents are metadata, not media; a tight body cap bounds
    // hostile payloads before any parsing.
    const MAX_INBOX_BODY_BYTES: usize = 1024 * 1024;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::federation_router())
        .layer(RequestBodyLimitLayer::new(MAX_INBOX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
