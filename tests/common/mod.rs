//! Common test utilities for E2E tests

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tempfile::TempDir;

use tidecast::config::{
    AppConfig, DatabaseConfig, DeliveryConfig, FederationConfig, LoggingConfig, RateLimitConfig,
    ServerConfig, SignatureConfig,
};
use tidecast::data::{Actor, Database, EntityId};
use tidecast::federation::{
    ActivityBuilder, DeliveryScheduler, DeliveryTransport, InboxRouter, Outbox, PublicKeyCache,
    SignatureHeaders, TransportResult,
};
use tidecast::interfaces::{
    ContentIngest, FollowerDirectory, IngestError, KeyProvider, ModerationHook, Verdict,
};

pub const LOCAL_BASE: &str = "https://local.example";
pub const INSTANCE_ACTOR: &str = "https://local.example/actor";
pub const REMOTE_ACTOR: &str = "https://remote.example/users/alice";
pub const REMOTE_KEY_ID: &str = "https://remote.example/users/alice#main-key";

/// Generate a small RSA key pair for tests
pub fn generate_keypair() -> (String, String) {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation should work");
    let public_key = RsaPublicKey::from(&private_key);

    (
        private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("private key pem")
            .to_string(),
        public_key
            .to_public_key_pem(LineEnding::LF)
            .expect("public key pem"),
    )
}

/// Test configuration pointing at a scratch database
pub fn test_config(db_path: &Path) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: "local.example".to_string(),
            protocol: "https".to_string(),
        },
        database: DatabaseConfig {
            path: db_path.to_path_buf(),
        },
        federation: FederationConfig {
            max_content_bytes: 524_288_000,
            max_duration_seconds: 180,
        },
        signature: SignatureConfig {
            clock_skew_seconds: 300,
            key_fetch_timeout_seconds: 2,
            key_cache_ttl_seconds: 3600,
        },
        delivery: DeliveryConfig {
            workers: 1,
            poll_interval_seconds: 1,
            attempt_timeout_seconds: 5,
            max_attempts: 5,
            unreachable_threshold: 3,
            unreachable_window_seconds: 86_400,
        },
        rate_limit: RateLimitConfig {
            requests_per_window: 1000,
            window_seconds: 60,
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Transport replaying scripted outcomes per endpoint
///
/// Endpoints without a script answer 200.
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<TransportResult>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, endpoint: &str, outcomes: Vec<TransportResult>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), outcomes.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryTransport for ScriptedTransport {
    async fn post_signed(
        &self,
        endpoint: &str,
        _headers: &SignatureHeaders,
        _body: &[u8],
    ) -> TransportResult {
        self.calls.lock().unwrap().push(endpoint.to_string());
        self.scripts
            .lock()
            .unwrap()
            .get_mut(endpoint)
            .and_then(|script| script.pop_front())
            .unwrap_or(TransportResult::Status(200))
    }
}

/// Ingest stub recording calls; configurable to fail validation
pub struct StubIngest {
    pub fail_with: Option<IngestError>,
    pub stored: Mutex<Vec<String>>,
}

impl StubIngest {
    pub fn accepting() -> Self {
        Self {
            fail_with: None,
            stored: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: IngestError) -> Self {
        Self {
            fail_with: Some(error),
            stored: Mutex::new(Vec::new()),
        }
    }

    pub fn stored_urls(&self) -> Vec<String> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentIngest for StubIngest {
    async fn fetch_and_store(
        &self,
        url: &str,
        _declared_size: Option<i64>,
        _declared_duration: Option<i64>,
    ) -> Result<String, IngestError> {
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }
        self.stored.lock().unwrap().push(url.to_string());
        Ok(format!("stored-{}", EntityId::new().0))
    }
}

/// Moderation stub approving everything
pub struct ApproveAll;

#[async_trait]
impl ModerationHook for ApproveAll {
    async fn review(&self, _stored_content_id: &str, _origin_actor: &str) -> Verdict {
        Verdict::Approved
    }
}

/// Fully wired federation engine over scratch storage
pub struct TestEngine {
    pub db: Arc<Database>,
    pub scheduler: Arc<DeliveryScheduler>,
    pub builder: Arc<ActivityBuilder>,
    pub outbox: Arc<Outbox>,
    pub router: Arc<InboxRouter>,
    pub key_cache: Arc<PublicKeyCache>,
    pub transport: Arc<ScriptedTransport>,
    pub ingest: Arc<StubIngest>,
    /// Remote test actor's signing key
    pub remote_private_pem: String,
    pub _temp_dir: TempDir,
}

impl TestEngine {
    pub async fn new() -> Self {
        Self::with_ingest(Arc::new(StubIngest::accepting())).await
    }

    pub async fn with_ingest(ingest: Arc<StubIngest>) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir.path().join("test.db"));
        let db = Arc::new(Database::connect(&config.database.path).await.unwrap());

        // Instance actor with a small key pair.
        let (instance_private, instance_public) = generate_keypair();
        db.insert_actor(&Actor {
            id: EntityId::new().0,
            identity: INSTANCE_ACTOR.to_string(),
            key_id: format!("{}#main-key", INSTANCE_ACTOR),
            private_key_pem: instance_private,
            public_key_pem: instance_public,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        // Remote actor whose public key is pinned in the cache, so no
        // network is needed for verification.
        let (remote_private_pem, remote_public_pem) = generate_keypair();
        let http_client = Arc::new(
            reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(2))
                .build()
                .unwrap(),
        );
        let key_cache = Arc::new(PublicKeyCache::new(
            Arc::clone(&http_client),
            None,
            Some(std::time::Duration::from_secs(2)),
        ));
        key_cache.insert(REMOTE_KEY_ID, remote_public_pem).await;

        let transport = Arc::new(ScriptedTransport::new());
        let scheduler = Arc::new(DeliveryScheduler::new(
            Arc::clone(&db),
            db.clone() as Arc<dyn KeyProvider>,
            transport.clone(),
            config.delivery.clone(),
        ));

        let builder = Arc::new(ActivityBuilder::new(
            db.clone() as Arc<dyn KeyProvider>,
            LOCAL_BASE.to_string(),
        ));

        let outbox = Arc::new(Outbox::new(
            Arc::clone(&db),
            Arc::clone(&builder),
            Arc::clone(&scheduler),
            db.clone() as Arc<dyn FollowerDirectory>,
        ));

        let router = Arc::new(InboxRouter::new(
            Arc::clone(&db),
            Arc::clone(&key_cache),
            ingest.clone(),
            Arc::new(ApproveAll),
            db.clone() as Arc<dyn FollowerDirectory>,
            Arc::clone(&scheduler),
            Arc::clone(&builder),
            http_client,
            INSTANCE_ACTOR.to_string(),
            config.federation.clone(),
            config.signature.clock_skew_seconds,
        ));

        Self {
            db,
            scheduler,
            builder,
            outbox,
            router,
            key_cache,
            transport,
            ingest,
            remote_private_pem,
            _temp_dir: temp_dir,
        }
    }

    /// Sign a body as the remote test actor and build the header map
    pub fn signed_headers(&self, body: &[u8]) -> http::HeaderMap {
        signed_headers_with_key(body, &self.remote_private_pem, REMOTE_KEY_ID)
    }
}

/// Sign a body for POST /inbox and assemble the request headers
pub fn signed_headers_with_key(
    body: &[u8],
    private_key_pem: &str,
    key_id: &str,
) -> http::HeaderMap {
    let signed = tidecast::federation::sign_request(
        "POST",
        &format!("{}/inbox", LOCAL_BASE),
        Some(body),
        private_key_pem,
        key_id,
    )
    .expect("request signs");

    let mut headers = http::HeaderMap::new();
    headers.insert(
        "host",
        http::HeaderValue::from_static("local.example"),
    );
    headers.insert(
        "date",
        http::HeaderValue::from_str(&signed.date).expect("date header"),
    );
    if let Some(digest) = signed.digest {
        headers.insert(
            "digest",
            http::HeaderValue::from_str(&digest).expect("digest header"),
        );
    }
    headers.insert(
        "signature",
        http::HeaderValue::from_str(&signed.signature).expect("signature header"),
    );

    headers
}
