//! Tidecast binary entry point

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tidecast::interfaces::{ContentIngest, IngestError, ModerationHook, Verdict};
use tidecast::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState with the local collaborator implementations
/// 4. Build Axum router
/// 5. Start HTTP server and delivery workers
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("TIDECAST__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "tidecast=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "tidecast=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting Tidecast...");

    // 2. Initialize metrics
    tidecast::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Configuration loaded"
    );

    // 4. Initialize application state
    let federated_dir = config
        .database
        .path
        .parent()
        .map(|parent| parent.join("federated"))
        .unwrap_or_else(|| PathBuf::from("data/federated"));
    let ingest = Arc::new(DiskIngest::new(
        federated_dir,
        config.federation.max_content_bytes,
    ));
    let moderation = Arc::new(QueueModeration);

    let state = AppState::new(config.clone(), ingest, moderation).await?;

    // 5. Build Axum router
    let app = tidecast::build_router(state.clone());

    // 6. Start delivery workers and maintenance tasks
    state.spawn_background_tasks();

    // 7. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app).await?;

    Ok(())
}

/// Ingest implementation storing federated media on local disk
///
/// Streams the remote media into the federated-content directory,
/// enforcing the size limit during download.
struct DiskIngest {
    directory: PathBuf,
    max_bytes: i64,
}

impl DiskIngest {
    fn new(directory: PathBuf, max_bytes: i64) -> Self {
        Self {
            directory,
            max_bytes,
        }
    }
}

#[async_trait]
impl ContentIngest for DiskIngest {
    async fn fetch_and_store(
        &self,
        url: &str,
        declared_size: Option<i64>,
        _declared_duration: Option<i64>,
    ) -> Result<String, IngestError> {
        use tokio::io::AsyncWriteExt;

        if let Some(size) = declared_size {
            if size > self.max_bytes {
                return Err(IngestError::Validation(format!(
                    "Declared size {} exceeds limit {}",
                    size, self.max_bytes
                )));
            }
        }

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| IngestError::Fetch(format!("Cannot create content directory: {}", e)))?;

        let content_id = tidecast::data::EntityId::new().0;
        let path = self.directory.join(format!("{}.media", content_id));

        let mut response = reqwest::get(url)
            .await
            .map_err(|e| IngestError::Fetch(e.to_string()))?
            .error_for_status()
            .map_err(|e| IngestError::Fetch(e.to_string()))?;

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| IngestError::Fetch(e.to_string()))?;

        let mut downloaded: i64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| IngestError::Fetch(e.to_string()))?
        {
            downloaded += chunk.len() as i64;
            if downloaded > self.max_bytes {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(IngestError::Validation(format!(
                    "Content exceeds {} bytes",
                    self.max_bytes
                )));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| IngestError::Fetch(e.to_string()))?;
        }

        file.flush()
            .await
            .map_err(|e| IngestError::Fetch(e.to_string()))?;

        tracing::info!(url, bytes = downloaded, content_id = %content_id, "Stored federated media");
        Ok(content_id)
    }
}

/// Moderation hook that queues content for later review
///
/// The actual scanning service is an external collaborator; everything
/// it has not seen yet stays pending.
struct QueueModeration;

#[async_trait]
impl ModerationHook for QueueModeration {
    async fn review(&self, stored_content_id: &str, origin_actor: &str) -> Verdict {
        tracing::debug!(stored_content_id, origin_actor, "Queued content for moderation");
        Verdict::Pending
    }
}
