//! External collaborator interfaces
//!
//! The engine touches transcoding, storage, moderation, and identity
//! management only through the narrow traits in this module. Production
//! wiring supplies real implementations; tests supply mocks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AppError;

/// Descriptor for locally published content, supplied by the upload
/// pipeline once every declared variant is ready.
#[derive(Debug, Clone)]
pub struct ContentDescriptor {
    /// Local content ID
    pub id: String,
    /// Identity of the publishing actor (local DID or actor URL)
    pub actor: String,
    pub title: String,
    /// Description/body text
    pub body: String,
    pub published_at: DateTime<Utc>,
    /// Canonical URL of the content object
    pub canonical_url: String,
    /// Primary media type (e.g., "video/mp4")
    pub media_type: String,
    pub duration_seconds: i64,
    pub size_bytes: i64,
    /// One entry per transcoded variant that is ready to serve.
    ///
    /// The builder emits one attachment per entry; it does not verify
    /// the variants exist. That is the caller's contract.
    pub variants: Vec<ContentVariant>,
}

/// A single ready-to-serve rendition of the content
#[derive(Debug, Clone)]
pub struct ContentVariant {
    pub media_type: String,
    pub url: String,
    /// Variant label (e.g., "720p")
    pub name: String,
}

/// Key-pair lookup by identity
///
/// The private half never leaves the provider except through `sign`
/// call sites; it is never embedded in any transmitted document.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Resolve a locally pinned public key by key ID.
    ///
    /// Remote keys are resolved by the key cache's fetcher, not here.
    async fn resolve_public_key(&self, key_id: &str) -> Result<Option<String>, AppError>;

    /// Resolve the PEM-encoded signing key for a local actor.
    async fn resolve_signing_key(&self, actor: &str) -> Result<Option<String>, AppError>;
}

/// Follower-endpoint lookup and migration updates
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FollowerDirectory: Send + Sync {
    /// Snapshot of remote inbox URLs for an actor's followers.
    ///
    /// The engine treats the result as read-only at publish time; it is
    /// not re-resolved mid-delivery.
    async fn list_follower_inboxes(&self, actor: &str) -> Result<Vec<String>, AppError>;

    /// Rewrite every follower entry pointing at `old_actor` to the new
    /// endpoint. Returns the number of rewritten entries.
    async fn update_follower_endpoint(
        &self,
        old_actor: &str,
        new_endpoint: &str,
    ) -> Result<u64, AppError>;
}

/// Failure modes of federated content ingestion
#[derive(Debug, Clone, thiserror::Error)]
pub enum IngestError {
    /// Content exceeds the configured limits
    #[error("validation failed: {0}")]
    Validation(String),
    /// The remote media could not be fetched or stored
    #[error("fetch failed: {0}")]
    Fetch(String),
}

/// Store/ingest callback for newly received federated content
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentIngest: Send + Sync {
    /// Fetch the referenced media and store it in the federated-content
    /// area (distinct from local-upload storage).
    ///
    /// # Returns
    /// The stored content ID on success.
    async fn fetch_and_store(
        &self,
        url: &str,
        declared_size: Option<i64>,
        declared_duration: Option<i64>,
    ) -> Result<String, IngestError>;
}

/// Moderation verdict for ingested content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Pending,
    Flagged,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Pending => "pending",
            Self::Flagged => "flagged",
        }
    }
}

/// Moderation-verdict callback for federated content
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModerationHook: Send + Sync {
    /// Review stored content; the verdict is recorded on the content
    /// record. Scanning itself happens outside the engine.
    async fn review(&self, stored_content_id: &str, origin_actor: &str) -> Verdict;
}
