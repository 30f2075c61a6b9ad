//! Inbox routing
//!
//! Verifies, parses, classifies, and dispatches inbound activities.
//! Every step that can fail on untrusted input resolves to a typed
//! `InboxResult`; only infrastructure faults propagate as errors, so
//! the process stays available under adversarial traffic.
//!
//! State machine per request:
//! received -> signature_checked -> parsed -> routed -> handled

use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::config::FederationConfig;
use crate::data::{
    Activity, Comment, ContentRecord, ContentSource, Database, EntityId,
};
use crate::error::AppError;
use crate::interfaces::{ContentIngest, FollowerDirectory, IngestError, ModerationHook};
use crate::metrics::{ACTIVITIES_RECEIVED, INBOX_RESULTS};

use super::builder::ActivityBuilder;
use super::delivery::DeliveryScheduler;
use super::document::{ActivityDocument, CreateDoc, DeleteDoc, InteractionDoc, MoveDoc, NoteDoc, RejectDoc};
use super::key_cache::PublicKeyCache;
use super::signature::{extract_signature_key_id, key_id_matches_actor, verify_request};

/// Typed outcome of inbox handling
///
/// The caller maps this to transport status codes:
/// Accepted -> 2xx, Unauthorized -> 401, BadRequest -> 400,
/// Forbidden -> 403.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxResult {
    Accepted,
    Unauthorized,
    BadRequest(String),
    Forbidden,
}

impl InboxResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Unauthorized => "unauthorized",
            Self::BadRequest(_) => "bad_request",
            Self::Forbidden => "forbidden",
        }
    }
}

fn sanitize_remote_html(content: &str) -> String {
    ammonia::clean(content)
}

/// Base URL of the instance an actor lives on
fn actor_instance(actor: &str) -> Option<String> {
    let parsed = url::Url::parse(actor).ok()?;
    let host = parsed.host_str()?;
    match parsed.port() {
        Some(port) => Some(format!("{}://{}:{}", parsed.scheme(), host, port)),
        None => Some(format!("{}://{}", parsed.scheme(), host)),
    }
}

/// Inbox router
///
/// Routes verified inbound activities to type-specific handlers.
pub struct InboxRouter {
    db: Arc<Database>,
    key_cache: Arc<PublicKeyCache>,
    ingest: Arc<dyn ContentIngest>,
    moderation: Arc<dyn ModerationHook>,
    followers: Arc<dyn FollowerDirectory>,
    scheduler: Arc<DeliveryScheduler>,
    builder: Arc<ActivityBuilder>,
    http_client: Arc<reqwest::Client>,
    /// Local identity used as the actor of outbound Reject activities
    local_actor: String,
    limits: FederationConfig,
    clock_skew: Duration,
}

impl InboxRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        key_cache: Arc<PublicKeyCache>,
        ingest: Arc<dyn ContentIngest>,
        moderation: Arc<dyn ModerationHook>,
        followers: Arc<dyn FollowerDirectory>,
        scheduler: Arc<DeliveryScheduler>,
        builder: Arc<ActivityBuilder>,
        http_client: Arc<reqwest::Client>,
        local_actor: String,
        limits: FederationConfig,
        clock_skew_seconds: i64,
    ) -> Self {
        Self {
            db,
            key_cache,
            ingest,
            moderation,
            followers,
            scheduler,
            builder,
            http_client,
            local_actor,
            limits,
            clock_skew: Duration::seconds(clock_skew_seconds),
        }
    }

    /// Handle one inbound signed request
    ///
    /// Signature verification happens before the body is parsed as
    /// structured data; no shared state is touched until it passes.
    ///
    /// # Arguments
    /// * `path` - Request path as seen by the transport (request-target)
    /// * `headers` - All request headers
    /// * `raw_body` - Exact transmitted body bytes
    pub async fn receive(
        &self,
        path: &str,
        headers: &http::HeaderMap,
        raw_body: &[u8],
    ) -> Result<InboxResult, AppError> {
        let result = self.receive_inner(path, headers, raw_body).await?;
        INBOX_RESULTS.with_label_values(&[result.as_str()]).inc();
        Ok(result)
    }

    async fn receive_inner(
        &self,
        path: &str,
        headers: &http::HeaderMap,
        raw_body: &[u8],
    ) -> Result<InboxResult, AppError> {
        // 1. Signature check. Every failure in this step is Unauthorized;
        // the body has not been interpreted yet.
        let Ok(key_id) = extract_signature_key_id(headers) else {
            return Ok(InboxResult::Unauthorized);
        };

        let public_key_pem = match self.key_cache.get(&key_id).await {
            Ok(pem) => pem,
            Err(e) => {
                tracing::debug!(%key_id, error = %e, "Public key resolution failed");
                return Ok(InboxResult::Unauthorized);
            }
        };

        if let Err(e) = verify_request(
            "POST",
            path,
            headers,
            Some(raw_body),
            &public_key_pem,
            self.clock_skew,
        ) {
            tracing::debug!(%key_id, error = %e, "Signature verification failed");
            return Ok(InboxResult::Unauthorized);
        }

        // 2. Parse into a typed activity. Malformed input is BadRequest;
        // nothing has been mutated yet.
        let raw: serde_json::Value = match serde_json::from_slice(raw_body) {
            Ok(value) => value,
            Err(e) => return Ok(InboxResult::BadRequest(format!("Invalid JSON: {}", e))),
        };

        let document = match ActivityDocument::parse(&raw) {
            Ok(document) => document,
            Err(AppError::Validation(msg)) => return Ok(InboxResult::BadRequest(msg)),
            Err(e) => return Err(e),
        };

        // The verified key must belong to the claimed actor.
        if !key_id_matches_actor(&key_id, document.actor()) {
            return Ok(InboxResult::Unauthorized);
        }

        ACTIVITIES_RECEIVED
            .with_label_values(&[document.kind().as_str()])
            .inc();

        // 3. Route by kind.
        match document {
            ActivityDocument::Create(doc) => self.handle_create(doc, &raw).await,
            ActivityDocument::Like(doc) => self.handle_like(doc, &raw).await,
            ActivityDocument::Note(doc) => self.handle_note(doc, &raw).await,
            ActivityDocument::Announce(doc) => self.handle_announce(doc, &raw).await,
            ActivityDocument::Delete(doc) => self.handle_delete(doc, &raw).await,
            ActivityDocument::Move(doc) => self.handle_move(doc, &raw).await,
            ActivityDocument::Reject(doc) => self.handle_reject(doc, &raw).await,
        }
    }

    // =========================================================================
    // Activity kind handlers
    // =========================================================================

    /// Handle Create (federated content)
    async fn handle_create(
        &self,
        doc: CreateDoc,
        raw: &serde_json::Value,
    ) -> Result<InboxResult, AppError> {
        // Duplicate deliveries are accepted without re-processing.
        if self.db.activity_exists(&doc.id).await? {
            tracing::debug!(activity = %doc.id, "Create already processed");
            return Ok(InboxResult::Accepted);
        }

        // Declared limits are checked before any fetch; these are the
        // same limits enforced for local submissions.
        if let Some(size) = doc.object.size_bytes {
            if size > self.limits.max_content_bytes {
                let reason = format!(
                    "Declared size {} exceeds limit {}",
                    size, self.limits.max_content_bytes
                );
                self.send_reject(&doc, &reason).await?;
                return Ok(InboxResult::BadRequest(reason));
            }
        }

        if let Some(duration) = doc.object.duration_seconds {
            if duration > self.limits.max_duration_seconds {
                let reason = format!(
                    "Duration {}s exceeds limit {}s",
                    duration, self.limits.max_duration_seconds
                );
                self.send_reject(&doc, &reason).await?;
                return Ok(InboxResult::BadRequest(reason));
            }
        }

        // Fetch and store the media through the ingest collaborator.
        let stored_content_id = match self
            .ingest
            .fetch_and_store(
                &doc.object.media_url,
                doc.object.size_bytes,
                doc.object.duration_seconds,
            )
            .await
        {
            Ok(id) => id,
            Err(IngestError::Validation(reason)) => {
                tracing::warn!(activity = %doc.id, %reason, "Federated content failed validation");
                self.send_reject(&doc, &reason).await?;
                return Ok(InboxResult::BadRequest(reason));
            }
            Err(IngestError::Fetch(reason)) => {
                tracing::warn!(activity = %doc.id, %reason, "Federated content fetch failed");
                self.send_reject(&doc, &format!("Fetch failed: {}", reason))
                    .await?;
                return Ok(InboxResult::BadRequest(format!("Fetch failed: {}", reason)));
            }
        };

        let verdict = self.moderation.review(&stored_content_id, &doc.actor).await;

        let activity = self.persist_remote_activity(raw, &doc.actor).await?;
        let content = ContentRecord {
            id: EntityId::new().0,
            uri: doc.object.id.clone(),
            source: ContentSource::Federated.as_str().to_string(),
            stored_content_id: Some(stored_content_id),
            activity_id: activity.as_ref().map(|a| a.id.clone()),
            origin_actor: doc.actor.clone(),
            origin_endpoint: actor_instance(&doc.actor),
            title: doc.object.title.clone(),
            duration_seconds: doc.object.duration_seconds,
            size_bytes: doc.object.size_bytes,
            like_count: 0,
            share_count: 0,
            comment_count: 0,
            moderation_status: verdict.as_str().to_string(),
            created_at: Utc::now(),
        };
        self.db.insert_content(&content).await?;

        tracing::info!(
            content = %content.uri,
            origin = %doc.actor,
            verdict = %content.moderation_status,
            "Stored federated content"
        );

        Ok(InboxResult::Accepted)
    }

    /// Handle Like
    ///
    /// An unknown target stores the activity only; that is not an error.
    async fn handle_like(
        &self,
        doc: InteractionDoc,
        raw: &serde_json::Value,
    ) -> Result<InboxResult, AppError> {
        if !self.db.activity_exists(&doc.id).await? {
            let counted = self.db.increment_like_count(&doc.target).await?;
            if !counted {
                tracing::debug!(target = %doc.target, "Like target unknown locally");
            }
            self.persist_remote_activity(raw, &doc.actor).await?;
        }

        Ok(InboxResult::Accepted)
    }

    /// Handle Announce (share)
    async fn handle_announce(
        &self,
        doc: InteractionDoc,
        raw: &serde_json::Value,
    ) -> Result<InboxResult, AppError> {
        if !self.db.activity_exists(&doc.id).await? {
            let counted = self.db.increment_share_count(&doc.target).await?;
            if !counted {
                tracing::debug!(target = %doc.target, "Announce target unknown locally");
            }
            self.persist_remote_activity(raw, &doc.actor).await?;
        }

        Ok(InboxResult::Accepted)
    }

    /// Handle Note (reply)
    async fn handle_note(
        &self,
        doc: NoteDoc,
        raw: &serde_json::Value,
    ) -> Result<InboxResult, AppError> {
        if self.db.activity_exists(&doc.id).await? {
            return Ok(InboxResult::Accepted);
        }

        if self.db.get_content_by_uri(&doc.target).await?.is_some() {
            let comment = Comment {
                id: EntityId::new().0,
                content_uri: doc.target.clone(),
                author_actor: doc.actor.clone(),
                activity_uri: doc.id.clone(),
                body_html: sanitize_remote_html(&doc.content),
                created_at: Utc::now(),
            };
            self.db.insert_comment(&comment).await?;
        } else {
            tracing::debug!(target = %doc.target, "Note target unknown locally");
        }

        self.persist_remote_activity(raw, &doc.actor).await?;
        Ok(InboxResult::Accepted)
    }

    /// Handle Delete
    ///
    /// Only the actor that owns the target may delete it. On a match the
    /// content, its activity, and all dependent delivery records are
    /// removed; a mismatch deletes nothing.
    async fn handle_delete(
        &self,
        doc: DeleteDoc,
        raw: &serde_json::Value,
    ) -> Result<InboxResult, AppError> {
        // The target may be an activity URI or a content URI.
        let owning_activity = match self.db.get_activity_by_uri(&doc.target).await? {
            Some(activity) => Some(activity),
            None => match self.db.get_content_by_uri(&doc.target).await? {
                Some(content) => match content.activity_id {
                    Some(activity_id) => self.db.get_activity(&activity_id).await?,
                    None => {
                        // Content without a linked activity: ownership is
                        // judged by the origin actor.
                        if content.origin_actor != doc.actor {
                            return Ok(InboxResult::Forbidden);
                        }
                        self.db.delete_content_by_uri(&doc.target).await?;
                        self.persist_remote_activity(raw, &doc.actor).await?;
                        return Ok(InboxResult::Accepted);
                    }
                },
                None => None,
            },
        };

        let Some(target_activity) = owning_activity else {
            // Nothing known locally; keep the tombstone for audit.
            self.persist_remote_activity(raw, &doc.actor).await?;
            return Ok(InboxResult::Accepted);
        };

        if target_activity.actor != doc.actor {
            tracing::warn!(
                target = %doc.target,
                owner = %target_activity.actor,
                deleter = %doc.actor,
                "Delete actor mismatch"
            );
            return Ok(InboxResult::Forbidden);
        }

        if let Some(target_uri) = &target_activity.target {
            self.db.delete_content_by_uri(target_uri).await?;
        }
        self.db.delete_content_by_uri(&doc.target).await?;
        self.db.delete_activity(&target_activity.id).await?;
        self.persist_remote_activity(raw, &doc.actor).await?;

        tracing::info!(target = %doc.target, actor = %doc.actor, "Processed Delete");
        Ok(InboxResult::Accepted)
    }

    /// Handle Move (identity migration)
    ///
    /// The signing actor must be the identity embedded in the payload;
    /// this stops a compromised key from moving another actor's
    /// followers.
    async fn handle_move(
        &self,
        doc: MoveDoc,
        raw: &serde_json::Value,
    ) -> Result<InboxResult, AppError> {
        if doc.actor != doc.moved_identity {
            tracing::warn!(
                actor = %doc.actor,
                moved = %doc.moved_identity,
                "Move identity mismatch"
            );
            return Ok(InboxResult::BadRequest(
                "Move actor does not match migrated identity".to_string(),
            ));
        }

        let rewritten = self
            .followers
            .update_follower_endpoint(&doc.moved_identity, &doc.new_endpoint)
            .await?;
        self.persist_remote_activity(raw, &doc.actor).await?;

        tracing::info!(
            actor = %doc.actor,
            new_endpoint = %doc.new_endpoint,
            rewritten,
            "Processed identity migration"
        );

        Ok(InboxResult::Accepted)
    }

    /// Handle Reject (audit only)
    async fn handle_reject(
        &self,
        doc: RejectDoc,
        raw: &serde_json::Value,
    ) -> Result<InboxResult, AppError> {
        tracing::info!(
            actor = %doc.actor,
            rejected = %doc.target,
            reason = doc.reason.as_deref().unwrap_or("unspecified"),
            "Remote party rejected an activity"
        );
        self.persist_remote_activity(raw, &doc.actor).await?;
        Ok(InboxResult::Accepted)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Persist a remote activity for the audit trail
    ///
    /// Idempotent on the activity URI.
    async fn persist_remote_activity(
        &self,
        raw: &serde_json::Value,
        actor: &str,
    ) -> Result<Option<Activity>, AppError> {
        let document = ActivityDocument::parse(raw)?;
        if self.db.activity_exists(document.uri()).await? {
            return Ok(None);
        }

        let activity = Activity {
            id: EntityId::new().0,
            uri: document.uri().to_string(),
            kind: document.kind().as_str().to_string(),
            actor: actor.to_string(),
            target: document.target().map(str::to_string),
            body: raw.to_string(),
            origin_local: false,
            created_at: Utc::now(),
        };
        self.db.insert_activity(&activity).await?;
        Ok(Some(activity))
    }

    /// Build a Reject for a failed Create and schedule it back to the
    /// sender's inbox
    async fn send_reject(&self, doc: &CreateDoc, reason: &str) -> Result<(), AppError> {
        let reject = match self
            .builder
            .build_reject(&self.local_actor, &doc.id, &doc.actor, reason)
            .await
        {
            Ok(reject) => reject,
            Err(e) => {
                // A missing local key must not take the inbox down.
                tracing::error!(error = %e, "Failed to build Reject activity");
                return Ok(());
            }
        };

        self.db.insert_activity(&reject).await?;

        let inbox = self.resolve_actor_inbox(&doc.actor).await;
        self.scheduler.publish(&reject, vec![inbox]).await?;

        tracing::info!(
            rejected = %doc.id,
            sender = %doc.actor,
            reason,
            "Scheduled Reject for sender"
        );

        Ok(())
    }

    /// Resolve a remote actor's inbox URL
    ///
    /// Fetches the actor document; falls back to the `/inbox` convention
    /// when the document is unavailable.
    async fn resolve_actor_inbox(&self, actor: &str) -> String {
        let fallback = format!("{}/inbox", actor.trim_end_matches('/'));

        if super::signature::extract_actor_domain(actor).is_err() {
            return fallback;
        }

        let response = self
            .http_client
            .get(actor)
            .header("Accept", "application/activity+json")
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|doc| {
                    doc.get("inbox")
                        .and_then(|i| i.as_str())
                        .map(str::to_string)
                })
                .unwrap_or(fallback),
            _ => fallback,
        }
    }
}
