//! E2E tests for federation scenarios
//!
//! These tests drive the full engine over scratch storage with a
//! scripted transport:
//! - Publish → per-endpoint delivery outcomes and retry states
//! - Inbound Create → validation, ingest, Reject on failure
//! - Inbound interactions → counters and comments
//! - Delete ownership checks and cascades
//! - Move → follower endpoint migration

mod common;

use chrono::{Duration, Utc};
use common::{
    INSTANCE_ACTOR, LOCAL_BASE, REMOTE_ACTOR, StubIngest, TestEngine, generate_keypair,
    signed_headers_with_key,
};
use std::sync::Arc;
use tidecast::data::{ActivityKind, EntityId, Follower};
use tidecast::federation::{AttemptOutcome, InboxResult, TransportResult};
use tidecast::interfaces::{ContentDescriptor, ContentVariant};

fn descriptor() -> ContentDescriptor {
    ContentDescriptor {
        id: "content-1".to_string(),
        actor: INSTANCE_ACTOR.to_string(),
        title: "Surf session".to_string(),
        body: "Morning waves".to_string(),
        published_at: Utc::now(),
        canonical_url: format!("{}/videos/1", LOCAL_BASE),
        media_type: "video/mp4".to_string(),
        duration_seconds: 120,
        size_bytes: 1_048_576,
        variants: vec![ContentVariant {
            media_type: "video/mp4".to_string(),
            url: format!("{}/media/1-720p.mp4", LOCAL_BASE),
            name: "720p".to_string(),
        }],
    }
}

async fn insert_follower(engine: &TestEngine, inbox: &str) {
    engine
        .db
        .insert_follower(&Follower {
            id: EntityId::new().0,
            local_actor: INSTANCE_ACTOR.to_string(),
            follower_actor: format!("{}/users/{}", inbox.trim_end_matches("/inbox"), "f"),
            inbox_url: inbox.to_string(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
}

/// Drain every record that is due at `now`
async fn drain(engine: &TestEngine, now: chrono::DateTime<Utc>) -> Vec<AttemptOutcome> {
    let mut outcomes = Vec::new();
    while let Some(outcome) = engine.scheduler.process_due_once(now).await.unwrap() {
        outcomes.push(outcome);
    }
    outcomes
}

fn video_create_body(size_bytes: i64, duration: &str) -> serde_json::Value {
    serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Create",
        "id": "https://remote.example/activities/create-1",
        "actor": REMOTE_ACTOR,
        "object": {
            "type": "Video",
            "id": "https://remote.example/videos/1",
            "name": "Remote clip",
            "content": "From across the fediverse",
            "url": "https://remote.example/media/1.mp4",
            "mediaType": "video/mp4",
            "duration": duration,
            "size": size_bytes,
            "attachment": [],
        },
    })
}

// =============================================================================
// Scenario 1: publish to three followers with mixed outcomes
// =============================================================================

/// Follower A answers 200, B answers 503 then 200 on retry, C answers
/// 410. Expected end state: A delivered (1 attempt), B delivered
/// (2 attempts), C failed_permanent (1 attempt).
#[tokio::test]
async fn publish_to_three_followers_with_mixed_outcomes() {
    let engine = TestEngine::new().await;

    let inbox_a = "https://a.example/inbox";
    let inbox_b = "https://b.example/inbox";
    let inbox_c = "https://c.example/inbox";
    for inbox in [inbox_a, inbox_b, inbox_c] {
        insert_follower(&engine, inbox).await;
    }

    engine.transport.script(inbox_a, vec![TransportResult::Status(200)]);
    engine.transport.script(
        inbox_b,
        vec![TransportResult::Status(503), TransportResult::Status(200)],
    );
    engine.transport.script(inbox_c, vec![TransportResult::Status(410)]);

    let (activity, queued) = engine.outbox.publish_content(&descriptor()).await.unwrap();
    assert_eq!(queued, 3, "one delivery record per follower");

    // First pass: A delivered, B transient, C permanent.
    let first_pass = drain(&engine, Utc::now() + Duration::seconds(1)).await;
    assert_eq!(first_pass.len(), 3);

    // Second pass after B's backoff window.
    let retried = drain(&engine, Utc::now() + Duration::seconds(61)).await;
    assert_eq!(retried, vec![AttemptOutcome::Delivered]);

    let records = engine
        .db
        .list_deliveries_by_activity(&activity.id)
        .await
        .unwrap();
    let by_endpoint = |endpoint: &str| {
        records
            .iter()
            .find(|record| record.endpoint == endpoint)
            .unwrap()
    };

    let record_a = by_endpoint(inbox_a);
    assert_eq!(record_a.state, "delivered");
    assert_eq!(record_a.attempts, 1);

    let record_b = by_endpoint(inbox_b);
    assert_eq!(record_b.state, "delivered");
    assert_eq!(record_b.attempts, 2);

    let record_c = by_endpoint(inbox_c);
    assert_eq!(record_c.state, "failed_permanent");
    assert_eq!(record_c.attempts, 1);
    assert_eq!(record_c.last_error.as_deref(), Some("HTTP 410"));
}

// =============================================================================
// Scenario 2: inbound Create exceeding limits
// =============================================================================

/// A valid signature but a 700MB declared size against a 500MB limit:
/// nothing stored, one outbound Reject scheduled for the sender.
#[tokio::test]
async fn oversized_inbound_create_sends_reject() {
    let engine = TestEngine::new().await;

    let body = video_create_body(700 * 1024 * 1024, "PT60S");
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = engine.signed_headers(&bytes);

    let result = engine
        .router
        .receive("/inbox", &headers, &bytes)
        .await
        .unwrap();
    assert!(matches!(result, InboxResult::BadRequest(_)));

    // The ingest collaborator was never invoked; no content stored.
    assert!(engine.ingest.stored_urls().is_empty());
    assert!(
        engine
            .db
            .get_content_by_uri("https://remote.example/videos/1")
            .await
            .unwrap()
            .is_none()
    );

    // Exactly one Reject is queued back toward the sender.
    let rejects = engine
        .db
        .list_activities_by_actor(INSTANCE_ACTOR, 10)
        .await
        .unwrap();
    assert_eq!(rejects.len(), 1);
    assert_eq!(rejects[0].kind, ActivityKind::Reject.as_str());
    assert!(rejects[0].origin_local);

    let deliveries = engine
        .db
        .list_deliveries_by_activity(&rejects[0].id)
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].state, "pending");
    assert!(deliveries[0].endpoint.starts_with("https://remote.example/users/alice"));
}

/// Over-duration content is rejected the same way.
#[tokio::test]
async fn overlong_inbound_create_sends_reject() {
    let engine = TestEngine::new().await;

    let body = video_create_body(1_000_000, "PT300S");
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = engine.signed_headers(&bytes);

    let result = engine
        .router
        .receive("/inbox", &headers, &bytes)
        .await
        .unwrap();
    assert!(matches!(result, InboxResult::BadRequest(_)));
    assert!(engine.ingest.stored_urls().is_empty());
}

/// Ingest validation failures also produce a Reject and store nothing.
#[tokio::test]
async fn failed_ingest_sends_reject() {
    let ingest = Arc::new(StubIngest::failing(
        tidecast::interfaces::IngestError::Validation("corrupt container".to_string()),
    ));
    let engine = TestEngine::with_ingest(ingest).await;

    let body = video_create_body(1_000_000, "PT60S");
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = engine.signed_headers(&bytes);

    let result = engine
        .router
        .receive("/inbox", &headers, &bytes)
        .await
        .unwrap();
    assert!(matches!(result, InboxResult::BadRequest(_)));

    let rejects = engine
        .db
        .list_activities_by_actor(INSTANCE_ACTOR, 10)
        .await
        .unwrap();
    assert_eq!(rejects.len(), 1);
    assert_eq!(rejects[0].kind, "Reject");
}

// =============================================================================
// Scenario 3: inbound Create within limits
// =============================================================================

#[tokio::test]
async fn inbound_create_within_limits_stores_content_with_origin() {
    let engine = TestEngine::new().await;

    let body = video_create_body(1_000_000, "PT60S");
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = engine.signed_headers(&bytes);

    let result = engine
        .router
        .receive("/inbox", &headers, &bytes)
        .await
        .unwrap();
    assert_eq!(result, InboxResult::Accepted);

    assert_eq!(
        engine.ingest.stored_urls(),
        vec!["https://remote.example/media/1.mp4".to_string()]
    );

    let content = engine
        .db
        .get_content_by_uri("https://remote.example/videos/1")
        .await
        .unwrap()
        .expect("content stored");
    assert_eq!(content.source, "federated");
    assert_eq!(content.origin_actor, REMOTE_ACTOR);
    assert_eq!(
        content.origin_endpoint.as_deref(),
        Some("https://remote.example")
    );
    assert!(content.stored_content_id.is_some());
    assert_eq!(content.moderation_status, "approved");

    let activity = engine
        .db
        .get_activity_by_uri("https://remote.example/activities/create-1")
        .await
        .unwrap()
        .expect("activity persisted");
    assert!(!activity.origin_local);

    // Redelivery of the same activity is idempotent.
    let replayed_headers = engine.signed_headers(&bytes);
    let result = engine
        .router
        .receive("/inbox", &replayed_headers, &bytes)
        .await
        .unwrap();
    assert_eq!(result, InboxResult::Accepted);
    assert_eq!(engine.ingest.stored_urls().len(), 1, "no second ingest");
}

// =============================================================================
// Scenario 4: signature failures
// =============================================================================

#[tokio::test]
async fn unsigned_inbound_is_unauthorized_and_not_persisted() {
    let engine = TestEngine::new().await;

    let body = video_create_body(1_000_000, "PT60S");
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = http::HeaderMap::new();

    let result = engine
        .router
        .receive("/inbox", &headers, &bytes)
        .await
        .unwrap();
    assert_eq!(result, InboxResult::Unauthorized);

    assert!(
        engine
            .db
            .get_activity_by_uri("https://remote.example/activities/create-1")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn tampered_body_is_unauthorized() {
    let engine = TestEngine::new().await;

    let body = video_create_body(1_000_000, "PT60S");
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = engine.signed_headers(&bytes);

    let mut tampered = body.clone();
    tampered["object"]["name"] = serde_json::json!("Tampered clip");
    let tampered_bytes = serde_json::to_vec(&tampered).unwrap();

    let result = engine
        .router
        .receive("/inbox", &headers, &tampered_bytes)
        .await
        .unwrap();
    assert_eq!(result, InboxResult::Unauthorized);
}

/// A valid signature whose key belongs to a different actor than the
/// document claims must not pass.
#[tokio::test]
async fn key_actor_mismatch_is_unauthorized() {
    let engine = TestEngine::new().await;

    // Mallory signs a document claiming to be Alice.
    let (mallory_private, mallory_public) = generate_keypair();
    let mallory_key_id = "https://remote.example/users/mallory#main-key";
    engine.key_cache.insert(mallory_key_id, mallory_public).await;

    let body = video_create_body(1_000_000, "PT60S");
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = signed_headers_with_key(&bytes, &mallory_private, mallory_key_id);

    let result = engine
        .router
        .receive("/inbox", &headers, &bytes)
        .await
        .unwrap();
    assert_eq!(result, InboxResult::Unauthorized);
}

// =============================================================================
// Scenario 5: interactions
// =============================================================================

#[tokio::test]
async fn like_increments_counter_for_known_target() {
    let engine = TestEngine::new().await;

    // Publish local content so the target resolves.
    engine.outbox.publish_content(&descriptor()).await.unwrap();
    let target = format!("{}/videos/1", LOCAL_BASE);

    let body = serde_json::json!({
        "type": "Like",
        "id": "https://remote.example/activities/like-1",
        "actor": REMOTE_ACTOR,
        "object": target,
    });
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = engine.signed_headers(&bytes);

    let result = engine
        .router
        .receive("/inbox", &headers, &bytes)
        .await
        .unwrap();
    assert_eq!(result, InboxResult::Accepted);

    let content = engine
        .db
        .get_content_by_uri(&target)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(content.like_count, 1);
}

#[tokio::test]
async fn like_on_unknown_target_stores_activity_only() {
    let engine = TestEngine::new().await;

    let body = serde_json::json!({
        "type": "Like",
        "id": "https://remote.example/activities/like-2",
        "actor": REMOTE_ACTOR,
        "object": "https://local.example/videos/unknown",
    });
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = engine.signed_headers(&bytes);

    let result = engine
        .router
        .receive("/inbox", &headers, &bytes)
        .await
        .unwrap();
    assert_eq!(result, InboxResult::Accepted);

    // The activity is kept even though no counter changed.
    assert!(
        engine
            .db
            .get_activity_by_uri("https://remote.example/activities/like-2")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn note_creates_comment_for_known_target() {
    let engine = TestEngine::new().await;

    engine.outbox.publish_content(&descriptor()).await.unwrap();
    let target = format!("{}/videos/1", LOCAL_BASE);

    let body = serde_json::json!({
        "type": "Note",
        "id": "https://remote.example/notes/1",
        "actor": REMOTE_ACTOR,
        "content": "<p>Great session<script>alert(1)</script></p>",
        "inReplyTo": target,
    });
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = engine.signed_headers(&bytes);

    let result = engine
        .router
        .receive("/inbox", &headers, &bytes)
        .await
        .unwrap();
    assert_eq!(result, InboxResult::Accepted);

    let comments = engine.db.list_comments(&target).await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].author_actor, REMOTE_ACTOR);
    // Hostile markup is stripped before storage.
    assert!(!comments[0].body_html.contains("<script>"));
    assert!(comments[0].body_html.contains("Great session"));

    let content = engine
        .db
        .get_content_by_uri(&target)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(content.comment_count, 1);
}

// =============================================================================
// Scenario 6: Delete ownership
// =============================================================================

async fn store_remote_content(engine: &TestEngine) {
    let body = video_create_body(1_000_000, "PT60S");
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = engine.signed_headers(&bytes);
    let result = engine
        .router
        .receive("/inbox", &headers, &bytes)
        .await
        .unwrap();
    assert_eq!(result, InboxResult::Accepted);
}

#[tokio::test]
async fn delete_by_owner_removes_content_and_activity() {
    let engine = TestEngine::new().await;
    store_remote_content(&engine).await;

    let body = serde_json::json!({
        "type": "Delete",
        "id": "https://remote.example/activities/delete-1",
        "actor": REMOTE_ACTOR,
        "object": "https://remote.example/videos/1",
    });
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = engine.signed_headers(&bytes);

    let result = engine
        .router
        .receive("/inbox", &headers, &bytes)
        .await
        .unwrap();
    assert_eq!(result, InboxResult::Accepted);

    assert!(
        engine
            .db
            .get_content_by_uri("https://remote.example/videos/1")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn delete_by_non_owner_is_forbidden_and_deletes_nothing() {
    let engine = TestEngine::new().await;
    store_remote_content(&engine).await;

    let (mallory_private, mallory_public) = generate_keypair();
    let mallory_key_id = "https://remote.example/users/mallory#main-key";
    engine.key_cache.insert(mallory_key_id, mallory_public).await;

    let body = serde_json::json!({
        "type": "Delete",
        "id": "https://remote.example/activities/delete-2",
        "actor": "https://remote.example/users/mallory",
        "object": "https://remote.example/videos/1",
    });
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = signed_headers_with_key(&bytes, &mallory_private, mallory_key_id);

    let result = engine
        .router
        .receive("/inbox", &headers, &bytes)
        .await
        .unwrap();
    assert_eq!(result, InboxResult::Forbidden);

    // Nothing was deleted.
    assert!(
        engine
            .db
            .get_content_by_uri("https://remote.example/videos/1")
            .await
            .unwrap()
            .is_some()
    );
}

// =============================================================================
// Scenario 7: Move (identity migration)
// =============================================================================

#[tokio::test]
async fn verified_move_rewrites_only_matching_followers() {
    let engine = TestEngine::new().await;

    engine
        .db
        .insert_follower(&Follower {
            id: EntityId::new().0,
            local_actor: INSTANCE_ACTOR.to_string(),
            follower_actor: REMOTE_ACTOR.to_string(),
            inbox_url: "https://remote.example/users/alice/inbox".to_string(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    engine
        .db
        .insert_follower(&Follower {
            id: EntityId::new().0,
            local_actor: INSTANCE_ACTOR.to_string(),
            follower_actor: "https://other.example/users/carol".to_string(),
            inbox_url: "https://other.example/users/carol/inbox".to_string(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let body = serde_json::json!({
        "type": "Move",
        "id": "https://remote.example/activities/move-1",
        "actor": REMOTE_ACTOR,
        "object": REMOTE_ACTOR,
        "target": "https://new-home.example/users/alice/inbox",
    });
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = engine.signed_headers(&bytes);

    let result = engine
        .router
        .receive("/inbox", &headers, &bytes)
        .await
        .unwrap();
    assert_eq!(result, InboxResult::Accepted);

    let moved = engine
        .db
        .list_followers_by_remote_actor(REMOTE_ACTOR)
        .await
        .unwrap();
    assert_eq!(
        moved[0].inbox_url,
        "https://new-home.example/users/alice/inbox"
    );

    let untouched = engine
        .db
        .list_followers_by_remote_actor("https://other.example/users/carol")
        .await
        .unwrap();
    assert_eq!(
        untouched[0].inbox_url,
        "https://other.example/users/carol/inbox"
    );
}

#[tokio::test]
async fn move_with_mismatched_identity_is_rejected() {
    let engine = TestEngine::new().await;

    engine
        .db
        .insert_follower(&Follower {
            id: EntityId::new().0,
            local_actor: INSTANCE_ACTOR.to_string(),
            follower_actor: "https://victim.example/users/bob".to_string(),
            inbox_url: "https://victim.example/users/bob/inbox".to_string(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    // Alice's (compromised) key tries to move Bob's followers.
    let body = serde_json::json!({
        "type": "Move",
        "id": "https://remote.example/activities/move-2",
        "actor": REMOTE_ACTOR,
        "object": "https://victim.example/users/bob",
        "target": "https://attacker.example/inbox",
    });
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = engine.signed_headers(&bytes);

    let result = engine
        .router
        .receive("/inbox", &headers, &bytes)
        .await
        .unwrap();
    assert!(matches!(result, InboxResult::BadRequest(_)));

    // No follower entry changed.
    let followers = engine
        .db
        .list_followers_by_remote_actor("https://victim.example/users/bob")
        .await
        .unwrap();
    assert_eq!(
        followers[0].inbox_url,
        "https://victim.example/users/bob/inbox"
    );
}

// =============================================================================
// Scenario 8: cancellation
// =============================================================================

#[tokio::test]
async fn cancelled_deliveries_fail_permanently_without_attempts() {
    let engine = TestEngine::new().await;
    insert_follower(&engine, "https://a.example/inbox").await;
    insert_follower(&engine, "https://b.example/inbox").await;

    let (activity, queued) = engine.outbox.publish_content(&descriptor()).await.unwrap();
    assert_eq!(queued, 2);

    // Content removed locally before any delivery ran.
    let cancelled = engine.outbox.cancel_deliveries(&activity.id).await.unwrap();
    assert_eq!(cancelled, 2);

    for record in engine
        .db
        .list_deliveries_by_activity(&activity.id)
        .await
        .unwrap()
    {
        assert_eq!(record.state, "failed_permanent");
        assert_eq!(record.last_error.as_deref(), Some("cancelled"));
        assert_eq!(record.attempts, 0);
    }

    // Nothing left for the workers.
    assert!(engine.transport.calls().is_empty());
    assert_eq!(
        engine
            .scheduler
            .process_due_once(Utc::now() + Duration::seconds(5))
            .await
            .unwrap(),
        None
    );
}
