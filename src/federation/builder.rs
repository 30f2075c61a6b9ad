//! Activity construction
//!
//! Converts local content and interaction events into signed activity
//! documents. Every build call resolves the actor's key material and
//! signs the document before returning; a missing key fails the call
//! with `KeyUnavailable` and is never retried.

use std::sync::Arc;

use chrono::Utc;

use crate::data::{Activity, ActivityKind, EntityId};
use crate::error::AppError;
use crate::interfaces::{ContentDescriptor, KeyProvider};
use crate::metrics::ACTIVITIES_BUILT;

use super::document::format_iso8601_seconds;
use super::signature::sign_document;

/// Builds and signs outbound activities
pub struct ActivityBuilder {
    keys: Arc<dyn KeyProvider>,
    /// Base URL used to mint activity URIs
    base_url: String,
}

impl ActivityBuilder {
    /// Create new activity builder
    pub fn new(keys: Arc<dyn KeyProvider>, base_url: String) -> Self {
        Self {
            keys,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Build a Create activity for newly published content
    ///
    /// One attachment is emitted per declared-ready variant; the builder
    /// does not verify the variants exist (caller's contract).
    pub async fn build_create(&self, descriptor: &ContentDescriptor) -> Result<Activity, AppError> {
        let attachments: Vec<serde_json::Value> = descriptor
            .variants
            .iter()
            .map(|variant| {
                serde_json::json!({
                    "type": "Document",
                    "mediaType": variant.media_type,
                    "url": variant.url,
                    "name": variant.name,
                })
            })
            .collect();

        let object = serde_json::json!({
            "type": "Video",
            "id": descriptor.canonical_url,
            "name": descriptor.title,
            "content": descriptor.body,
            "url": descriptor.canonical_url,
            "mediaType": descriptor.media_type,
            "duration": format_iso8601_seconds(descriptor.duration_seconds),
            "size": descriptor.size_bytes,
            "published": descriptor.published_at.to_rfc3339(),
            "attributedTo": descriptor.actor,
            "attachment": attachments,
        });

        let uri = self.mint_activity_uri();
        let document = serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Create",
            "id": uri,
            "actor": descriptor.actor,
            "object": object,
            "published": Utc::now().to_rfc3339(),
        });

        self.finish(
            ActivityKind::Create,
            &descriptor.actor,
            Some(descriptor.canonical_url.clone()),
            uri,
            document,
        )
        .await
    }

    /// Build a Like, Note, or Announce interaction
    ///
    /// Note carries free text in `payload`; Like and Announce carry only
    /// the target reference.
    ///
    /// # Errors
    /// `Validation` when `kind` is not an interaction kind, or when a
    /// Note has no payload.
    pub async fn build_interaction(
        &self,
        kind: ActivityKind,
        actor: &str,
        target: &str,
        payload: Option<&str>,
    ) -> Result<Activity, AppError> {
        let uri = self.mint_activity_uri();

        let document = match kind {
            ActivityKind::Like | ActivityKind::Announce => serde_json::json!({
                "@context": "https://www.w3.org/ns/activitystreams",
                "type": kind.as_str(),
                "id": uri,
                "actor": actor,
                "object": target,
                "published": Utc::now().to_rfc3339(),
            }),
            ActivityKind::Note => {
                let content = payload.ok_or_else(|| {
                    AppError::Validation("Note interaction requires text".to_string())
                })?;
                serde_json::json!({
                    "@context": "https://www.w3.org/ns/activitystreams",
                    "type": "Note",
                    "id": uri,
                    "actor": actor,
                    "content": content,
                    "inReplyTo": target,
                    "published": Utc::now().to_rfc3339(),
                })
            }
            other => {
                return Err(AppError::Validation(format!(
                    "Not an interaction kind: {}",
                    other.as_str()
                )));
            }
        };

        self.finish(kind, actor, Some(target.to_string()), uri, document)
            .await
    }

    /// Build a Reject for inbound content that failed validation
    ///
    /// Addressed back to the original actor.
    pub async fn build_reject(
        &self,
        actor: &str,
        original_activity_uri: &str,
        original_actor: &str,
        reason: &str,
    ) -> Result<Activity, AppError> {
        let uri = self.mint_activity_uri();
        let document = serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Reject",
            "id": uri,
            "actor": actor,
            "object": original_activity_uri,
            "to": [original_actor],
            "summary": reason,
            "published": Utc::now().to_rfc3339(),
        });

        self.finish(
            ActivityKind::Reject,
            actor,
            Some(original_activity_uri.to_string()),
            uri,
            document,
        )
        .await
    }

    /// Build a Move announcing an identity migration
    ///
    /// The migrating identity is embedded in the payload so receivers can
    /// verify it against the signing actor.
    pub async fn build_move(&self, actor: &str, new_endpoint: &str) -> Result<Activity, AppError> {
        let uri = self.mint_activity_uri();
        let document = serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Move",
            "id": uri,
            "actor": actor,
            "object": actor,
            "target": new_endpoint,
            "published": Utc::now().to_rfc3339(),
        });

        self.finish(
            ActivityKind::Move,
            actor,
            Some(new_endpoint.to_string()),
            uri,
            document,
        )
        .await
    }

    fn mint_activity_uri(&self) -> String {
        format!("{}/activities/{}", self.base_url, EntityId::new().0)
    }

    /// Sign the document and wrap it in an Activity record
    async fn finish(
        &self,
        kind: ActivityKind,
        actor: &str,
        target: Option<String>,
        uri: String,
        mut document: serde_json::Value,
    ) -> Result<Activity, AppError> {
        let private_key_pem = self
            .keys
            .resolve_signing_key(actor)
            .await?
            .ok_or_else(|| AppError::KeyUnavailable(actor.to_string()))?;

        let key_id = format!("{}#main-key", actor);
        sign_document(&mut document, &private_key_pem, &key_id)?;

        ACTIVITIES_BUILT.with_label_values(&[kind.as_str()]).inc();

        Ok(Activity {
            id: EntityId::new().0,
            uri,
            kind: kind.as_str().to_string(),
            actor: actor.to_string(),
            target,
            body: document.to_string(),
            origin_local: true,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{ContentVariant, MockKeyProvider};
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    const ACTOR: &str = "https://local.example/users/alice";

    fn generate_test_keypair() -> (String, String) {
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

    fn builder_with_key(private_key_pem: String) -> ActivityBuilder {
        let mut keys = MockKeyProvider::new();
        keys.expect_resolve_signing_key()
            .returning(move |_| Ok(Some(private_key_pem.clone())));
        ActivityBuilder::new(Arc::new(keys), "https://local.example".to_string())
    }

    fn builder_without_key() -> ActivityBuilder {
        let mut keys = MockKeyProvider::new();
        keys.expect_resolve_signing_key().returning(|_| Ok(None));
        ActivityBuilder::new(Arc::new(keys), "https://local.example".to_string())
    }

    fn descriptor() -> ContentDescriptor {
        ContentDescriptor {
            id: "content-1".to_string(),
            actor: ACTOR.to_string(),
            title: "Surf session".to_string(),
            body: "Morning waves".to_string(),
            published_at: Utc::now(),
            canonical_url: "https://local.example/videos/1".to_string(),
            media_type: "video/mp4".to_string(),
            duration_seconds: 120,
            size_bytes: 1_048_576,
            variants: vec![
                ContentVariant {
                    media_type: "video/mp4".to_string(),
                    url: "https://local.example/media/1-480p.mp4".to_string(),
                    name: "480p".to_string(),
                },
                ContentVariant {
                    media_type: "video/mp4".to_string(),
                    url: "https://local.example/media/1-720p.mp4".to_string(),
                    name: "720p".to_string(),
                },
            ],
        }
    }

    #[tokio::test]
    async fn build_create_emits_one_attachment_per_variant() {
        let (private_pem, public_pem) = generate_test_keypair();
        let builder = builder_with_key(private_pem);

        let activity = builder.build_create(&descriptor()).await.expect("builds");
        assert_eq!(activity.kind, "Create");
        assert!(activity.origin_local);
        assert_eq!(
            activity.target.as_deref(),
            Some("https://local.example/videos/1")
        );

        let body: serde_json::Value = serde_json::from_str(&activity.body).expect("valid JSON");
        let attachments = body["object"]["attachment"]
            .as_array()
            .expect("attachment array");
        assert_eq!(attachments.len(), 2);
        assert_eq!(body["object"]["duration"], "PT120S");

        // The build-time proof must verify with the actor's public key.
        crate::federation::signature::verify_document(&body, &public_pem)
            .expect("document proof verifies");
    }

    #[tokio::test]
    async fn build_create_fails_without_key_material() {
        let builder = builder_without_key();

        match builder.build_create(&descriptor()).await {
            Err(AppError::KeyUnavailable(actor)) => assert_eq!(actor, ACTOR),
            other => panic!("expected KeyUnavailable, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn build_interaction_note_carries_text() {
        let (private_pem, _) = generate_test_keypair();
        let builder = builder_with_key(private_pem);

        let activity = builder
            .build_interaction(
                ActivityKind::Note,
                ACTOR,
                "https://remote.example/videos/9",
                Some("<p>Nice ride</p>"),
            )
            .await
            .expect("builds");

        let body: serde_json::Value = serde_json::from_str(&activity.body).expect("valid JSON");
        assert_eq!(body["content"], "<p>Nice ride</p>");
        assert_eq!(body["inReplyTo"], "https://remote.example/videos/9");
    }

    #[tokio::test]
    async fn build_interaction_note_requires_text() {
        let (private_pem, _) = generate_test_keypair();
        let builder = builder_with_key(private_pem);

        let result = builder
            .build_interaction(
                ActivityKind::Note,
                ACTOR,
                "https://remote.example/videos/9",
                None,
            )
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn build_interaction_rejects_non_interaction_kind() {
        let (private_pem, _) = generate_test_keypair();
        let builder = builder_with_key(private_pem);

        let result = builder
            .build_interaction(
                ActivityKind::Delete,
                ACTOR,
                "https://remote.example/videos/9",
                None,
            )
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn build_reject_addresses_original_actor() {
        let (private_pem, _) = generate_test_keypair();
        let builder = builder_with_key(private_pem);

        let activity = builder
            .build_reject(
                ACTOR,
                "https://remote.example/activities/7",
                "https://remote.example/users/bob",
                "Duration exceeds 180 seconds",
            )
            .await
            .expect("builds");

        let body: serde_json::Value = serde_json::from_str(&activity.body).expect("valid JSON");
        assert_eq!(body["object"], "https://remote.example/activities/7");
        assert_eq!(body["to"][0], "https://remote.example/users/bob");
        assert_eq!(body["summary"], "Duration exceeds 180 seconds");
    }

    #[tokio::test]
    async fn build_move_embeds_migrating_identity() {
        let (private_pem, _) = generate_test_keypair();
        let builder = builder_with_key(private_pem);

        let activity = builder
            .build_move(ACTOR, "https://new.example/users/alice/inbox")
            .await
            .expect("builds");

        let body: serde_json::Value = serde_json::from_str(&activity.body).expect("valid JSON");
        assert_eq!(body["object"], ACTOR);
        assert_eq!(body["target"], "https://new.example/users/alice/inbox");
    }
}
