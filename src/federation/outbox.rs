//! Outbound publishing
//!
//! Coordinates the activity builder, follower directory, and delivery
//! scheduler: one content or interaction event in, one persisted
//! activity and a set of queued deliveries out.

use std::sync::Arc;

use chrono::Utc;

use crate::data::{Activity, ActivityKind, ContentRecord, ContentSource, Database, EntityId};
use crate::error::AppError;
use crate::interfaces::{ContentDescriptor, FollowerDirectory};

use super::builder::ActivityBuilder;
use super::delivery::DeliveryScheduler;

/// Outbound publishing surface
pub struct Outbox {
    db: Arc<Database>,
    builder: Arc<ActivityBuilder>,
    scheduler: Arc<DeliveryScheduler>,
    followers: Arc<dyn FollowerDirectory>,
}

impl Outbox {
    pub fn new(
        db: Arc<Database>,
        builder: Arc<ActivityBuilder>,
        scheduler: Arc<DeliveryScheduler>,
        followers: Arc<dyn FollowerDirectory>,
    ) -> Self {
        Self {
            db,
            builder,
            scheduler,
            followers,
        }
    }

    /// Publish newly created content to the actor's followers
    ///
    /// Builds and signs a Create activity, registers the content so
    /// inbound interactions can resolve it, and queues one delivery per
    /// follower inbox.
    ///
    /// # Returns
    /// The persisted activity and the number of queued deliveries.
    pub async fn publish_content(
        &self,
        descriptor: &ContentDescriptor,
    ) -> Result<(Activity, usize), AppError> {
        let activity = self.builder.build_create(descriptor).await?;
        self.db.insert_activity(&activity).await?;

        let content = ContentRecord {
            id: EntityId::new().0,
            uri: descriptor.canonical_url.clone(),
            source: ContentSource::Local.as_str().to_string(),
            stored_content_id: Some(descriptor.id.clone()),
            activity_id: Some(activity.id.clone()),
            origin_actor: descriptor.actor.clone(),
            origin_endpoint: None,
            title: descriptor.title.clone(),
            duration_seconds: Some(descriptor.duration_seconds),
            size_bytes: Some(descriptor.size_bytes),
            like_count: 0,
            share_count: 0,
            comment_count: 0,
            moderation_status: "approved".to_string(),
            created_at: Utc::now(),
        };
        self.db.insert_content(&content).await?;

        let queued = self.deliver_to_followers(&activity).await?;
        Ok((activity, queued))
    }

    /// Publish a Like, Note, or Announce interaction
    pub async fn publish_interaction(
        &self,
        kind: ActivityKind,
        actor: &str,
        target: &str,
        payload: Option<&str>,
    ) -> Result<(Activity, usize), AppError> {
        let activity = self
            .builder
            .build_interaction(kind, actor, target, payload)
            .await?;
        self.db.insert_activity(&activity).await?;

        let queued = self.deliver_to_followers(&activity).await?;
        Ok((activity, queued))
    }

    /// Announce an identity migration to every follower
    pub async fn publish_move(
        &self,
        actor: &str,
        new_endpoint: &str,
    ) -> Result<(Activity, usize), AppError> {
        let activity = self.builder.build_move(actor, new_endpoint).await?;
        self.db.insert_activity(&activity).await?;

        let queued = self.deliver_to_followers(&activity).await?;
        Ok((activity, queued))
    }

    /// Cancel pending deliveries of an activity
    ///
    /// Used when content is deleted locally before delivery completes.
    pub async fn cancel_deliveries(&self, activity_id: &str) -> Result<u64, AppError> {
        self.scheduler.cancel(activity_id).await
    }

    async fn deliver_to_followers(&self, activity: &Activity) -> Result<usize, AppError> {
        let inboxes = self.followers.list_follower_inboxes(&activity.actor).await?;
        if inboxes.is_empty() {
            tracing::debug!(activity = %activity.uri, "No follower inboxes to deliver to");
            return Ok(0);
        }

        self.scheduler.publish(activity, inboxes).await
    }
}
